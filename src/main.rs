//! Command-line front end for the USB2SNES client library.
//!
//! Connects to a bridge, attaches to a device, and runs one operation:
//! listing devices, reading/writing memory, transferring files, watching
//! an address, or capturing/restoring a savestate.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use usb2snes_client::constants::DEFAULT_WATCH_POLL_INTERVAL;
use usb2snes_client::{
    AddressSpec, ClientConfig, MemoryWrite, SavestateController, SnesClient,
};

#[derive(Parser)]
#[command(name = "usb2snes", about = "USB2SNES protocol client", version)]
struct Cli {
    /// Bridge WebSocket endpoint.
    #[arg(long, default_value = "ws://localhost:8080")]
    url: String,

    /// Device to attach to (defaults to the first device listed).
    #[arg(long)]
    device: Option<String>,

    /// Upload chunk size in bytes.
    #[arg(long, default_value_t = 1024)]
    chunk_size: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List devices known to the bridge.
    Devices,
    /// Show firmware version and running ROM.
    Info,
    /// Read memory: `read f50dbe 10` (hex address, hex size).
    Read { address: String, size: String },
    /// Write memory: `write f50dbe 05ff` (hex address, hex bytes).
    Write { address: String, bytes: String },
    /// List a remote directory.
    Ls { path: String },
    /// Download a remote file.
    Get { remote: String, local: PathBuf },
    /// Upload a local file.
    Put { local: PathBuf, remote: String },
    /// Boot a ROM by remote path.
    Boot { rom: String },
    /// Return to the device menu.
    Menu,
    /// Reset the console.
    Reset,
    /// Watch an address and print changes until interrupted.
    Watch {
        address: String,
        size: String,
        /// Poll interval in milliseconds.
        #[arg(long, default_value_t = DEFAULT_WATCH_POLL_INTERVAL.as_millis() as u64)]
        interval_ms: u64,
    },
    /// Capture a savestate to a local file.
    SaveState { out: PathBuf },
    /// Restore a savestate from a local file.
    LoadState { blob: PathBuf },
}

/// Parse a hex argument, tolerating an optional `0x` prefix.
fn parse_hex(text: &str) -> Result<u32> {
    let trimmed = text.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(trimmed, 16).with_context(|| format!("invalid hex value: {text}"))
}

/// Parse a hex byte string like `05ff` into bytes.
fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        bail!("hex byte string must have even length: {text}");
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte at offset {i}: {text}"))
        })
        .collect()
}

async fn attach(client: &SnesClient, preferred: Option<&str>) -> Result<String> {
    let device = match preferred {
        Some(name) => name.to_string(),
        None => {
            let devices = client.device_list().await?;
            devices
                .first()
                .cloned()
                .context("no devices reported by the bridge")?
        }
    };
    client.attach(&device).await?;
    Ok(device)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = ClientConfig {
        chunk_size: cli.chunk_size,
        ..ClientConfig::default()
    };
    let client = SnesClient::new(config);
    client.connect(&cli.url).await?;

    if let Command::Devices = cli.command {
        for device in client.device_list().await? {
            println!("{device}");
        }
        return Ok(());
    }

    let device = attach(&client, cli.device.as_deref()).await?;
    log::debug!("attached to {device}");

    match cli.command {
        Command::Devices => unreachable!("handled before attach"),
        Command::Info => {
            let info = client.info().await?;
            println!("firmware: {}", info.firmware_version.as_deref().unwrap_or("?"));
            println!("version:  {}", info.version_string.as_deref().unwrap_or("?"));
            println!("rom:      {}", info.rom_running.as_deref().unwrap_or("?"));
        }
        Command::Read { address, size } => {
            let data = client
                .read_address(parse_hex(&address)?, parse_hex(&size)?)
                .await?;
            for chunk in data.chunks(16) {
                let line: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                println!("{}", line.join(" "));
            }
        }
        Command::Write { address, bytes } => {
            let write = MemoryWrite::single(parse_hex(&address)?, parse_hex_bytes(&bytes)?)?;
            client.write_address(&write).await?;
            println!("ok");
        }
        Command::Ls { path } => {
            for entry in client.list_dir(&path).await? {
                println!("{:?}\t{}", entry.kind, entry.name);
            }
        }
        Command::Get { remote, local } => {
            let progress: Box<dyn Fn(u64, u64) + Send + Sync> = Box::new(|done, total| {
                log::info!("download: {done}/{total} bytes");
            });
            let data = client
                .get_file_blocking(&remote, None, Some(progress.as_ref()))
                .await?;
            tokio::fs::write(&local, data)
                .await
                .with_context(|| format!("writing {}", local.display()))?;
            println!("saved {}", local.display());
        }
        Command::Put { local, remote } => {
            let progress: Box<dyn Fn(u64, u64) + Send + Sync> = Box::new(|done, total| {
                log::info!("upload: {done}/{total} bytes");
            });
            client
                .put_file_blocking(&local, &remote, None, Some(progress.as_ref()))
                .await?;
            println!("uploaded {remote}");
        }
        Command::Boot { rom } => {
            client.boot(&rom).await?;
            println!("booting {rom}");
        }
        Command::Menu => client.menu().await?,
        Command::Reset => client.reset().await?,
        Command::Watch {
            address,
            size,
            interval_ms,
        } => {
            let spec = AddressSpec::new(parse_hex(&address)?, parse_hex(&size)?)?;
            let watcher = client.create_watcher(
                vec![spec],
                Duration::from_millis(interval_ms),
                |changes| {
                    for change in changes {
                        println!(
                            "{:#x}: {:02x?} -> {:02x?}",
                            change.address, change.old_value, change.new_value
                        );
                    }
                },
            );
            watcher.start().await?;
            tokio::signal::ctrl_c().await?;
            watcher.stop();
        }
        Command::SaveState { out } => {
            let info = client.info().await?;
            let controller = SavestateController::with_firmware(
                client.clone(),
                info.firmware_version.as_deref().unwrap_or(""),
            );
            let blob = controller.save().await?;
            tokio::fs::write(&out, blob)
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            println!("savestate written to {}", out.display());
        }
        Command::LoadState { blob } => {
            let data = tokio::fs::read(&blob)
                .await
                .with_context(|| format!("reading {}", blob.display()))?;
            let info = client.info().await?;
            let controller = SavestateController::with_firmware(
                client.clone(),
                info.firmware_version.as_deref().unwrap_or(""),
            );
            controller.load(&data).await?;
            println!("savestate restored");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_accepts_optional_prefix() {
        assert_eq!(parse_hex("f50dbe").unwrap(), 0xF5_0DBE);
        assert_eq!(parse_hex("0xF50DBE").unwrap(), 0xF5_0DBE);
        assert!(parse_hex("not-hex").is_err());
    }

    #[test]
    fn parse_hex_bytes_pairs() {
        assert_eq!(parse_hex_bytes("05ff").unwrap(), vec![0x05, 0xFF]);
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }
}
