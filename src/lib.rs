//! Async client for the USB2SNES/QUsb2snes WebSocket protocol.
//!
//! Talks to a local bridge process that exposes console memory over the
//! network: memory reads and writes, chunked file transfer, memory
//! watching, and flag-handshake savestates.
//!
//! # Architecture
//!
//! - [`connection`] - connection lifecycle, the background receive task,
//!   and the request gate that serializes all exchanges
//! - [`memory`] - (address, size) reads, batched reads, and writes
//!   (including the CMD-space workaround for sd2snes hardware)
//! - [`files`] - chunked upload/download with verification and blocking
//!   variants
//! - [`watcher`] - poll-diff-callback sessions and one-shot waits
//! - [`savestate`] - 320 KiB savestate capture/restore over memory I/O
//!
//! # Example
//!
//! ```no_run
//! use usb2snes_client::{ClientConfig, MemoryWrite, SnesClient};
//!
//! # async fn run() -> usb2snes_client::Result<()> {
//! let client = SnesClient::new(ClientConfig::default());
//! client.connect("ws://localhost:8080").await?;
//! let devices = client.device_list().await?;
//! client.attach(&devices[0]).await?;
//!
//! client
//!     .write_address(&MemoryWrite::single(0xF5_0DBE, vec![0x05])?)
//!     .await?;
//! let byte = client.read_address(0xF5_0DBE, 1).await?;
//! assert_eq!(byte, vec![0x05]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod files;
pub mod memory;
pub mod protocol;
pub mod savestate;
pub mod watcher;
pub mod ws;

// Re-export the public surface at the crate root.
pub use config::ClientConfig;
pub use connection::{ConnectionState, DeviceInfo, SnesClient};
pub use error::{ClientError, Result};
pub use files::{DirEntry, EntryKind, ProgressFn};
pub use memory::{AddressSpec, DeviceClass, MemoryWrite};
pub use savestate::{SavestateController, SavestatePhase};
pub use watcher::{ChangeEntry, Condition, MemoryWatcher, ValueCheck};
