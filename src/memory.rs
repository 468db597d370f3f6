//! Memory I/O: semantic (address, size) reads and batched writes.
//!
//! Reads carry an exact-byte-count invariant: the bridge must deliver
//! precisely the requested total across one or more binary frames, or the
//! stream is considered desynchronized and the connection is torn down.
//!
//! Writes split by device class. Directly writable devices take one framed
//! request + payload per pair. CMD-space-only devices refuse direct writes
//! outside their register window but will execute a short injected program,
//! so the whole batch is assembled into fixed LDA/STA instruction templates
//! and triggered through the reserved command buffer.

use crate::connection::{link_of, SnesClient};
use crate::constants::{READ_REPLY_TIMEOUT, WRAM_BANK_BASE, WRAM_SIZE, WRAM_START};
use crate::error::{ClientError, Result};
use crate::protocol::{hex_operand, Opcode, Request};

/// How the attached device accepts writes. Decided once at attach time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceClass {
    /// Accepts `PutAddress` anywhere in the exposed address space.
    DirectWritable,
    /// Only executes writes via a program injected into the CMD buffer.
    CmdSpaceOnly,
}

impl DeviceClass {
    /// Classify a device by its reported name.
    ///
    /// sd2snes hardware (by name, or exposed as a `COMn` serial port) needs
    /// the CMD-space workaround; every other bridge target is directly
    /// writable.
    pub fn from_device_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        let is_com_port = name.len() == 4
            && name.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("COM"))
            && name[3..].chars().all(|c| c.is_ascii_digit());
        if lower.contains("sd2snes") || is_com_port {
            Self::CmdSpaceOnly
        } else {
            Self::DirectWritable
        }
    }
}

/// A memory region described by address and size. Purely descriptive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpec {
    /// Start address in the unified address space.
    pub address: u32,
    /// Region size in bytes.
    pub size: u32,
}

impl AddressSpec {
    /// Create a region spec.
    ///
    /// # Errors
    ///
    /// [`ClientError::Validation`] for a zero-size region.
    pub fn new(address: u32, size: u32) -> Result<Self> {
        if size == 0 {
            return Err(ClientError::Validation(format!(
                "zero-size read at {address:#x}"
            )));
        }
        Ok(Self { address, size })
    }
}

/// An ordered batch of `(address, payload)` write pairs submitted together.
///
/// On directly writable devices each pair becomes one wire write; on
/// CMD-space-only devices the whole batch becomes one injected program
/// executed atomically by firmware.
#[derive(Clone, Debug, Default)]
pub struct MemoryWrite {
    pairs: Vec<(u32, Vec<u8>)>,
}

impl MemoryWrite {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a batch with a single pair.
    ///
    /// # Errors
    ///
    /// [`ClientError::Validation`] for an empty payload.
    pub fn single(address: u32, data: Vec<u8>) -> Result<Self> {
        let mut write = Self::new();
        write.push(address, data)?;
        Ok(write)
    }

    /// Append a pair to the batch.
    ///
    /// # Errors
    ///
    /// [`ClientError::Validation`] for an empty payload.
    pub fn push(&mut self, address: u32, data: Vec<u8>) -> Result<()> {
        if data.is_empty() {
            return Err(ClientError::Validation(format!(
                "empty write payload at {address:#x}"
            )));
        }
        self.pairs.push((address, data));
        Ok(())
    }

    /// The ordered pairs.
    pub fn pairs(&self) -> &[(u32, Vec<u8>)] {
        &self.pairs
    }

    /// Whether the batch holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl SnesClient {
    /// Read `size` bytes starting at `address`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Protocol`] (connection torn down) unless exactly
    /// `size` bytes arrive; [`ClientError::Connection`] when not attached.
    pub async fn read_address(&self, address: u32, size: u32) -> Result<Vec<u8>> {
        let spec = AddressSpec::new(address, size)?;
        let mut regions = self.read_addresses(&[spec]).await?;
        Ok(regions.pop().unwrap_or_default())
    }

    /// Read multiple regions in one wire round trip.
    ///
    /// The bridge concatenates all regions into one binary reply; this
    /// splits it back into per-region chunks in request order. Prefer this
    /// over repeated single reads whenever more than one region is needed
    /// in the same instant — it is the backbone of both savestate flag
    /// polling and the memory watcher.
    ///
    /// # Errors
    ///
    /// As [`SnesClient::read_address`].
    pub async fn read_addresses(&self, specs: &[AddressSpec]) -> Result<Vec<Vec<u8>>> {
        self.require_attached()?;
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let mut operands = Vec::with_capacity(specs.len() * 2);
        let mut total = 0usize;
        for spec in specs {
            operands.push(hex_operand(spec.address));
            operands.push(hex_operand(spec.size));
            total += spec.size as usize;
        }

        let mut guard = self.lock_link().await;
        let result = async {
            let link = link_of(&mut guard)?;
            link.send_request(&Request::new(Opcode::GetAddress, operands))
                .await?;

            let mut data = Vec::with_capacity(total);
            while data.len() < total {
                match link.recv_binary(READ_REPLY_TIMEOUT).await {
                    Ok(chunk) => data.extend_from_slice(&chunk),
                    Err(ClientError::Connection(_)) => break,
                    Err(e) => return Err(e),
                }
            }
            if data.len() != total {
                return Err(ClientError::Protocol(format!(
                    "read returned wrong byte count: requested {total}, received {}",
                    data.len()
                )));
            }

            let mut regions = Vec::with_capacity(specs.len());
            let mut consumed = 0usize;
            for spec in specs {
                let next = consumed + spec.size as usize;
                regions.push(data[consumed..next].to_vec());
                consumed = next;
            }
            Ok(regions)
        }
        .await;
        self.finish(&mut guard, result)
    }

    /// Submit a write batch.
    ///
    /// # Errors
    ///
    /// On a CMD-space-only device, [`ClientError::Validation`] before any
    /// bytes are sent if any target lies outside the writable WRAM window.
    /// [`ClientError::Connection`] when not attached or the send fails.
    pub async fn write_address(&self, write: &MemoryWrite) -> Result<()> {
        self.require_attached()?;
        if write.is_empty() {
            return Ok(());
        }

        match self.device_class()? {
            DeviceClass::DirectWritable => self.write_direct(write).await,
            DeviceClass::CmdSpaceOnly => self.write_via_cmd_space(write).await,
        }
    }

    /// Direct path: one request/payload pair per write, all inside one gate
    /// acquisition so concurrent callers cannot interleave.
    async fn write_direct(&self, write: &MemoryWrite) -> Result<()> {
        let mut guard = self.lock_link().await;
        let result = async {
            let link = link_of(&mut guard)?;
            for (address, data) in write.pairs() {
                let request = Request::new(
                    Opcode::PutAddress,
                    vec![hex_operand(*address), hex_operand(data.len() as u32)],
                );
                link.send_request(&request).await?;
                link.send_payload(data.clone()).await?;
            }
            Ok(())
        }
        .await;
        self.finish(&mut guard, result)
    }

    /// CMD path: assemble the whole batch into one program and trigger it.
    async fn write_via_cmd_space(&self, write: &MemoryWrite) -> Result<()> {
        // Window check before any bytes go out.
        for (address, data) in write.pairs() {
            check_wram_window(*address, data.len())?;
        }
        let program = assemble_cmd_program(write.pairs());

        let mut guard = self.lock_link().await;
        let result = async {
            let link = link_of(&mut guard)?;
            let request = Request::cmd_space(
                Opcode::PutAddress,
                vec![
                    CMD_BUFFER_OPERAND.to_string(),
                    hex_operand(program.len() as u32 - 1),
                    CMD_BUFFER_OPERAND.to_string(),
                    "1".to_string(),
                ],
            );
            link.send_request(&request).await?;
            link.send_payload(program).await?;
            Ok(())
        }
        .await;
        self.finish(&mut guard, result)
    }
}

/// Operand for the reserved command buffer address.
const CMD_BUFFER_OPERAND: &str = "2C00";

/// Program prologue: pad byte, SEP #$20 (8-bit accumulator), PHA, XBA, PHA —
/// saves processor state before the generated stores run.
const CMD_PROLOGUE: [u8; 6] = [0x00, 0xE2, 0x20, 0x48, 0xEB, 0x48];

/// Program epilogue: clear the command-trigger byte, restore processor
/// state, and jump back into firmware.
const CMD_EPILOGUE: [u8; 14] = [
    0xA9, 0x00, 0x8F, 0x00, 0x2C, 0x00, 0x68, 0xEB, 0x68, 0x28, 0x6C, 0xEA, 0xFF, 0x08,
];

/// LDA immediate opcode.
const OP_LDA_IMM: u8 = 0xA9;

/// STA absolute-long opcode.
const OP_STA_LONG: u8 = 0x8F;

/// Reject targets outside the writable WRAM window.
fn check_wram_window(address: u32, len: usize) -> Result<()> {
    let end = address as u64 + len as u64;
    if address < WRAM_START || end > (WRAM_START + WRAM_SIZE) as u64 {
        return Err(ClientError::Validation(format!(
            "write outside writable window: {address:#x} ({len} bytes)"
        )));
    }
    Ok(())
}

/// Assemble one LDA-immediate/STA-absolute-long pair per payload byte,
/// wrapped in the fixed prologue/epilogue. Targets are shifted from the
/// protocol's WRAM window into the console's own WRAM bank so the stores
/// land where firmware expects them.
///
/// Callers must have window-checked every pair first.
fn assemble_cmd_program(pairs: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let body_len: usize = pairs.iter().map(|(_, data)| data.len() * 6).sum();
    let mut program = Vec::with_capacity(CMD_PROLOGUE.len() + body_len + CMD_EPILOGUE.len());
    program.extend_from_slice(&CMD_PROLOGUE);

    for (address, data) in pairs {
        let base = address + WRAM_BANK_BASE - WRAM_START;
        for (offset, byte) in data.iter().enumerate() {
            let target = base + offset as u32;
            program.push(OP_LDA_IMM);
            program.push(*byte);
            program.push(OP_STA_LONG);
            program.push((target & 0xFF) as u8);
            program.push(((target >> 8) & 0xFF) as u8);
            program.push(((target >> 16) & 0xFF) as u8);
        }
    }

    program.extend_from_slice(&CMD_EPILOGUE);
    program
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_sd2snes_and_com_ports_as_cmd_only() {
        assert_eq!(
            DeviceClass::from_device_name("SD2SNES COM3"),
            DeviceClass::CmdSpaceOnly
        );
        assert_eq!(
            DeviceClass::from_device_name("sd2snes"),
            DeviceClass::CmdSpaceOnly
        );
        assert_eq!(DeviceClass::from_device_name("COM4"), DeviceClass::CmdSpaceOnly);
    }

    #[test]
    fn classify_everything_else_as_direct() {
        assert_eq!(
            DeviceClass::from_device_name("RetroArch"),
            DeviceClass::DirectWritable
        );
        assert_eq!(
            DeviceClass::from_device_name("SNES9x emu"),
            DeviceClass::DirectWritable
        );
        // "COMX" is not a serial port
        assert_eq!(
            DeviceClass::from_device_name("COMX"),
            DeviceClass::DirectWritable
        );
    }

    #[test]
    fn zero_size_spec_rejected() {
        assert!(matches!(
            AddressSpec::new(WRAM_START, 0),
            Err(ClientError::Validation(_))
        ));
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(matches!(
            MemoryWrite::single(WRAM_START, vec![]),
            Err(ClientError::Validation(_))
        ));
    }

    #[test]
    fn window_check_bounds() {
        assert!(check_wram_window(WRAM_START, 1).is_ok());
        assert!(check_wram_window(WRAM_START + WRAM_SIZE - 4, 4).is_ok());
        assert!(check_wram_window(WRAM_START - 1, 1).is_err());
        assert!(check_wram_window(WRAM_START + WRAM_SIZE - 1, 2).is_err());
        // SRAM is outside the writable window for CMD-space devices.
        assert!(check_wram_window(crate::constants::SRAM_START, 1).is_err());
    }

    #[test]
    fn assembled_program_encodes_one_store_per_byte() {
        // Write 0x05 to WRAM offset 0x0DBE: console-visible 0x7E0DBE.
        let pairs = vec![(WRAM_START + 0x0DBE, vec![0x05])];
        let program = assemble_cmd_program(&pairs);

        let expected_body = [OP_LDA_IMM, 0x05, OP_STA_LONG, 0xBE, 0x0D, 0x7E];
        assert_eq!(&program[..6], &CMD_PROLOGUE);
        assert_eq!(&program[6..12], &expected_body);
        assert_eq!(&program[12..], &CMD_EPILOGUE);
    }

    #[test]
    fn assembled_program_increments_target_per_byte() {
        let pairs = vec![(WRAM_START, vec![0xAA, 0xBB])];
        let program = assemble_cmd_program(&pairs);
        let body = &program[CMD_PROLOGUE.len()..program.len() - CMD_EPILOGUE.len()];
        assert_eq!(body.len(), 12);
        // First store at 0x7E0000, second at 0x7E0001.
        assert_eq!(&body[..6], &[OP_LDA_IMM, 0xAA, OP_STA_LONG, 0x00, 0x00, 0x7E]);
        assert_eq!(&body[6..], &[OP_LDA_IMM, 0xBB, OP_STA_LONG, 0x01, 0x00, 0x7E]);
    }

    #[test]
    fn batch_becomes_one_program() {
        let pairs = vec![
            (WRAM_START + 0x10, vec![0x01]),
            (WRAM_START + 0x20, vec![0x02, 0x03]),
        ];
        let program = assemble_cmd_program(&pairs);
        let expected_len = CMD_PROLOGUE.len() + 3 * 6 + CMD_EPILOGUE.len();
        assert_eq!(program.len(), expected_len);
    }

    #[tokio::test]
    async fn write_when_disconnected_fails_fast() {
        let client = SnesClient::default();
        let write = MemoryWrite::single(WRAM_START, vec![1]).unwrap();
        assert!(matches!(
            client.write_address(&write).await,
            Err(ClientError::Connection(_))
        ));
    }
}
