//! Wire frames for the USB2SNES protocol.
//!
//! Requests are JSON text frames shaped as `{"Opcode", "Space", "Operands"}`,
//! optionally followed by raw binary frames (writes, uploads). Replies are
//! either a JSON frame with a `Results` array or one or more raw binary
//! frames (reads, downloads). The protocol carries no request identifiers;
//! ordering is the only correlation.
//!
//! Address and size operands are hexadecimal strings without a `0x` prefix.

use serde::{Deserialize, Serialize};

/// Request opcodes consumed by this client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Opcode {
    /// List devices known to the bridge.
    DeviceList,
    /// Attach to a device by name. No reply.
    Attach,
    /// Query firmware version / version string / running ROM.
    Info,
    /// Register a client name with the bridge. No reply.
    Name,
    /// Boot a ROM by path. No reply.
    Boot,
    /// Return to the device menu. No reply.
    Menu,
    /// Reset the console. No reply.
    Reset,
    /// Read one or more memory regions. Binary reply.
    GetAddress,
    /// Write a memory region. Followed by one binary payload frame.
    PutAddress,
    /// List a directory. JSON reply with alternating type/name results.
    List,
    /// Create a directory. No reply.
    MakeDir,
    /// Remove a file or directory. No reply.
    Remove,
    /// Download a file. JSON size reply, then binary frames.
    GetFile,
    /// Upload a file. Followed by binary chunk frames.
    PutFile,
}

/// Address space a request operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Space {
    /// The console's unified address space (default for everything).
    Snes,
    /// The reserved command buffer used by the write workaround.
    Cmd,
}

/// A JSON request frame.
#[derive(Debug, Serialize)]
pub struct Request {
    /// Operation to perform.
    #[serde(rename = "Opcode")]
    pub opcode: Opcode,
    /// Address space the operation targets.
    #[serde(rename = "Space")]
    pub space: Space,
    /// Optional protocol flags; unused by this client.
    #[serde(rename = "Flags", skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
    /// Operation arguments; empty for argument-less opcodes.
    #[serde(rename = "Operands", skip_serializing_if = "Vec::is_empty")]
    pub operands: Vec<String>,
}

impl Request {
    /// Build a request in the `SNES` space.
    pub fn new(opcode: Opcode, operands: Vec<String>) -> Self {
        Self {
            opcode,
            space: Space::Snes,
            flags: None,
            operands,
        }
    }

    /// Build a request in the `CMD` space.
    pub fn cmd_space(opcode: Opcode, operands: Vec<String>) -> Self {
        Self {
            opcode,
            space: Space::Cmd,
            flags: None,
            operands,
        }
    }
}

/// A JSON reply frame.
#[derive(Debug, Default, Deserialize)]
pub struct Reply {
    /// Flat results array; meaning depends on the request opcode.
    #[serde(rename = "Results", default)]
    pub results: Vec<String>,
}

/// Format an address or size operand as hex without a `0x` prefix.
pub fn hex_operand(value: u32) -> String {
    format!("{value:x}")
}

/// Parse a hex operand (as found in `Results`, e.g. a GetFile size).
pub fn parse_hex_operand(text: &str) -> Option<u64> {
    u64::from_str_radix(text.trim(), 16).ok()
}
