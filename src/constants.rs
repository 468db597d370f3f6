//! Protocol constants for the USB2SNES client.
//!
//! This module centralizes the fixed addresses, sizes, and timeouts of the
//! protocol so they are discoverable in one place. Constants are grouped by
//! domain.

use std::time::Duration;

// ============================================================================
// Address space
// ============================================================================

/// Start of the persistent-storage (SRAM) range.
pub const SRAM_START: u32 = 0xE0_0000;

/// Start of the directly addressable working-RAM window.
pub const WRAM_START: u32 = 0xF5_0000;

/// Size of the working-RAM window.
pub const WRAM_SIZE: u32 = 0x2_0000;

/// Console-visible base of the WRAM bank. The CMD-space write workaround
/// remaps `WRAM_START..WRAM_START + WRAM_SIZE` onto this bank so the
/// injected program stores through the console's own address space.
pub const WRAM_BANK_BASE: u32 = 0x7E_0000;

// ============================================================================
// Timeouts
// ============================================================================

/// Bounded wait for a control reply (DeviceList, Info, List, GetFile size).
///
/// Control replies are small and arrive promptly from a healthy bridge;
/// 5 seconds of silence means the exchange is lost and the connection is
/// torn down.
pub const CONTROL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded wait for each binary frame of a memory read.
pub const READ_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded wait for each binary frame of a file download.
///
/// Longer than memory reads: SD card access on real hardware can stall
/// between frames.
pub const FILE_DATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Flat overall deadline for blocking downloads.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Floor for the size-proportional blocking upload deadline.
pub const MIN_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Default seconds-per-megabyte for the blocking upload deadline.
pub const DEFAULT_TIMEOUT_PER_MB: u64 = 10;

// ============================================================================
// File transfer
// ============================================================================

/// Default upload chunk size in bytes.
///
/// 1024 gives good flow control on real hardware; stable connections can
/// raise this to 4096 via [`crate::ClientConfig::chunk_size`].
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Settle delay before re-listing the destination after an upload, giving
/// the device time to flush the file to storage.
pub const UPLOAD_VERIFY_DELAY: Duration = Duration::from_secs(1);

/// Cap on up-front buffer allocation for a download. The declared size
/// comes off the wire, so it is not trusted for allocation; buffers for
/// larger files grow as frames arrive.
pub const DOWNLOAD_PREALLOC_LIMIT: usize = 4 * 1024 * 1024;

// ============================================================================
// Savestates
// ============================================================================

/// Fixed size of a savestate blob.
pub const SAVESTATE_SIZE: usize = 320 * 1024;

/// Address of the bulk savestate data region.
pub const SAVESTATE_DATA_ADDRESS: u32 = 0xF0_0000;

/// Control-flag address used by firmware versions below 11.
pub const SAVESTATE_INTERFACE_ADDRESS_OLD: u32 = 0xFC_2000;

/// Control-flag address used by firmware 11 and later.
pub const SAVESTATE_INTERFACE_ADDRESS_NEW: u32 = 0xFE_1000;

/// Poll interval while waiting for the save/load flags to clear.
pub const SAFE_STATE_POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Bounded wait for the device to reach a safe state before a transfer.
pub const SAFE_STATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded wait for a triggered save/load to complete. Longer than the
/// safe-state wait since the device is copying 320 KiB.
pub const SAVESTATE_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between writing a trigger flag and polling for completion, so the
/// firmware has a chance to raise the flag first.
pub const SAVESTATE_SETTLE_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Watching
// ============================================================================

/// Default poll interval for memory watchers (10 Hz).
pub const DEFAULT_WATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);
