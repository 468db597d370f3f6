//! Savestate capture/restore, layered entirely on memory I/O.
//!
//! The device exposes two control flags (save, load) at a firmware-version-
//! dependent address and a fixed 320 KiB data region. A transfer is a
//! handshake: wait until both flags read zero ("safe"), write the trigger
//! flag, wait for the flags to clear again while the firmware performs the
//! capture/restore, then move the blob.
//!
//! Requires a ROM patched with the savestate interface;
//! [`SavestateController::supported`] probes for it.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::connection::SnesClient;
use crate::constants::{
    SAFE_STATE_POLL_INTERVAL, SAFE_STATE_TIMEOUT, SAVESTATE_DATA_ADDRESS,
    SAVESTATE_INTERFACE_ADDRESS_NEW, SAVESTATE_INTERFACE_ADDRESS_OLD, SAVESTATE_OPERATION_TIMEOUT,
    SAVESTATE_SETTLE_DELAY, SAVESTATE_SIZE,
};
use crate::error::{ClientError, Result};
use crate::memory::{AddressSpec, MemoryWrite};

/// Where the controller is in a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SavestatePhase {
    /// No transfer in progress.
    Idle,
    /// Waiting for both control flags to read zero.
    WaitingSafe,
    /// Moving the blob or waiting for the firmware to finish.
    Transferring,
}

/// Savestate capture/restore controller.
///
/// Construct with [`SavestateController::with_firmware`] using the version
/// string from [`SnesClient::info`]; without it the controller falls back
/// to the pre-11 control address.
pub struct SavestateController {
    client: SnesClient,
    interface_address: u32,
    phase: StdMutex<SavestatePhase>,
}

impl std::fmt::Debug for SavestateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavestateController")
            .field("interface_address", &self.interface_address)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl SavestateController {
    /// Create a controller using the pre-firmware-11 control address.
    pub fn new(client: SnesClient) -> Self {
        Self {
            client,
            interface_address: SAVESTATE_INTERFACE_ADDRESS_OLD,
            phase: StdMutex::new(SavestatePhase::Idle),
        }
    }

    /// Create a controller with the control address selected from the
    /// reported firmware version.
    pub fn with_firmware(client: SnesClient, firmware_version: &str) -> Self {
        let mut controller = Self::new(client);
        controller.set_firmware_version(firmware_version);
        controller
    }

    /// Re-select the control address from a firmware version string.
    pub fn set_firmware_version(&mut self, firmware_version: &str) {
        self.interface_address = select_interface_address(firmware_version);
        log::debug!(
            "savestate interface at {:#x} (firmware {firmware_version:?})",
            self.interface_address
        );
    }

    /// Control-flag address currently in use.
    pub fn interface_address(&self) -> u32 {
        self.interface_address
    }

    /// Current transfer phase.
    pub fn phase(&self) -> SavestatePhase {
        *self.phase.lock().expect("phase lock poisoned")
    }

    /// Probe whether the running ROM exposes the savestate interface.
    pub async fn supported(&self) -> bool {
        self.read_flags().await.is_ok()
    }

    /// Capture a savestate, returning the 320 KiB blob.
    ///
    /// # Errors
    ///
    /// [`ClientError::Timeout`] if the device never reaches a safe state or
    /// the capture does not complete in time; read/write errors propagate.
    pub async fn save(&self) -> Result<Vec<u8>> {
        let result = self.save_inner().await;
        self.set_phase(SavestatePhase::Idle);
        result
    }

    async fn save_inner(&self) -> Result<Vec<u8>> {
        log::info!("capturing savestate");
        self.set_phase(SavestatePhase::WaitingSafe);
        self.wait_for_safe_state(SAFE_STATE_TIMEOUT).await?;

        self.set_phase(SavestatePhase::Transferring);
        // Raise the save flag; firmware clears both when the capture is done.
        self.client
            .write_address(&MemoryWrite::single(self.interface_address, vec![1, 0])?)
            .await?;
        tokio::time::sleep(SAVESTATE_SETTLE_DELAY).await;
        self.wait_for_safe_state(SAVESTATE_OPERATION_TIMEOUT).await?;

        let data = self
            .client
            .read_address(SAVESTATE_DATA_ADDRESS, SAVESTATE_SIZE as u32)
            .await?;
        log::info!("savestate captured ({} bytes)", data.len());
        Ok(data)
    }

    /// Restore a previously captured savestate.
    ///
    /// # Errors
    ///
    /// [`ClientError::Validation`] unless `blob` is exactly 320 KiB;
    /// otherwise as [`SavestateController::save`].
    pub async fn load(&self, blob: &[u8]) -> Result<()> {
        if blob.len() != SAVESTATE_SIZE {
            return Err(ClientError::Validation(format!(
                "savestate blob must be {SAVESTATE_SIZE} bytes, got {}",
                blob.len()
            )));
        }
        let result = self.load_inner(blob).await;
        self.set_phase(SavestatePhase::Idle);
        result
    }

    async fn load_inner(&self, blob: &[u8]) -> Result<()> {
        log::info!("restoring savestate");
        self.set_phase(SavestatePhase::WaitingSafe);
        self.wait_for_safe_state(SAFE_STATE_TIMEOUT).await?;

        self.set_phase(SavestatePhase::Transferring);
        self.client
            .write_address(&MemoryWrite::single(
                SAVESTATE_DATA_ADDRESS,
                blob.to_vec(),
            )?)
            .await?;
        // Raise the load flag (second byte of the control word).
        self.client
            .write_address(&MemoryWrite::single(self.interface_address + 1, vec![1])?)
            .await?;
        tokio::time::sleep(SAVESTATE_SETTLE_DELAY).await;
        self.wait_for_safe_state(SAVESTATE_OPERATION_TIMEOUT).await?;

        log::info!("savestate restored");
        Ok(())
    }

    /// Read the (save, load) control flags in one batched read.
    async fn read_flags(&self) -> Result<(u8, u8)> {
        let specs = [
            AddressSpec::new(self.interface_address, 1)?,
            AddressSpec::new(self.interface_address + 1, 1)?,
        ];
        let regions = self.client.read_addresses(&specs).await?;
        let save = regions.first().and_then(|r| r.first()).copied().unwrap_or(0);
        let load = regions.get(1).and_then(|r| r.first()).copied().unwrap_or(0);
        Ok((save, load))
    }

    /// Poll until both control flags read zero.
    async fn wait_for_safe_state(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let (save, load) = self.read_flags().await?;
            if save == 0 && load == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout(format!(
                    "device not safe within {timeout:?} (flags: save={save}, load={load})"
                )));
            }
            tokio::time::sleep(SAFE_STATE_POLL_INTERVAL).await;
        }
    }

    fn set_phase(&self, phase: SavestatePhase) {
        *self.phase.lock().expect("phase lock poisoned") = phase;
    }
}

/// Pick the control address for a firmware version string: the first
/// integer in the string decides (11 and later moved the interface).
fn select_interface_address(firmware_version: &str) -> u32 {
    let major: Option<u32> = firmware_version
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok();
    match major {
        Some(major) if major >= 11 => SAVESTATE_INTERFACE_ADDRESS_NEW,
        _ => SAVESTATE_INTERFACE_ADDRESS_OLD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_11_and_later_use_new_interface() {
        assert_eq!(
            select_interface_address("11"),
            SAVESTATE_INTERFACE_ADDRESS_NEW
        );
        assert_eq!(
            select_interface_address("v11.2"),
            SAVESTATE_INTERFACE_ADDRESS_NEW
        );
        assert_eq!(
            select_interface_address("13.0.0"),
            SAVESTATE_INTERFACE_ADDRESS_NEW
        );
    }

    #[test]
    fn older_or_unparseable_firmware_falls_back_to_old_interface() {
        assert_eq!(
            select_interface_address("10.3"),
            SAVESTATE_INTERFACE_ADDRESS_OLD
        );
        assert_eq!(
            select_interface_address("1.11.0"),
            SAVESTATE_INTERFACE_ADDRESS_OLD
        );
        assert_eq!(select_interface_address(""), SAVESTATE_INTERFACE_ADDRESS_OLD);
        assert_eq!(
            select_interface_address("unknown"),
            SAVESTATE_INTERFACE_ADDRESS_OLD
        );
    }

    #[test]
    fn wrong_blob_size_rejected_before_io() {
        let client = SnesClient::default();
        let controller = SavestateController::new(client);
        let result = futures_util::future::FutureExt::now_or_never(
            controller.load(&[0u8; 16]),
        )
        .expect("validation is synchronous");
        assert!(matches!(result, Err(ClientError::Validation(_))));
    }

    #[test]
    fn controller_starts_idle() {
        let controller = SavestateController::new(SnesClient::default());
        assert_eq!(controller.phase(), SavestatePhase::Idle);
        assert_eq!(
            controller.interface_address(),
            SAVESTATE_INTERFACE_ADDRESS_OLD
        );
    }
}
