//! Memory watching: a generic poll-diff-callback engine over address
//! regions, plus one-shot "wait until condition" helpers.
//!
//! A watcher session polls its whole region set with one batched read per
//! cycle and never starts a new cycle before the previous one completed,
//! so watcher traffic and application traffic interleave at request-gate
//! granularity — the single-in-flight invariant holds under concurrent
//! callers.
//!
//! Transient poll errors are logged and swallowed: a watcher is defined to
//! be resilient to blips. The one-shot helpers surface read errors instead,
//! since their result *is* the read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::connection::SnesClient;
use crate::error::{ClientError, Result};
use crate::memory::AddressSpec;

/// One changed region, reported to the change callback.
#[derive(Clone, Debug)]
pub struct ChangeEntry {
    /// Index of the region in the watcher's address list.
    pub index: usize,
    /// Region start address.
    pub address: u32,
    /// Region size in bytes.
    pub size: u32,
    /// Bytes from the previous snapshot.
    pub old_value: Vec<u8>,
    /// Bytes from the current snapshot.
    pub new_value: Vec<u8>,
}

/// Change callback invoked with every differing region of a poll cycle.
pub type ChangeFn = dyn Fn(&[ChangeEntry]) + Send + Sync;

/// A condition over one region for [`SnesClient::watch_for_conditions`].
pub struct Condition {
    /// Region to read.
    pub spec: AddressSpec,
    /// Check applied to the region's bytes.
    pub check: ValueCheck,
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// What a one-shot watch is waiting for.
pub enum ValueCheck {
    /// The region equals these exact bytes.
    Exact(Vec<u8>),
    /// The region's first byte equals this value.
    Byte(u8),
    /// A caller-supplied predicate over the raw bytes.
    Predicate(Box<dyn Fn(&[u8]) -> bool + Send + Sync>),
}

impl ValueCheck {
    /// Apply the check to a freshly read region.
    pub fn matches(&self, buf: &[u8]) -> bool {
        match self {
            Self::Exact(expected) => buf == expected.as_slice(),
            Self::Byte(byte) => buf.first() == Some(byte),
            Self::Predicate(pred) => pred(buf),
        }
    }
}

impl std::fmt::Debug for ValueCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(bytes) => f.debug_tuple("Exact").field(bytes).finish(),
            Self::Byte(byte) => f.debug_tuple("Byte").field(byte).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<u8> for ValueCheck {
    fn from(byte: u8) -> Self {
        Self::Byte(byte)
    }
}

impl From<Vec<u8>> for ValueCheck {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Exact(bytes)
    }
}

/// A long-running poll-diff-callback session over a set of regions.
///
/// Created by [`SnesClient::create_watcher`]. Independent lifecycle from
/// the connection, but every poll requires an attached device; starting a
/// session while detached fails fast rather than silently spinning.
pub struct MemoryWatcher {
    client: SnesClient,
    addresses: Arc<Vec<AddressSpec>>,
    poll_interval: Duration,
    on_change: Arc<ChangeFn>,
    previous: Arc<StdMutex<Option<Vec<Vec<u8>>>>>,
    running: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for MemoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWatcher")
            .field("addresses", &self.addresses.len())
            .field("poll_interval", &self.poll_interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl MemoryWatcher {
    /// Seed the snapshot cache and start the background poll loop.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connection`] when no device is attached or the
    /// initial read fails.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("watcher already running");
            return Ok(());
        }

        self.client.require_attached().inspect_err(|_| {
            self.running.store(false, Ordering::SeqCst);
        })?;

        let initial = match self.client.read_addresses(&self.addresses).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.previous.lock().expect("snapshot lock poisoned") = Some(initial);

        log::info!(
            "watcher started: {} regions at {:?}",
            self.addresses.len(),
            self.poll_interval
        );

        let client = self.client.clone();
        let addresses = Arc::clone(&self.addresses);
        let on_change = Arc::clone(&self.on_change);
        let previous = Arc::clone(&self.previous);
        let running = Arc::clone(&self.running);
        let stop_signal = Arc::clone(&self.stop_signal);
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                tokio::select! {
                    () = tokio::time::sleep(poll_interval) => {}
                    // Re-check the running flag; a stale permit from an
                    // earlier stop just costs one early poll.
                    () = stop_signal.notified() => continue,
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                match client.read_addresses(&addresses).await {
                    Ok(current) => {
                        let changes = {
                            let mut cache = previous.lock().expect("snapshot lock poisoned");
                            let changes = cache
                                .as_deref()
                                .map(|prev| diff_snapshots(&addresses, prev, &current))
                                .unwrap_or_default();
                            *cache = Some(current);
                            changes
                        };
                        if !changes.is_empty() {
                            on_change(&changes);
                        }
                    }
                    Err(e) => {
                        // Watchers ride out transient read failures.
                        log::warn!("watcher poll error: {e}");
                    }
                }
            }
        });
        *self.task.lock().expect("task lock poisoned") = Some(handle);
        Ok(())
    }

    /// Stop the poll loop.
    ///
    /// Returns immediately. A poll that is mid-exchange finishes in the
    /// background before the task exits; cancelling it between request
    /// and reply would leave an unconsumed reply in the frame queue for
    /// the next caller to misread.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("watcher stopped");
        self.stop_signal.notify_one();
        // Detach rather than abort; the task sees the cleared flag and
        // exits after its current exchange, if any, completes.
        self.task.lock().expect("task lock poisoned").take();
    }

    /// Last snapshot, one byte vector per watched region.
    pub fn values(&self) -> Option<Vec<Vec<u8>>> {
        self.previous
            .lock()
            .expect("snapshot lock poisoned")
            .clone()
    }

    /// Whether the poll loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Byte-compare two snapshots region by region.
fn diff_snapshots(
    addresses: &[AddressSpec],
    previous: &[Vec<u8>],
    current: &[Vec<u8>],
) -> Vec<ChangeEntry> {
    let mut changes = Vec::new();
    for (index, spec) in addresses.iter().enumerate() {
        let (Some(old), Some(new)) = (previous.get(index), current.get(index)) else {
            continue;
        };
        if old != new {
            changes.push(ChangeEntry {
                index,
                address: spec.address,
                size: spec.size,
                old_value: old.clone(),
                new_value: new.clone(),
            });
        }
    }
    changes
}

impl SnesClient {
    /// Create a watcher session over `addresses`, polling every
    /// `poll_interval` and invoking `on_change` with the differing regions
    /// of each cycle. The session is inert until
    /// [`MemoryWatcher::start`].
    pub fn create_watcher(
        &self,
        addresses: Vec<AddressSpec>,
        poll_interval: Duration,
        on_change: impl Fn(&[ChangeEntry]) + Send + Sync + 'static,
    ) -> MemoryWatcher {
        MemoryWatcher {
            client: self.clone(),
            addresses: Arc::new(addresses),
            poll_interval,
            on_change: Arc::new(on_change),
            previous: Arc::new(StdMutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            task: StdMutex::new(None),
        }
    }

    /// Poll one region until `check` matches, returning the matching bytes.
    ///
    /// `timeout_ms == 0` disables the deadline (caller opt-in).
    ///
    /// # Errors
    ///
    /// [`ClientError::Timeout`] once `timeout_ms` elapses; read errors
    /// propagate as-is.
    pub async fn watch_for_value(
        &self,
        address: u32,
        size: u32,
        check: impl Into<ValueCheck>,
        timeout_ms: u64,
        poll_interval: Duration,
    ) -> Result<Vec<u8>> {
        let check = check.into();
        let deadline = deadline_from_ms(timeout_ms);

        loop {
            if deadline_expired(deadline) {
                return Err(ClientError::Timeout(format!(
                    "value watch at {address:#x} exceeded {timeout_ms}ms"
                )));
            }
            let value = self.read_address(address, size).await?;
            if check.matches(&value) {
                return Ok(value);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Poll multiple regions until every condition holds on the same cycle,
    /// returning that cycle's bytes in condition order.
    ///
    /// # Errors
    ///
    /// As [`SnesClient::watch_for_value`].
    pub async fn watch_for_conditions(
        &self,
        conditions: &[Condition],
        timeout_ms: u64,
        poll_interval: Duration,
    ) -> Result<Vec<Vec<u8>>> {
        if conditions.is_empty() {
            return Ok(Vec::new());
        }
        let specs: Vec<AddressSpec> = conditions.iter().map(|c| c.spec).collect();
        let deadline = deadline_from_ms(timeout_ms);

        loop {
            if deadline_expired(deadline) {
                return Err(ClientError::Timeout(format!(
                    "condition watch over {} regions exceeded {timeout_ms}ms",
                    conditions.len()
                )));
            }
            let values = self.read_addresses(&specs).await?;
            let all_met = conditions
                .iter()
                .zip(&values)
                .all(|(condition, value)| condition.check.matches(value));
            if all_met {
                return Ok(values);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

fn deadline_from_ms(timeout_ms: u64) -> Option<Instant> {
    (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms))
}

fn deadline_expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(address: u32, size: u32) -> AddressSpec {
        AddressSpec::new(address, size).unwrap()
    }

    #[test]
    fn diff_reports_only_changed_regions() {
        let addresses = vec![spec(0xF5_0010, 1), spec(0xF5_0020, 1), spec(0xF5_0030, 2)];
        let previous = vec![vec![0x00], vec![0x07], vec![0x01, 0x02]];
        let current = vec![vec![0x00], vec![0x07], vec![0x01, 0x03]];

        let changes = diff_snapshots(&addresses, &previous, &current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].index, 2);
        assert_eq!(changes[0].address, 0xF5_0030);
        assert_eq!(changes[0].size, 2);
        assert_eq!(changes[0].old_value, vec![0x01, 0x02]);
        assert_eq!(changes[0].new_value, vec![0x01, 0x03]);
    }

    #[test]
    fn diff_with_identical_snapshots_is_empty() {
        let addresses = vec![spec(0xF5_0010, 1)];
        let snapshot = vec![vec![0x42]];
        assert!(diff_snapshots(&addresses, &snapshot, &snapshot).is_empty());
    }

    #[test]
    fn value_check_variants() {
        assert!(ValueCheck::Byte(5).matches(&[5, 0]));
        assert!(!ValueCheck::Byte(5).matches(&[4]));
        assert!(!ValueCheck::Byte(5).matches(&[]));
        assert!(ValueCheck::Exact(vec![1, 2]).matches(&[1, 2]));
        assert!(!ValueCheck::Exact(vec![1, 2]).matches(&[1, 2, 3]));
        let pred = ValueCheck::Predicate(Box::new(|buf| buf.iter().sum::<u8>() > 10));
        assert!(pred.matches(&[6, 6]));
        assert!(!pred.matches(&[1, 2]));
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        assert!(deadline_from_ms(0).is_none());
        assert!(!deadline_expired(None));
    }

    #[tokio::test]
    async fn start_fails_fast_when_not_attached() {
        let client = SnesClient::default();
        let watcher = client.create_watcher(
            vec![spec(0xF5_0010, 1)],
            Duration::from_millis(10),
            |_| {},
        );
        assert!(matches!(
            watcher.start().await,
            Err(ClientError::Connection(_))
        ));
        assert!(!watcher.is_running());
    }
}
