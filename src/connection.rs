//! Connection lifecycle and the request channel.
//!
//! One client owns one WebSocket to the bridge. A background receive task
//! continuously drains the transport into an unbounded queue; every
//! request-issuing operation locks the request gate, sends its frames, and
//! consumes matching items from that queue with a bounded wait.
//!
//! # The gate
//!
//! The protocol carries no request identifiers — replies are correlated by
//! order alone — so pipelining is unsafe: a second request's reply could be
//! silently consumed as the first's. The gate is a `tokio::sync::Mutex`
//! around the [`Link`] (write half + frame queue + receive-task handle);
//! holding the guard for the whole exchange makes one-in-flight a property
//! of ownership rather than discipline.
//!
//! # Teardown
//!
//! Any transport error, unexpected frame, or expired bounded wait tears the
//! connection down: the receive task is aborted, the link (and with it the
//! queue) is dropped so stale frames can never be misattributed to a later
//! exchange, and the state resets to [`ConnectionState::Disconnected`].
//! There is no automatic reconnect; callers check state and reconnect
//! explicitly.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, MutexGuard};

use crate::config::ClientConfig;
use crate::constants::CONTROL_REPLY_TIMEOUT;
use crate::error::{ClientError, Result};
use crate::memory::DeviceClass;
use crate::protocol::{Opcode, Reply, Request};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport.
    Disconnected,
    /// Transport handshake in progress.
    Connecting,
    /// Transport up; no device attached yet.
    Connected,
    /// Attached to a device; memory and file operations are valid.
    Attached,
}

/// Inbound frame from the receive task.
#[derive(Debug)]
pub(crate) enum Frame {
    /// JSON text frame.
    Text(String),
    /// Raw binary frame.
    Binary(Vec<u8>),
}

/// Device attributes reported by `Info`.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// Firmware version string (e.g. `"1.11.0"`).
    pub firmware_version: Option<String>,
    /// Bridge/device version string.
    pub version_string: Option<String>,
    /// Name of the currently running ROM.
    pub rom_running: Option<String>,
    /// Remaining flag entries, device-specific.
    pub flags: Vec<String>,
}

/// Attached-device record, fixed at attach time.
#[derive(Clone, Debug)]
struct Session {
    device: String,
    class: DeviceClass,
}

/// Transport bundle guarded by the request gate.
pub(crate) struct Link {
    writer: WsWriter,
    frames: mpsc::UnboundedReceiver<Frame>,
    recv_task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

impl Link {
    /// Send a JSON request frame.
    pub(crate) async fn send_request(&mut self, request: &Request) -> Result<()> {
        let text = serde_json::to_string(request)
            .map_err(|e| ClientError::Protocol(format!("request serialization failed: {e}")))?;
        log::trace!("-> {text}");
        self.writer.send_text(&text).await
    }

    /// Send a raw binary payload frame.
    pub(crate) async fn send_payload(&mut self, data: Vec<u8>) -> Result<()> {
        self.writer.send_binary(data).await
    }

    /// Receive the next frame with a bounded wait.
    ///
    /// An expired wait or a closed queue is a [`ClientError::Connection`];
    /// the caller is expected to tear the connection down.
    pub(crate) async fn recv_frame(&mut self, wait: Duration) -> Result<Frame> {
        match tokio::time::timeout(wait, self.frames.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(ClientError::Connection("transport closed".into())),
            Err(_) => Err(ClientError::Connection(format!(
                "no reply within {wait:?}"
            ))),
        }
    }

    /// Receive a JSON reply frame with a bounded wait.
    pub(crate) async fn recv_reply(&mut self, wait: Duration) -> Result<Reply> {
        match self.recv_frame(wait).await? {
            Frame::Text(text) => {
                log::trace!("<- {text}");
                Ok(serde_json::from_str(&text)?)
            }
            Frame::Binary(data) => Err(ClientError::Protocol(format!(
                "expected JSON reply, received {} binary bytes",
                data.len()
            ))),
        }
    }

    /// Receive a binary data frame with a bounded wait.
    pub(crate) async fn recv_binary(&mut self, wait: Duration) -> Result<Vec<u8>> {
        match self.recv_frame(wait).await? {
            Frame::Binary(data) => Ok(data),
            Frame::Text(text) => Err(ClientError::Protocol(format!(
                "expected binary data, received text frame: {text}"
            ))),
        }
    }
}

struct Inner {
    config: ClientConfig,
    state: Arc<StdMutex<ConnectionState>>,
    session: Arc<StdMutex<Option<Session>>>,
    link: Mutex<Option<Link>>,
}

/// Async client for the USB2SNES WebSocket protocol.
///
/// Cheap to clone; clones share the same connection and request gate, so a
/// watcher task and application code interleave at exchange granularity.
#[derive(Clone)]
pub struct SnesClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SnesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnesClient")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Default for SnesClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl SnesClient {
    /// Create a disconnected client with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Arc::new(StdMutex::new(ConnectionState::Disconnected)),
                session: Arc::new(StdMutex::new(None)),
                link: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    /// Name of the attached device, if any.
    pub fn device(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .map(|s| s.device.clone())
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Open the transport and start the background receive task.
    ///
    /// Idempotent: calling while already connected is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connection`] if the handshake fails; state is
    /// left [`ConnectionState::Disconnected`] with no link.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let mut guard = self.inner.link.lock().await;
        if guard.is_some() {
            log::debug!("connect: already connected, ignoring");
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        log::info!("connecting to {url}");

        let (writer, reader) = match ws::connect(url).await {
            Ok(pair) => pair,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::clone(&self.inner.state);
        let session = Arc::clone(&self.inner.session);
        let recv_task = tokio::spawn(recv_loop(reader, tx, state, session));

        *guard = Some(Link {
            writer,
            frames: rx,
            recv_task,
        });
        self.set_state(ConnectionState::Connected);
        log::info!("connected");
        Ok(())
    }

    /// Close the connection if one is open.
    pub async fn disconnect(&self) {
        let mut guard = self.inner.link.lock().await;
        if guard.is_some() {
            self.teardown_locked(&mut guard, "disconnect requested");
        }
    }

    /// List devices known to the bridge.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connection`] when not connected or the reply never
    /// arrives.
    pub async fn device_list(&self) -> Result<Vec<String>> {
        self.require_connected()?;
        let mut guard = self.inner.link.lock().await;
        let result = async {
            let link = link_of(&mut guard)?;
            link.send_request(&Request::new(Opcode::DeviceList, vec![]))
                .await?;
            let reply = link.recv_reply(CONTROL_REPLY_TIMEOUT).await?;
            Ok(reply.results)
        }
        .await;
        self.finish(&mut guard, result)
    }

    /// Attach to a device by name.
    ///
    /// Records the device class once, by inspecting the name: an `sd2snes`
    /// (or serial `COMn`) device only executes writes through the CMD-space
    /// workaround; everything else is directly writable.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connection`] when not in the `Connected` state or the
    /// send fails. The protocol sends no reply to `Attach`.
    pub async fn attach(&self, device: &str) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::Connection(format!(
                "attach requires a connected, unattached client (state: {:?})",
                self.state()
            )));
        }
        let mut guard = self.inner.link.lock().await;
        let result = async {
            let link = link_of(&mut guard)?;
            link.send_request(&Request::new(Opcode::Attach, vec![device.to_string()]))
                .await
        }
        .await;
        let result = self.finish(&mut guard, result);
        drop(guard);

        if result.is_ok() {
            let class = DeviceClass::from_device_name(device);
            log::info!("attached to {device} ({class:?})");
            *self.inner.session.lock().expect("session lock poisoned") = Some(Session {
                device: device.to_string(),
                class,
            });
            self.set_state(ConnectionState::Attached);
        }
        result
    }

    /// Query firmware version, version string, and running ROM.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connection`] when not attached or the reply never
    /// arrives.
    pub async fn info(&self) -> Result<DeviceInfo> {
        self.require_attached()?;
        let device = self.device().unwrap_or_default();
        let mut guard = self.inner.link.lock().await;
        let result = async {
            let link = link_of(&mut guard)?;
            link.send_request(&Request::new(Opcode::Info, vec![device]))
                .await?;
            let reply = link.recv_reply(CONTROL_REPLY_TIMEOUT).await?;
            let mut results = reply.results.into_iter();
            Ok(DeviceInfo {
                firmware_version: results.next(),
                version_string: results.next(),
                rom_running: results.next(),
                flags: results.collect(),
            })
        }
        .await;
        self.finish(&mut guard, result)
    }

    /// Register a client name with the bridge. Fire-and-forget.
    pub async fn name(&self, name: &str) -> Result<()> {
        self.send_simple(Request::new(Opcode::Name, vec![name.to_string()]))
            .await
    }

    /// Boot a ROM by remote path. Fire-and-forget.
    pub async fn boot(&self, rom_path: &str) -> Result<()> {
        self.send_simple(Request::new(Opcode::Boot, vec![rom_path.to_string()]))
            .await
    }

    /// Return the device to its menu. Fire-and-forget.
    pub async fn menu(&self) -> Result<()> {
        self.send_simple(Request::new(Opcode::Menu, vec![])).await
    }

    /// Reset the console. Fire-and-forget.
    pub async fn reset(&self) -> Result<()> {
        self.send_simple(Request::new(Opcode::Reset, vec![])).await
    }

    /// Send a no-reply request through the gate.
    async fn send_simple(&self, request: Request) -> Result<()> {
        self.require_attached()?;
        let mut guard = self.inner.link.lock().await;
        let result = async {
            let link = link_of(&mut guard)?;
            link.send_request(&request).await
        }
        .await;
        self.finish(&mut guard, result)
    }

    // ------------------------------------------------------------------
    // Shared plumbing used by the memory/file/watcher modules
    // ------------------------------------------------------------------

    /// Acquire the request gate.
    pub(crate) async fn lock_link(&self) -> MutexGuard<'_, Option<Link>> {
        self.inner.link.lock().await
    }

    /// Resolve an exchange result: tear the connection down on connection
    /// or protocol errors, pass everything through.
    pub(crate) fn finish<T>(
        &self,
        guard: &mut MutexGuard<'_, Option<Link>>,
        result: Result<T>,
    ) -> Result<T> {
        if let Err(e) = &result {
            if e.tears_down() {
                self.teardown_locked(guard, &e.to_string());
            }
        }
        result
    }

    /// Drop the link while holding the gate: abort the receive task, discard
    /// the queue, reset state.
    pub(crate) fn teardown_locked(&self, guard: &mut MutexGuard<'_, Option<Link>>, reason: &str) {
        if let Some(link) = guard.take() {
            log::warn!("tearing down connection: {reason}");
            link.recv_task.abort();
            // Dropping the writer/receiver closes the socket and discards
            // any queued frames.
        }
        self.inner
            .session
            .lock()
            .expect("session lock poisoned")
            .take();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Tear down without already holding the gate (used by the blocking
    /// wrappers after an overall deadline expires).
    pub(crate) async fn teardown(&self, reason: &str) {
        let mut guard = self.inner.link.lock().await;
        if guard.is_some() {
            self.teardown_locked(&mut guard, reason);
        }
    }

    /// Fail unless the transport is up.
    pub(crate) fn require_connected(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Attached => Ok(()),
            state => Err(ClientError::Connection(format!(
                "operation requires a connection (state: {state:?})"
            ))),
        }
    }

    /// Fail unless attached to a device.
    pub(crate) fn require_attached(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Attached => Ok(()),
            state => Err(ClientError::Connection(format!(
                "operation requires an attached device (state: {state:?})"
            ))),
        }
    }

    /// Class of the attached device.
    pub(crate) fn device_class(&self) -> Result<DeviceClass> {
        self.inner
            .session
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .map(|s| s.class)
            .ok_or_else(|| ClientError::Connection("no device attached".into()))
    }

    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock().expect("state lock poisoned") = state;
    }
}

/// Borrow the link out of the gate guard, failing when disconnected.
pub(crate) fn link_of<'a>(guard: &'a mut MutexGuard<'_, Option<Link>>) -> Result<&'a mut Link> {
    guard
        .as_mut()
        .ok_or_else(|| ClientError::Connection("not connected".into()))
}

/// Background receive loop: drain the transport into the frame queue.
///
/// Exits when the transport closes or the queue's receiver is dropped
/// (teardown); on exit the session is cleared and the shared state is reset
/// so callers observing state between exchanges see the disconnect promptly.
async fn recv_loop(
    mut reader: WsReader,
    tx: mpsc::UnboundedSender<Frame>,
    state: Arc<StdMutex<ConnectionState>>,
    session: Arc<StdMutex<Option<Session>>>,
) {
    while let Some(message) = reader.recv().await {
        let frame = match message {
            Ok(WsMessage::Text(text)) => Frame::Text(text),
            Ok(WsMessage::Binary(data)) => Frame::Binary(data),
            Ok(WsMessage::Close) => {
                log::info!("server closed the WebSocket");
                break;
            }
            Err(e) => {
                log::warn!("receive loop error: {e}");
                break;
            }
        };
        if tx.send(frame).is_err() {
            // Link dropped by teardown; nothing left to deliver to.
            return;
        }
    }
    session.lock().expect("session lock poisoned").take();
    *state.lock().expect("state lock poisoned") = ConnectionState::Disconnected;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_is_disconnected() {
        let client = SnesClient::default();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.device().is_none());
    }

    #[tokio::test]
    async fn operations_fail_fast_when_disconnected() {
        let client = SnesClient::default();
        assert!(matches!(
            client.device_list().await,
            Err(ClientError::Connection(_))
        ));
        assert!(matches!(
            client.attach("SD2SNES COM3").await,
            Err(ClientError::Connection(_))
        ));
        assert!(matches!(client.info().await, Err(ClientError::Connection(_))));
    }

    #[tokio::test]
    async fn connect_to_unreachable_endpoint_leaves_disconnected() {
        let client = SnesClient::default();
        let result = client.connect("ws://127.0.0.1:1/").await;
        assert!(result.is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
