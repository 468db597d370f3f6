//! File transfer: chunked upload/download with verification, plus the
//! directory operations they lean on.
//!
//! Uploads stream the local file in `ClientConfig::chunk_size` pieces,
//! reporting cumulative progress after every chunk; the byte total must
//! match the declared size or the transfer fails. Downloads receive the
//! declared size in a JSON reply and then accumulate binary frames to
//! exactly that size.
//!
//! The blocking variants wrap the plain operations in an overall deadline —
//! size-proportional for uploads, flat for downloads. A timed-out exchange
//! may still complete underneath, so expiry also drops the connection
//! rather than trust the frame queue for the next caller.

use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use crate::connection::{link_of, SnesClient};
use crate::constants::{
    CONTROL_REPLY_TIMEOUT, DOWNLOAD_PREALLOC_LIMIT, DOWNLOAD_TIMEOUT, FILE_DATA_TIMEOUT,
    MIN_UPLOAD_TIMEOUT, UPLOAD_VERIFY_DELAY,
};
use crate::error::{ClientError, Result};
use crate::protocol::{parse_hex_operand, Opcode, Request};

/// Progress callback: `(bytes_transferred, total_bytes)`.
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// Kind of a remote directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// A directory.
    Directory,
    /// A regular file.
    File,
    /// Anything else the bridge reports.
    Other(String),
}

impl EntryKind {
    fn from_wire(code: &str) -> Self {
        match code {
            "0" => Self::Directory,
            "1" => Self::File,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A remote directory entry.
#[derive(Clone, Debug)]
pub struct DirEntry {
    /// Entry kind.
    pub kind: EntryKind,
    /// Entry name (no path).
    pub name: String,
}

/// Validate the shape of a remote path: absolute, no trailing slash.
fn check_remote_path(path: &str) -> Result<()> {
    if path.is_empty() || path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') {
        return Err(ClientError::Validation(format!(
            "remote path {path:?} must start with '/'"
        )));
    }
    if path.ends_with('/') {
        return Err(ClientError::Validation(format!(
            "remote path {path:?} must not end with '/'"
        )));
    }
    Ok(())
}

/// Parent directory of a remote path (`"/"` for top-level entries).
fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// File name of a remote path.
fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl SnesClient {
    /// List a remote directory.
    ///
    /// `.` and `..` entries are filtered out.
    ///
    /// # Errors
    ///
    /// [`ClientError::Validation`] for a malformed path,
    /// [`ClientError::Connection`] when not attached or the reply never
    /// arrives.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        check_remote_path(path)?;
        self.require_attached()?;

        let mut guard = self.lock_link().await;
        let result = async {
            let link = link_of(&mut guard)?;
            link.send_request(&Request::new(Opcode::List, vec![path.to_string()]))
                .await?;
            let reply = link.recv_reply(CONTROL_REPLY_TIMEOUT).await?;

            let mut entries = Vec::with_capacity(reply.results.len() / 2);
            for pair in reply.results.chunks_exact(2) {
                let name = pair[1].clone();
                if name == "." || name == ".." {
                    continue;
                }
                entries.push(DirEntry {
                    kind: EntryKind::from_wire(&pair[0]),
                    name,
                });
            }
            Ok(entries)
        }
        .await;
        self.finish(&mut guard, result)
    }

    /// Create a remote directory. Fire-and-forget on the wire.
    ///
    /// # Errors
    ///
    /// [`ClientError::Validation`] for a blank or root path,
    /// [`ClientError::Connection`] when not attached.
    pub async fn make_dir(&self, path: &str) -> Result<()> {
        if path.is_empty() || path == "/" {
            return Err(ClientError::Validation(
                "make_dir: path cannot be blank or \"/\"".into(),
            ));
        }
        check_remote_path(path)?;
        self.require_attached()?;

        let mut guard = self.lock_link().await;
        let result = async {
            let link = link_of(&mut guard)?;
            link.send_request(&Request::new(Opcode::MakeDir, vec![path.to_string()]))
                .await
        }
        .await;
        self.finish(&mut guard, result)
    }

    /// Remove a remote file or directory. Fire-and-forget on the wire.
    pub async fn remove_path(&self, path: &str) -> Result<()> {
        check_remote_path(path)?;
        self.require_attached()?;

        let mut guard = self.lock_link().await;
        let result = async {
            let link = link_of(&mut guard)?;
            link.send_request(&Request::new(Opcode::Remove, vec![path.to_string()]))
                .await
        }
        .await;
        self.finish(&mut guard, result)
    }

    /// Check whether a remote directory exists by walking its components
    /// and listing each parent. The comparison is case-insensitive — FAT
    /// filesystems on real hardware are.
    pub async fn dir_exists(&self, path: &str) -> Result<bool> {
        check_remote_path(path)?;
        if path.is_empty() || path == "/" {
            return Ok(true);
        }

        let mut prefix = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let parent = if prefix.is_empty() { "/" } else { prefix.as_str() };
            let entries = self.list_dir(parent).await?;
            let found = entries
                .iter()
                .any(|e| e.kind == EntryKind::Directory && e.name.eq_ignore_ascii_case(component));
            if !found {
                return Ok(false);
            }
            prefix.push('/');
            prefix.push_str(component);
        }
        Ok(true)
    }

    /// Create a remote directory and any missing parents.
    async fn ensure_remote_dir(&self, path: &str) -> Result<()> {
        check_remote_path(path)?;
        if path.is_empty() || path == "/" {
            return Ok(());
        }

        let mut prefix = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let parent = if prefix.is_empty() { "/" } else { prefix.as_str() };
            let entries = self.list_dir(parent).await?;
            let found = entries
                .iter()
                .any(|e| e.kind == EntryKind::Directory && e.name.eq_ignore_ascii_case(component));
            prefix.push('/');
            prefix.push_str(component);
            if !found {
                log::info!("creating remote directory {prefix}");
                self.make_dir(&prefix).await?;
            }
        }
        Ok(())
    }

    /// Upload a local file to the console.
    ///
    /// Streams the file in `config.chunk_size` chunks, invoking `progress`
    /// with cumulative and total bytes after every chunk. Depending on
    /// configuration, the destination directory is created first and the
    /// destination is re-listed afterwards to confirm the file landed.
    ///
    /// # Errors
    ///
    /// [`ClientError::Validation`] for a malformed remote path or an
    /// unreadable local file; [`ClientError::Protocol`] when the byte total
    /// does not match the declared size or verification fails.
    pub async fn put_file(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        check_remote_path(remote)?;
        if remote.is_empty() || remote == "/" {
            return Err(ClientError::Validation(
                "put_file: remote path names no file".into(),
            ));
        }
        self.require_attached()?;

        if self.config().preemptive_dir_create {
            let dir = parent_dir(remote);
            if dir != "/" {
                self.ensure_remote_dir(dir).await?;
            }
        }

        let metadata = tokio::fs::metadata(local).await.map_err(|e| {
            ClientError::Validation(format!("cannot stat local file {}: {e}", local.display()))
        })?;
        let size = metadata.len();
        let mut file = tokio::fs::File::open(local).await.map_err(|e| {
            ClientError::Validation(format!("cannot open local file {}: {e}", local.display()))
        })?;

        if let Some(cb) = progress {
            cb(0, size);
        }

        let chunk_size = self.config().chunk_size.max(1);
        let mut guard = self.lock_link().await;
        let result = async {
            let link = link_of(&mut guard)?;
            link.send_request(&Request::new(
                Opcode::PutFile,
                vec![remote.to_string(), format!("{size:x}")],
            ))
            .await?;

            let mut transferred = 0u64;
            while transferred < size {
                let want = chunk_size.min((size - transferred) as usize);
                let mut chunk = vec![0u8; want];
                file.read_exact(&mut chunk).await.map_err(|e| {
                    // The declared size is already on the wire; a local read
                    // failure now leaves the exchange unfinishable.
                    ClientError::Protocol(format!(
                        "local read failed mid-upload after {transferred} bytes: {e}"
                    ))
                })?;
                link.send_payload(chunk).await?;
                transferred += want as u64;
                if let Some(cb) = progress {
                    cb(transferred, size);
                }
            }

            if transferred != size {
                return Err(ClientError::Protocol(format!(
                    "transfer incomplete: {transferred}/{size} bytes"
                )));
            }
            log::info!("uploaded {remote} ({size} bytes)");
            Ok(())
        }
        .await;
        let result = self.finish(&mut guard, result);
        drop(guard);
        result?;

        if self.config().verify_after_upload {
            self.verify_upload(remote).await?;
        }
        Ok(())
    }

    /// Confirm an uploaded file appears in its directory listing.
    async fn verify_upload(&self, remote: &str) -> Result<()> {
        // Give the device time to flush to storage before listing.
        tokio::time::sleep(UPLOAD_VERIFY_DELAY).await;

        let dir = parent_dir(remote);
        let name = file_name(remote);
        let entries = self.list_dir(dir).await?;
        if !entries.iter().any(|e| e.name.eq_ignore_ascii_case(name)) {
            return Err(ClientError::Protocol(format!(
                "upload verification failed: {name} not found in {dir}"
            )));
        }
        log::debug!("upload verified: {remote}");
        Ok(())
    }

    /// Download a remote file, returning its contents.
    ///
    /// The bridge replies with the declared size, then streams binary
    /// frames; `progress` is invoked per frame with cumulative and total
    /// bytes.
    ///
    /// # Errors
    ///
    /// [`ClientError::Protocol`] (connection torn down) unless exactly the
    /// declared size arrives.
    pub async fn get_file(&self, remote: &str, progress: Option<&ProgressFn>) -> Result<Vec<u8>> {
        check_remote_path(remote)?;
        self.require_attached()?;

        let mut guard = self.lock_link().await;
        let result = async {
            let link = link_of(&mut guard)?;
            link.send_request(&Request::new(Opcode::GetFile, vec![remote.to_string()]))
                .await?;

            let reply = link.recv_reply(CONTROL_REPLY_TIMEOUT).await?;
            let size = reply
                .results
                .first()
                .and_then(|s| parse_hex_operand(s))
                .ok_or_else(|| {
                    ClientError::Protocol(format!(
                        "GetFile reply carries no size: {:?}",
                        reply.results
                    ))
                })?;

            if let Some(cb) = progress {
                cb(0, size);
            }

            let mut data = download_buffer(size);
            while (data.len() as u64) < size {
                let chunk = link.recv_binary(FILE_DATA_TIMEOUT).await.map_err(|e| {
                    ClientError::Protocol(format!(
                        "download stalled at {}/{size} bytes: {e}",
                        data.len()
                    ))
                })?;
                data.extend_from_slice(&chunk);
                if let Some(cb) = progress {
                    cb(data.len() as u64, size);
                }
            }

            if data.len() as u64 != size {
                return Err(ClientError::Protocol(format!(
                    "download returned wrong byte count: declared {size}, received {}",
                    data.len()
                )));
            }
            log::info!("downloaded {remote} ({size} bytes)");
            Ok(data)
        }
        .await;
        self.finish(&mut guard, result)
    }

    /// Upload with an overall deadline.
    ///
    /// The default deadline is proportional to file size
    /// (`config.timeout_per_mb` seconds per megabyte, floor 30 s).
    ///
    /// # Errors
    ///
    /// [`ClientError::Timeout`] on expiry; the connection is dropped since
    /// the timed-out exchange may still complete underneath.
    pub async fn put_file_blocking(
        &self,
        local: &Path,
        remote: &str,
        timeout: Option<Duration>,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        let deadline = match timeout {
            Some(t) => t,
            None => {
                let size = tokio::fs::metadata(local).await.map_err(|e| {
                    ClientError::Validation(format!(
                        "cannot stat local file {}: {e}",
                        local.display()
                    ))
                })?;
                upload_deadline(size.len(), self.config().timeout_per_mb)
            }
        };

        log::debug!(
            "blocking upload {} -> {remote} (deadline {deadline:?})",
            local.display()
        );
        match tokio::time::timeout(deadline, self.put_file(local, remote, progress)).await {
            Ok(result) => result,
            Err(_) => {
                self.teardown("blocking upload deadline expired").await;
                Err(ClientError::Timeout(format!(
                    "upload of {} did not finish within {deadline:?}",
                    local.display()
                )))
            }
        }
    }

    /// Download with an overall deadline (flat 5 minutes by default).
    ///
    /// # Errors
    ///
    /// [`ClientError::Timeout`] on expiry; the connection is dropped.
    pub async fn get_file_blocking(
        &self,
        remote: &str,
        timeout: Option<Duration>,
        progress: Option<&ProgressFn>,
    ) -> Result<Vec<u8>> {
        let deadline = timeout.unwrap_or(DOWNLOAD_TIMEOUT);
        match tokio::time::timeout(deadline, self.get_file(remote, progress)).await {
            Ok(result) => result,
            Err(_) => {
                self.teardown("blocking download deadline expired").await;
                Err(ClientError::Timeout(format!(
                    "download of {remote} did not finish within {deadline:?}"
                )))
            }
        }
    }
}

/// Buffer for an incoming download. Capacity is capped: the declared size
/// is wire data, and a corrupt reply must not trigger a huge allocation.
fn download_buffer(size: u64) -> Vec<u8> {
    Vec::with_capacity(size.min(DOWNLOAD_PREALLOC_LIMIT as u64) as usize)
}

/// Size-proportional upload deadline: `timeout_per_mb` seconds per megabyte
/// with a 30-second floor.
fn upload_deadline(size_bytes: u64, timeout_per_mb: u64) -> Duration {
    let mb = size_bytes as f64 / (1024.0 * 1024.0);
    let secs = (mb * timeout_per_mb as f64).ceil();
    MIN_UPLOAD_TIMEOUT.max(Duration::from_secs(secs as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_shape() {
        assert!(check_remote_path("/roms/game.sfc").is_ok());
        assert!(check_remote_path("/").is_ok());
        assert!(check_remote_path("").is_ok());
        assert!(check_remote_path("roms/game.sfc").is_err());
        assert!(check_remote_path("/roms/").is_err());
    }

    #[test]
    fn parent_and_name_split() {
        assert_eq!(parent_dir("/roms/game.sfc"), "/roms");
        assert_eq!(parent_dir("/game.sfc"), "/");
        assert_eq!(file_name("/roms/game.sfc"), "game.sfc");
        assert_eq!(file_name("/game.sfc"), "game.sfc");
    }

    #[test]
    fn entry_kind_codes() {
        assert_eq!(EntryKind::from_wire("0"), EntryKind::Directory);
        assert_eq!(EntryKind::from_wire("1"), EntryKind::File);
        assert_eq!(EntryKind::from_wire("9"), EntryKind::Other("9".into()));
    }

    #[test]
    fn upload_deadline_has_floor() {
        // Tiny files get the 30s floor.
        assert_eq!(upload_deadline(10 * 1024, 10), Duration::from_secs(30));
        // 4 MiB at 10 s/MB -> 40s.
        assert_eq!(
            upload_deadline(4 * 1024 * 1024, 10),
            Duration::from_secs(40)
        );
        // Partial megabytes round up.
        assert_eq!(
            upload_deadline(4 * 1024 * 1024 + 1, 10),
            Duration::from_secs(41)
        );
    }

    #[test]
    fn download_preallocation_is_capped() {
        assert!(download_buffer(2500).capacity() >= 2500);
        assert!(download_buffer(u64::MAX).capacity() <= DOWNLOAD_PREALLOC_LIMIT);
    }

    #[tokio::test]
    async fn list_dir_when_disconnected_fails_fast() {
        let client = SnesClient::default();
        assert!(matches!(
            client.list_dir("/roms").await,
            Err(ClientError::Connection(_))
        ));
    }
}
