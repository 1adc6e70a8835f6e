//! FTP remote adapter.
//!
//! Drives one blocking control connection through `spawn_blocking`; data
//! transfers bridge to async byte streams over bounded channels. Transfers
//! on a single FTP connection are inherently serial, so the connection sits
//! behind a mutex and concurrent operations queue on it.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tokio::sync::mpsc;
use tokio::task;

use super::{ChunkStream, ObjectInfo, RemoteClient, RemoteEntry, RemoteLocator};
use crate::error::TransferError;

/// Chunk granularity on the data connection.
const DATA_CHUNK_SIZE: usize = 64 * 1024;
/// Depth of the blocking/async bridge channels.
const BRIDGE_DEPTH: usize = 8;
/// Control-socket read timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
}

fn default_port() -> u16 {
    21
}

/// FTP adapter holding the mutex-guarded control connection.
///
/// A dropped connection is re-established lazily on the next operation.
pub struct FtpRemote {
    config: FtpConfig,
    conn: Arc<Mutex<Option<FtpStream>>>,
}

impl FtpRemote {
    /// Dials the server, logs in and switches to binary mode.
    pub async fn connect(config: FtpConfig) -> Result<Self, TransferError> {
        let remote = Self {
            config,
            conn: Arc::new(Mutex::new(None)),
        };
        remote.verify().await?;
        Ok(remote)
    }

    /// Runs a short control-connection operation on a blocking thread,
    /// dialing first if the connection is gone.
    async fn with_conn<R, F>(&self, op: &'static str, f: F) -> Result<R, TransferError>
    where
        R: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<R, FtpError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let config = self.config.clone();
        task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap();
            let mut ftp = match guard.take() {
                Some(ftp) => ftp,
                None => {
                    debug!("ftp_dial: {}:{}", config.host, config.port);
                    dial(&config)?
                }
            };
            match f(&mut ftp) {
                Ok(value) => {
                    *guard = Some(ftp);
                    Ok(value)
                }
                Err(e) => {
                    // A dead connection stays out of the slot so the next
                    // operation redials.
                    if !matches!(e, FtpError::ConnectionError(_)) {
                        *guard = Some(ftp);
                    }
                    Err(ftp_err(op, e))
                }
            }
        })
        .await
        .map_err(|e| TransferError::transport(format!("{}: worker task failed: {}", op, e), false))?
    }
}

#[async_trait]
impl RemoteClient for FtpRemote {
    fn scheme(&self) -> &'static str {
        "ftp"
    }

    async fn verify(&self) -> Result<(), TransferError> {
        self.with_conn("noop", |ftp| ftp.noop())
            .await
            .map_err(|e| match e {
                TransferError::Transport { message, .. } => TransferError::Connection(message),
                other => other,
            })
    }

    async fn stat(&self, locator: &RemoteLocator) -> Result<ObjectInfo, TransferError> {
        let path = locator.key.clone();
        self.with_conn("stat", move |ftp| {
            let size = ftp.size(&path)? as u64;
            // MDTM is optional on many servers; a failure is not fatal.
            let modified_at = ftp
                .mdtm(&path)
                .ok()
                .map(|dt| dt.and_utc().timestamp());
            Ok(ObjectInfo {
                size,
                etag: None,
                modified_at,
            })
        })
        .await
    }

    async fn list(&self, locator: &RemoteLocator) -> Result<Vec<RemoteEntry>, TransferError> {
        let path = locator.key.clone();
        let lines = self
            .with_conn("list", move |ftp| {
                let target = if path.is_empty() {
                    None
                } else {
                    Some(path.as_str())
                };
                ftp.list(target)
            })
            .await?;

        let mut entries = Vec::new();
        for line in lines {
            match line.parse::<ListEntry>() {
                Ok(entry) => entries.push(RemoteEntry {
                    key: entry.name().to_string(),
                    size: entry.size() as u64,
                    is_dir: entry.is_directory(),
                    modified_at: entry
                        .modified()
                        .duration_since(UNIX_EPOCH)
                        .ok()
                        .map(|d| d.as_secs() as i64),
                }),
                Err(e) => debug!("ftp_list_skip: {} line={}", e, line),
            }
        }
        Ok(entries)
    }

    async fn get_stream(
        &self,
        locator: &RemoteLocator,
        start: u64,
    ) -> Result<ChunkStream, TransferError> {
        let (tx, rx) = mpsc::channel::<Result<Bytes, TransferError>>(BRIDGE_DEPTH);
        let conn = Arc::clone(&self.conn);
        let config = self.config.clone();
        let path = locator.key.clone();

        task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap();
            let mut ftp = match guard.take() {
                Some(ftp) => ftp,
                None => {
                    debug!("ftp_dial: {}:{}", config.host, config.port);
                    match dial(&config) {
                        Ok(ftp) => ftp,
                        Err(e) => {
                            let _ = tx.blocking_send(Err(e));
                            return;
                        }
                    }
                }
            };
            if stream_retr(&mut ftp, &path, start, &tx) {
                *guard = Some(ftp);
            }
        });

        let mut rx = rx;
        Ok(Box::pin(stream::poll_fn(move |cx| rx.poll_recv(cx))))
    }

    async fn put_stream(
        &self,
        locator: &RemoteLocator,
        mut source: ChunkStream,
        _size_hint: Option<u64>,
        _content_type: Option<&str>,
    ) -> Result<u64, TransferError> {
        let (tx, mut rx) = mpsc::channel::<Bytes>(BRIDGE_DEPTH);
        let conn = Arc::clone(&self.conn);
        let config = self.config.clone();
        let path = locator.key.clone();

        let writer = task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap();
            let mut ftp = match guard.take() {
                Some(ftp) => ftp,
                None => {
                    debug!("ftp_dial: {}:{}", config.host, config.port);
                    dial(&config)?
                }
            };
            let (result, keep_conn) = write_stor(&mut ftp, &path, &mut rx);
            if keep_conn {
                *guard = Some(ftp);
            }
            result
        });

        // Feed the source. A source failure (cancellation included) closes
        // the channel so the writer finalizes what it already has; the
        // partial remote file stays and callers may delete() it.
        let mut source_err = None;
        while let Some(chunk) = source.next().await {
            match chunk {
                Ok(bytes) => {
                    if tx.send(bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    source_err = Some(e);
                    break;
                }
            }
        }
        drop(tx);

        let written = writer
            .await
            .map_err(|e| {
                TransferError::transport(format!("stor: worker task failed: {}", e), false)
            })??;

        match source_err {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    async fn delete(&self, locator: &RemoteLocator) -> Result<(), TransferError> {
        let path = locator.key.clone();
        self.with_conn("delete", move |ftp| ftp.rm(&path)).await
    }

    async fn rename(
        &self,
        from: &RemoteLocator,
        to: &RemoteLocator,
    ) -> Result<(), TransferError> {
        let from_path = from.key.clone();
        let to_path = to.key.clone();
        self.with_conn("rename", move |ftp| ftp.rename(&from_path, &to_path))
            .await
    }

    async fn mkdir(&self, locator: &RemoteLocator) -> Result<(), TransferError> {
        let path = locator.key.clone();
        self.with_conn("mkdir", move |ftp| ftp.mkdir(&path)).await
    }
}

fn dial(config: &FtpConfig) -> Result<FtpStream, TransferError> {
    let addr = format!("{}:{}", config.host, config.port);
    let mut ftp = FtpStream::connect(&addr)
        .map_err(|e| TransferError::Connection(format!("{}: {}", addr, e)))?;
    if let Err(e) = ftp.get_ref().set_read_timeout(Some(READ_TIMEOUT)) {
        debug!("ftp_read_timeout_unset: {}", e);
    }
    ftp.login(&config.username, &config.password)
        .map_err(|e| TransferError::Connection(format!("login failed: {}", e)))?;
    ftp.transfer_type(FileType::Binary)
        .map_err(|e| TransferError::Connection(format!("binary mode failed: {}", e)))?;
    Ok(ftp)
}

/// Runs one RETR, sending chunks (and any failure) through `tx`.
/// Returns `false` when the control connection is no longer usable.
fn stream_retr(
    ftp: &mut FtpStream,
    path: &str,
    start: u64,
    tx: &mpsc::Sender<Result<Bytes, TransferError>>,
) -> bool {
    if start > 0 {
        if let Err(e) = ftp.resume_transfer(start as usize) {
            let lost = matches!(e, FtpError::ConnectionError(_));
            let _ = tx.blocking_send(Err(ftp_err("rest", e)));
            return !lost;
        }
    }

    let mut data = match ftp.retr_as_stream(path) {
        Ok(data) => data,
        Err(e) => {
            let lost = matches!(e, FtpError::ConnectionError(_));
            let _ = tx.blocking_send(Err(ftp_err("retr", e)));
            return !lost;
        }
    };

    let mut buf = vec![0u8; DATA_CHUNK_SIZE];
    loop {
        match data.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    // Receiver dropped: cancelled or paused upstream. ABOR
                    // keeps the control connection usable.
                    return ftp.abort(data).is_ok();
                }
            }
            Err(e) => {
                let _ = ftp.abort(data);
                let _ = tx.blocking_send(Err(TransferError::transport(
                    format!("retr: data read failed: {}", e),
                    true,
                )));
                return false;
            }
        }
    }

    match ftp.finalize_retr_stream(data) {
        Ok(()) => true,
        Err(e) => {
            let lost = matches!(e, FtpError::ConnectionError(_));
            let _ = tx.blocking_send(Err(ftp_err("retr", e)));
            !lost
        }
    }
}

/// Runs one STOR fed from `rx`. Returns the write result and whether the
/// control connection is still usable.
fn write_stor(
    ftp: &mut FtpStream,
    path: &str,
    rx: &mut mpsc::Receiver<Bytes>,
) -> (Result<u64, TransferError>, bool) {
    let mut data = match ftp.put_with_stream(path) {
        Ok(data) => data,
        Err(e) => {
            let lost = matches!(e, FtpError::ConnectionError(_));
            return (Err(ftp_err("stor", e)), !lost);
        }
    };

    let mut written = 0u64;
    while let Some(chunk) = rx.blocking_recv() {
        if let Err(e) = data.write_all(&chunk) {
            let _ = ftp.finalize_put_stream(data);
            return (
                Err(TransferError::transport(
                    format!("stor: data write failed: {}", e),
                    true,
                )),
                false,
            );
        }
        written += chunk.len() as u64;
    }

    match ftp.finalize_put_stream(data) {
        Ok(()) => (Ok(written), true),
        Err(e) => {
            let lost = matches!(e, FtpError::ConnectionError(_));
            (Err(ftp_err("stor", e)), !lost)
        }
    }
}

fn ftp_err(context: &str, err: FtpError) -> TransferError {
    let retryable = matches!(err, FtpError::ConnectionError(_));
    TransferError::transport(format!("{}: {}", context, err), retryable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_list_lines() {
        let line = "-rw-r--r--   1 user  group     524288 Jan 10 12:30 archive.bin";
        let entry: ListEntry = line.parse().unwrap();
        assert_eq!(entry.name(), "archive.bin");
        assert_eq!(entry.size(), 524288);
        assert!(!entry.is_directory());
    }

    #[test]
    fn directory_lines_are_flagged() {
        let line = "drwxr-xr-x   2 user  group       4096 Jan 10 12:30 backups";
        let entry: ListEntry = line.parse().unwrap();
        assert!(entry.is_directory());
        assert_eq!(entry.name(), "backups");
    }

    #[test]
    fn config_defaults_port_21() {
        let config: FtpConfig =
            serde_json::from_str(r#"{"host":"ftp.example.com","username":"u","password":"p"}"#)
                .unwrap();
        assert_eq!(config.port, 21);
    }
}
