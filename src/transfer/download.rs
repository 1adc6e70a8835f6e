//! Download engine.
//!
//! Streams the remote body into the destination file through a write
//! buffer. Resumed attempts trust the file on disk: the starting offset is
//! whatever length the destination currently has, and the remote range
//! request picks up from there. Snapshot byte counts come from a stat of
//! the flushed file, never from in-flight counters.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::StreamExt;
use log::{info, warn};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::upload::{AttemptContext, EngineOutcome};
use crate::error::TransferError;
use crate::remote::{RemoteClient, RemoteLocator};

/// Bytes buffered in memory between disk writes.
const WRITE_BUFFER: usize = 2 * 1024 * 1024;

/// Downloads `locator` into `path`, appending to an existing file when
/// `resume` is set.
pub async fn download_file(
    remote: Arc<dyn RemoteClient>,
    locator: &RemoteLocator,
    path: &Path,
    total: u64,
    resume: bool,
    ctx: AttemptContext,
) -> Result<EngineOutcome, TransferError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let start = if resume {
        match fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        }
    } else {
        0
    };

    if total > 0 && start >= total {
        ctx.checkpoint.set_durable(total);
        ctx.transferred.store(total, Ordering::SeqCst);
        ctx.reporter.finish(total);
        return Ok(EngineOutcome::Completed);
    }

    let mut stream = remote.get_stream(locator, start).await?;
    let mut file = if start > 0 {
        fs::OpenOptions::new().append(true).open(path).await?
    } else {
        fs::File::create(path).await?
    };

    info!(
        "download_start: {} -> {} start={} total={}",
        locator,
        path.display(),
        start,
        total
    );

    ctx.checkpoint.set_durable(start);
    let mut buffer: Vec<u8> = Vec::with_capacity(WRITE_BUFFER);
    let mut written = start;

    loop {
        if let Some(interrupt) = ctx.signal.interruption() {
            drain(&mut file, &mut buffer).await?;
            let durable = file.metadata().await?.len();
            ctx.checkpoint.set_durable(durable);
            ctx.transferred.store(durable, Ordering::SeqCst);
            info!(
                "download_interrupted: {} {:?} durable={}",
                locator, interrupt, durable
            );
            return Ok(EngineOutcome::Interrupted(interrupt));
        }

        match stream.next().await {
            Some(Ok(bytes)) => {
                buffer.extend_from_slice(&bytes);
                if buffer.len() >= WRITE_BUFFER {
                    drain(&mut file, &mut buffer).await?;
                }
                written += bytes.len() as u64;
                ctx.transferred.store(written, Ordering::SeqCst);
                ctx.reporter.update(written);
            }
            Some(Err(e)) => {
                // Keep what was received so a later attempt can pick up
                // from the flushed prefix.
                if let Err(flush_err) = drain(&mut file, &mut buffer).await {
                    warn!(
                        "download_flush_failed: {} error={}",
                        path.display(),
                        flush_err
                    );
                }
                if let Ok(meta) = file.metadata().await {
                    ctx.checkpoint.set_durable(meta.len());
                }
                return Err(e);
            }
            None => break,
        }
    }

    drain(&mut file, &mut buffer).await?;
    let durable = file.metadata().await?.len();
    ctx.checkpoint.set_durable(durable);

    if total > 0 && written < total {
        return Err(TransferError::transport(
            format!("remote stream ended early: {} of {} bytes", written, total),
            true,
        ));
    }

    ctx.transferred.store(written, Ordering::SeqCst);
    ctx.reporter.finish(written);
    info!("download_done: {} bytes={}", locator, written);
    Ok(EngineOutcome::Completed)
}

/// Writes buffered bytes through to disk.
async fn drain(file: &mut fs::File, buffer: &mut Vec<u8>) -> Result<(), TransferError> {
    if !buffer.is_empty() {
        file.write_all(buffer).await?;
        buffer.clear();
    }
    file.flush().await?;
    Ok(())
}
