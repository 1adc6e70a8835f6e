//! Upload engine.
//!
//! Bodies at or below [`SINGLE_PART_THRESHOLD`] go up as one streamed put.
//! Larger bodies on multipart-capable remotes fan out over a bounded pool
//! of part workers; remotes without multipart stream the whole body in one
//! put session. A resumed attempt transfers the bytes past the snapshot
//! offset into a fresh session.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use log::{info, warn};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::progress::ProgressReporter;
use super::registry::{Interrupt, TransferSignal};
use super::sizing::{plan_for_size, SINGLE_PART_THRESHOLD};
use crate::error::TransferError;
use crate::remote::{ChunkStream, RemoteClient, RemoteLocator, UploadedPart};

/// Read granularity for streamed puts.
const READ_CHUNK: usize = 64 * 1024;

/// How an engine run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    Completed,
    Interrupted(Interrupt),
}

/// Durable-progress record an attempt keeps current while it runs. The
/// wrapper task reads it after an interruption or failure to build the
/// resume snapshot.
pub struct Checkpoint {
    durable: AtomicU64,
    session: Mutex<Option<String>>,
}

impl Checkpoint {
    pub fn new(durable: u64) -> Self {
        Self {
            durable: AtomicU64::new(durable),
            session: Mutex::new(None),
        }
    }

    pub fn durable(&self) -> u64 {
        self.durable.load(Ordering::SeqCst)
    }

    pub fn set_durable(&self, bytes: u64) {
        self.durable.store(bytes, Ordering::SeqCst);
    }

    pub fn session(&self) -> Option<String> {
        self.session.lock().unwrap().clone()
    }

    pub fn set_session(&self, token: String) {
        *self.session.lock().unwrap() = Some(token);
    }

    pub fn clear_session(&self) {
        *self.session.lock().unwrap() = None;
    }
}

/// Shared handles threaded through one transfer attempt.
#[derive(Clone)]
pub struct AttemptContext {
    pub signal: TransferSignal,
    pub transferred: Arc<AtomicU64>,
    pub reporter: Arc<ProgressReporter>,
    pub checkpoint: Arc<Checkpoint>,
}

/// Uploads a local file to `locator`, starting `start_at` bytes in.
pub async fn upload_file(
    remote: Arc<dyn RemoteClient>,
    locator: &RemoteLocator,
    path: &Path,
    total: u64,
    start_at: u64,
    content_type: Option<String>,
    ctx: AttemptContext,
) -> Result<EngineOutcome, TransferError> {
    if total > 0 && start_at >= total {
        ctx.transferred.store(total, Ordering::SeqCst);
        ctx.reporter.finish(total);
        return Ok(EngineOutcome::Completed);
    }

    let remaining = total - start_at;
    if remaining <= SINGLE_PART_THRESHOLD || remote.multipart().is_none() {
        put_file_single(
            remote,
            locator,
            path,
            total,
            start_at,
            content_type,
            remaining <= SINGLE_PART_THRESHOLD,
            ctx,
        )
        .await
    } else {
        upload_file_parts(remote, locator, path, total, start_at, content_type, ctx).await
    }
}

/// Streams `[start_at..EOF]` of the file as one put.
#[allow(clippy::too_many_arguments)]
async fn put_file_single(
    remote: Arc<dyn RemoteClient>,
    locator: &RemoteLocator,
    path: &Path,
    total: u64,
    start_at: u64,
    content_type: Option<String>,
    unthrottled: bool,
    ctx: AttemptContext,
) -> Result<EngineOutcome, TransferError> {
    let mut file = fs::File::open(path).await?;
    if start_at > 0 {
        file.seek(SeekFrom::Start(start_at)).await?;
    }

    let remaining = total - start_at;
    let interrupted = Arc::new(AtomicBool::new(false));
    let body = read_stream(
        file,
        start_at,
        unthrottled,
        Arc::clone(&interrupted),
        ctx.clone(),
    );
    match remote
        .put_stream(locator, body, Some(remaining), content_type.as_deref())
        .await
    {
        Ok(_written) => {
            ctx.transferred.store(total, Ordering::SeqCst);
            ctx.reporter.finish(total);
            Ok(EngineOutcome::Completed)
        }
        Err(e) => {
            // The read stream raises a sentinel error once a flag is set,
            // and only a put cut short by that sentinel counts as an
            // interruption. A put that failed on its own propagates even
            // when a flag was raised concurrently.
            if interrupted.load(Ordering::SeqCst) {
                if let Some(interrupt) = ctx.signal.interruption() {
                    return Ok(EngineOutcome::Interrupted(interrupt));
                }
            }
            Err(e)
        }
    }
}

/// File reads as a chunk stream, counting bytes as they leave disk.
/// `interrupted` records that the stream was cut by the attempt's signal
/// rather than running to EOF.
fn read_stream(
    file: fs::File,
    base: u64,
    unthrottled: bool,
    interrupted: Arc<AtomicBool>,
    ctx: AttemptContext,
) -> ChunkStream {
    Box::pin(stream::unfold((file, 0u64), move |(mut file, sent)| {
        let ctx = ctx.clone();
        let interrupted = Arc::clone(&interrupted);
        async move {
            if ctx.signal.interruption().is_some() {
                interrupted.store(true, Ordering::SeqCst);
                return Some((
                    Err(TransferError::transport("upload interrupted", false)),
                    (file, sent),
                ));
            }
            let mut buf = vec![0u8; READ_CHUNK];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    let sent = sent + n as u64;
                    ctx.transferred.store(base + sent, Ordering::SeqCst);
                    if unthrottled {
                        ctx.reporter.update_now(base + sent);
                    } else {
                        ctx.reporter.update(base + sent);
                    }
                    Some((Ok(Bytes::from(buf)), (file, sent)))
                }
                Err(e) => Some((Err(TransferError::Io(e)), (file, sent))),
            }
        }
    }))
}

/// Multipart upload of `[start_at..total]` with bounded part concurrency.
async fn upload_file_parts(
    remote: Arc<dyn RemoteClient>,
    locator: &RemoteLocator,
    path: &Path,
    total: u64,
    start_at: u64,
    content_type: Option<String>,
    ctx: AttemptContext,
) -> Result<EngineOutcome, TransferError> {
    let remaining = total - start_at;
    let plan = plan_for_size(remaining);
    let part_count = plan.part_count(remaining);

    let mp = remote
        .multipart()
        .ok_or_else(|| multipart_unsupported(remote.scheme()))?;
    let session = mp.create_session(locator, content_type.as_deref()).await?;
    ctx.checkpoint.set_session(session.clone());
    info!(
        "upload_session_open: {} session={} parts={} part_size={}",
        locator, session, part_count, plan.part_size
    );

    let semaphore = Arc::new(Semaphore::new(plan.concurrency));
    let acked: Arc<Mutex<Vec<(UploadedPart, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let failed = Arc::new(AtomicBool::new(false));
    let mut handles: Vec<JoinHandle<Result<(), TransferError>>> =
        Vec::with_capacity(part_count as usize);

    for part_number in 1..=part_count {
        if ctx.signal.interruption().is_some() || failed.load(Ordering::SeqCst) {
            break;
        }
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|e| TransferError::transport(format!("part scheduler stopped: {}", e), false))?;

        let remote = Arc::clone(&remote);
        let locator = locator.clone();
        let path = path.to_path_buf();
        let session = session.clone();
        let ctx = ctx.clone();
        let acked = Arc::clone(&acked);
        let failed = Arc::clone(&failed);
        let part_size = plan.part_size;

        handles.push(tokio::spawn(async move {
            let _permit = permit;
            if ctx.signal.interruption().is_some() || failed.load(Ordering::SeqCst) {
                return Ok(());
            }
            let result = send_file_part(
                &remote,
                &locator,
                &path,
                &session,
                part_number,
                part_size,
                total,
                start_at,
                &ctx,
                &acked,
            )
            .await;
            if result.is_err() {
                failed.store(true, Ordering::SeqCst);
            }
            result
        }));
    }

    let mut first_error: Option<TransferError> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error =
                        Some(TransferError::transport(format!("part task failed: {}", e), false));
                }
            }
        }
    }

    if let Some(e) = first_error {
        warn!("upload_failed: {} session={} error={}", locator, session, e);
        abort_quietly(&remote, locator, &session).await;
        return Err(e);
    }
    if let Some(interrupt) = ctx.signal.interruption() {
        info!("upload_interrupted: {} session={} {:?}", locator, session, interrupt);
        abort_quietly(&remote, locator, &session).await;
        return Ok(EngineOutcome::Interrupted(interrupt));
    }

    let mut parts: Vec<UploadedPart> = {
        let mut held = acked.lock().unwrap();
        held.drain(..).map(|(part, _)| part).collect()
    };
    parts.sort_by_key(|p| p.part_number);
    if let Err(e) = mp.complete_session(locator, &session, parts).await {
        warn!("upload_complete_failed: {} session={} error={}", locator, session, e);
        abort_quietly(&remote, locator, &session).await;
        return Err(e);
    }
    ctx.checkpoint.clear_session();
    ctx.transferred.store(total, Ordering::SeqCst);
    ctx.reporter.finish(total);
    info!("upload_session_done: {} session={}", locator, session);
    Ok(EngineOutcome::Completed)
}

/// Reads one part from disk and sends it. Parts own their file handle so
/// concurrent reads never share a seek position.
#[allow(clippy::too_many_arguments)]
async fn send_file_part(
    remote: &Arc<dyn RemoteClient>,
    locator: &RemoteLocator,
    path: &Path,
    session: &str,
    part_number: u64,
    part_size: u64,
    total: u64,
    start_at: u64,
    ctx: &AttemptContext,
    acked: &Arc<Mutex<Vec<(UploadedPart, u64)>>>,
) -> Result<(), TransferError> {
    let offset = start_at + (part_number - 1) * part_size;
    let len = part_size.min(total - offset);

    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;

    send_part(
        remote,
        locator,
        session,
        part_number,
        Bytes::from(buf),
        start_at,
        ctx,
        acked,
    )
    .await
}

/// Uploads one prepared part body and records the ack.
#[allow(clippy::too_many_arguments)]
async fn send_part(
    remote: &Arc<dyn RemoteClient>,
    locator: &RemoteLocator,
    session: &str,
    part_number: u64,
    body: Bytes,
    start_at: u64,
    ctx: &AttemptContext,
    acked: &Arc<Mutex<Vec<(UploadedPart, u64)>>>,
) -> Result<(), TransferError> {
    let len = body.len() as u64;
    let mp = remote
        .multipart()
        .ok_or_else(|| multipart_unsupported(remote.scheme()))?;
    let receipt = mp
        .upload_part(locator, session, part_number as i32, body)
        .await?;

    let spans: Vec<(u64, u64)> = {
        let mut held = acked.lock().unwrap();
        held.push((receipt, len));
        held.iter().map(|(r, l)| (r.part_number as u64, *l)).collect()
    };
    ctx.checkpoint.set_durable(start_at + contiguous_bytes(&spans));
    let total_acked = ctx.transferred.fetch_add(len, Ordering::SeqCst) + len;
    ctx.reporter.update(total_acked);
    Ok(())
}

/// Uploads from an in-memory chunk source of possibly unknown size.
///
/// Chunks buffer into plan-sized parts once the body outgrows a single
/// put; the multipart session opens lazily when the first part fills.
pub async fn upload_stream(
    remote: Arc<dyn RemoteClient>,
    locator: &RemoteLocator,
    mut source: ChunkStream,
    estimated_size: u64,
    content_type: Option<String>,
    ctx: AttemptContext,
) -> Result<EngineOutcome, TransferError> {
    if remote.multipart().is_none() {
        return put_passthrough(remote, locator, source, estimated_size, content_type, ctx).await;
    }

    let plan = plan_for_size(estimated_size);
    let part_size = plan.part_size as usize;

    let semaphore = Arc::new(Semaphore::new(plan.concurrency));
    let acked: Arc<Mutex<Vec<(UploadedPart, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let failed = Arc::new(AtomicBool::new(false));
    let mut handles: Vec<JoinHandle<Result<(), TransferError>>> = Vec::new();

    let mut buffer: Vec<u8> = Vec::new();
    let mut session: Option<String> = None;
    let mut next_part: u64 = 1;
    let mut source_error: Option<TransferError> = None;

    'feed: while ctx.signal.interruption().is_none() && !failed.load(Ordering::SeqCst) {
        match source.next().await {
            Some(Ok(bytes)) => {
                buffer.extend_from_slice(&bytes);
                while buffer.len() >= part_size {
                    if ctx.signal.interruption().is_some() || failed.load(Ordering::SeqCst) {
                        break 'feed;
                    }
                    let body: Vec<u8> = buffer.drain(..part_size).collect();
                    let token = match &session {
                        Some(token) => token.clone(),
                        None => {
                            let token =
                                open_session(&remote, locator, content_type.as_deref(), &ctx)
                                    .await?;
                            session = Some(token.clone());
                            token
                        }
                    };
                    spawn_stream_part(
                        &mut handles,
                        &semaphore,
                        &remote,
                        locator,
                        &token,
                        next_part,
                        body,
                        &ctx,
                        &acked,
                        &failed,
                    )
                    .await?;
                    next_part += 1;
                }
            }
            Some(Err(e)) => {
                source_error = Some(e);
                break;
            }
            None => break,
        }
    }

    let interruption = ctx.signal.interruption();

    // No session means everything fit in the buffer: one plain put,
    // unless the feed stopped first.
    let Some(token) = session else {
        if let Some(e) = source_error {
            return Err(e);
        }
        if let Some(interrupt) = interruption {
            return Ok(EngineOutcome::Interrupted(interrupt));
        }
        let len = buffer.len() as u64;
        let body: ChunkStream = Box::pin(stream::iter(vec![Ok(Bytes::from(buffer))]));
        remote
            .put_stream(locator, body, Some(len), content_type.as_deref())
            .await?;
        ctx.transferred.store(len, Ordering::SeqCst);
        ctx.reporter.finish(len);
        return Ok(EngineOutcome::Completed);
    };

    // Tail part, only when the feed ran to EOF cleanly.
    if source_error.is_none() && interruption.is_none() && !buffer.is_empty() {
        let body: Vec<u8> = std::mem::take(&mut buffer);
        spawn_stream_part(
            &mut handles,
            &semaphore,
            &remote,
            locator,
            &token,
            next_part,
            body,
            &ctx,
            &acked,
            &failed,
        )
        .await?;
    }

    let mut first_error = source_error;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error =
                        Some(TransferError::transport(format!("part task failed: {}", e), false));
                }
            }
        }
    }

    if let Some(e) = first_error {
        warn!("upload_failed: {} session={} error={}", locator, token, e);
        abort_quietly(&remote, locator, &token).await;
        return Err(e);
    }
    if let Some(interrupt) = ctx.signal.interruption() {
        info!("upload_interrupted: {} session={} {:?}", locator, token, interrupt);
        abort_quietly(&remote, locator, &token).await;
        return Ok(EngineOutcome::Interrupted(interrupt));
    }

    let mp = remote
        .multipart()
        .ok_or_else(|| multipart_unsupported(remote.scheme()))?;
    let mut parts: Vec<UploadedPart> = {
        let mut held = acked.lock().unwrap();
        held.drain(..).map(|(part, _)| part).collect()
    };
    parts.sort_by_key(|p| p.part_number);
    if let Err(e) = mp.complete_session(locator, &token, parts).await {
        warn!("upload_complete_failed: {} session={} error={}", locator, token, e);
        abort_quietly(&remote, locator, &token).await;
        return Err(e);
    }
    ctx.checkpoint.clear_session();
    let written = ctx.transferred.load(Ordering::SeqCst);
    ctx.reporter.finish(written);
    info!("upload_session_done: {} session={}", locator, token);
    Ok(EngineOutcome::Completed)
}

/// Single-session streamed put for remotes without multipart support.
async fn put_passthrough(
    remote: Arc<dyn RemoteClient>,
    locator: &RemoteLocator,
    source: ChunkStream,
    estimated_size: u64,
    content_type: Option<String>,
    ctx: AttemptContext,
) -> Result<EngineOutcome, TransferError> {
    let counter = ctx.clone();
    let interrupted = Arc::new(AtomicBool::new(false));
    let sentinel = Arc::clone(&interrupted);
    let mut sent = 0u64;
    let body: ChunkStream = Box::pin(source.map(move |item| {
        if counter.signal.interruption().is_some() {
            sentinel.store(true, Ordering::SeqCst);
            return Err(TransferError::transport("upload interrupted", false));
        }
        let bytes = item?;
        sent += bytes.len() as u64;
        counter.transferred.store(sent, Ordering::SeqCst);
        counter.reporter.update(sent);
        Ok(bytes)
    }));

    let size_hint = (estimated_size > 0).then_some(estimated_size);
    match remote
        .put_stream(locator, body, size_hint, content_type.as_deref())
        .await
    {
        Ok(written) => {
            ctx.transferred.store(written, Ordering::SeqCst);
            ctx.reporter.finish(written);
            Ok(EngineOutcome::Completed)
        }
        Err(e) => {
            // Same rule as the file path: only a sentinel-cut put maps to
            // an interruption, everything else propagates.
            if interrupted.load(Ordering::SeqCst) {
                if let Some(interrupt) = ctx.signal.interruption() {
                    return Ok(EngineOutcome::Interrupted(interrupt));
                }
            }
            Err(e)
        }
    }
}

async fn open_session(
    remote: &Arc<dyn RemoteClient>,
    locator: &RemoteLocator,
    content_type: Option<&str>,
    ctx: &AttemptContext,
) -> Result<String, TransferError> {
    let mp = remote
        .multipart()
        .ok_or_else(|| multipart_unsupported(remote.scheme()))?;
    let token = mp.create_session(locator, content_type).await?;
    ctx.checkpoint.set_session(token.clone());
    info!("upload_session_open: {} session={}", locator, token);
    Ok(token)
}

#[allow(clippy::too_many_arguments)]
async fn spawn_stream_part(
    handles: &mut Vec<JoinHandle<Result<(), TransferError>>>,
    semaphore: &Arc<Semaphore>,
    remote: &Arc<dyn RemoteClient>,
    locator: &RemoteLocator,
    session: &str,
    part_number: u64,
    body: Vec<u8>,
    ctx: &AttemptContext,
    acked: &Arc<Mutex<Vec<(UploadedPart, u64)>>>,
    failed: &Arc<AtomicBool>,
) -> Result<(), TransferError> {
    let permit = Arc::clone(semaphore)
        .acquire_owned()
        .await
        .map_err(|e| TransferError::transport(format!("part scheduler stopped: {}", e), false))?;

    let remote = Arc::clone(remote);
    let locator = locator.clone();
    let session = session.to_string();
    let ctx = ctx.clone();
    let acked = Arc::clone(acked);
    let failed = Arc::clone(failed);

    handles.push(tokio::spawn(async move {
        let _permit = permit;
        let result = send_part(
            &remote,
            &locator,
            &session,
            part_number,
            Bytes::from(body),
            0,
            &ctx,
            &acked,
        )
        .await;
        if result.is_err() {
            failed.store(true, Ordering::SeqCst);
        }
        result
    }));
    Ok(())
}

async fn abort_quietly(remote: &Arc<dyn RemoteClient>, locator: &RemoteLocator, session: &str) {
    if let Some(mp) = remote.multipart() {
        if let Err(e) = mp.abort_session(locator, session).await {
            warn!("upload_abort_failed: {} session={} error={}", locator, session, e);
        }
    }
}

fn multipart_unsupported(scheme: &str) -> TransferError {
    TransferError::State(format!("multipart upload not supported by {} remote", scheme))
}

/// Bytes covered by the unbroken run of parts starting at part 1.
fn contiguous_bytes(spans: &[(u64, u64)]) -> u64 {
    let mut sorted: Vec<(u64, u64)> = spans.to_vec();
    sorted.sort_unstable_by_key(|(number, _)| *number);

    let mut next = 1u64;
    let mut bytes = 0u64;
    for (number, len) in sorted {
        if number == next {
            bytes += len;
            next += 1;
        } else if number > next {
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_run_sums_lengths() {
        let spans = [(1, 100), (2, 100), (3, 40)];
        assert_eq!(contiguous_bytes(&spans), 240);
    }

    #[test]
    fn gap_stops_the_run() {
        let spans = [(1, 100), (3, 100)];
        assert_eq!(contiguous_bytes(&spans), 100);
        let spans = [(2, 100), (4, 100)];
        assert_eq!(contiguous_bytes(&spans), 0);
    }

    #[test]
    fn completion_order_does_not_matter() {
        let spans = [(3, 40), (1, 100), (2, 100)];
        assert_eq!(contiguous_bytes(&spans), 240);
    }

    #[test]
    fn empty_spans_have_no_durable_bytes() {
        assert_eq!(contiguous_bytes(&[]), 0);
    }

    #[test]
    fn checkpoint_tracks_session_lifecycle() {
        let checkpoint = Checkpoint::new(10);
        assert_eq!(checkpoint.durable(), 10);
        assert!(checkpoint.session().is_none());

        checkpoint.set_session("session-1".into());
        checkpoint.set_durable(50);
        assert_eq!(checkpoint.session().as_deref(), Some("session-1"));
        assert_eq!(checkpoint.durable(), 50);

        checkpoint.clear_session();
        assert!(checkpoint.session().is_none());
    }
}
