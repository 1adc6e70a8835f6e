//! Transfer lifecycle controller.
//!
//! The manager owns the registry, spawns engine attempts and settles their
//! outcomes: completed attempts leave the registry, interrupted ones park a
//! resume snapshot or clean up, failures with durable bytes stay resumable.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use log::{error, info, warn};
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::download::download_file;
use super::progress::{ProgressCallback, ProgressReporter};
use super::registry::{Interrupt, TransferRegistry};
use super::types::{
    ResumeSnapshot, TransferDescriptor, TransferDirection, TransferId, TransferStatus,
};
use super::upload::{upload_file, upload_stream, AttemptContext, Checkpoint, EngineOutcome};
use crate::error::TransferError;
use crate::remote::{ChunkStream, RemoteClient, RemoteLocator};

/// Running transfer handed back by the request methods.
#[derive(Debug)]
pub struct TransferHandle {
    id: TransferId,
    join: JoinHandle<Result<TransferStatus, TransferError>>,
}

impl TransferHandle {
    pub fn id(&self) -> &TransferId {
        &self.id
    }

    /// Waits for the attempt to settle and returns its terminal status.
    pub async fn wait(self) -> Result<TransferStatus, TransferError> {
        self.join
            .await
            .map_err(|e| TransferError::transport(format!("transfer task panicked: {}", e), false))?
    }
}

/// Drives uploads and downloads against one remote.
pub struct TransferManager {
    remote: Arc<dyn RemoteClient>,
    registry: Arc<TransferRegistry>,
}

impl TransferManager {
    pub fn new(remote: Arc<dyn RemoteClient>) -> Self {
        Self {
            remote,
            registry: Arc::new(TransferRegistry::new()),
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteClient> {
        &self.remote
    }

    /// Starts uploading a local file. The content type is guessed from the
    /// file name.
    pub async fn request_upload(
        &self,
        local_path: impl AsRef<Path>,
        remote: RemoteLocator,
        on_progress: Option<ProgressCallback>,
    ) -> Result<TransferHandle, TransferError> {
        let path = local_path.as_ref().to_path_buf();
        let meta = fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(TransferError::State(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let content_type = mime_guess::from_path(&path).first_raw().map(str::to_string);
        self.spawn_upload(path, remote, meta.len(), 0, content_type, on_progress)
    }

    /// Starts uploading from an in-memory chunk source. Pass the expected
    /// size when known so the part plan fits it; zero means unknown.
    pub fn request_upload_stream<S>(
        &self,
        source: S,
        remote: RemoteLocator,
        estimated_size: u64,
        on_progress: Option<ProgressCallback>,
    ) -> Result<TransferHandle, TransferError>
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        let id = TransferId::new();
        let descriptor = TransferDescriptor {
            id: id.clone(),
            direction: TransferDirection::Upload,
            remote: remote.clone(),
            local_path: None,
            total_bytes: estimated_size,
            transferred_bytes: 0,
            status: TransferStatus::Active,
            started_at: Utc::now().timestamp(),
        };
        let registration = self.registry.register(descriptor)?;
        let ctx = AttemptContext {
            signal: registration.signal,
            transferred: registration.transferred,
            reporter: Arc::new(ProgressReporter::new(
                id.to_string(),
                estimated_size,
                0,
                on_progress,
            )),
            checkpoint: Arc::new(Checkpoint::new(0)),
        };
        let content_type = mime_guess::from_path(&remote.key).first_raw().map(str::to_string);
        info!("upload_start: <stream> -> {} size={}", remote, estimated_size);

        let client = Arc::clone(&self.remote);
        let registry = Arc::clone(&self.registry);
        let task_id = id.clone();
        let body: ChunkStream = Box::pin(source.map(Ok));
        let join = tokio::spawn(async move {
            let result =
                upload_stream(client, &remote, body, estimated_size, content_type, ctx.clone())
                    .await;
            settle(
                &registry,
                task_id,
                TransferDirection::Upload,
                remote,
                None,
                estimated_size,
                ctx,
                result,
            )
            .await
        });
        Ok(TransferHandle { id, join })
    }

    /// Starts downloading a remote object into `local_path`. The object is
    /// stat'ed first, so a missing key fails here rather than mid-stream.
    pub async fn request_download(
        &self,
        remote: RemoteLocator,
        local_path: impl AsRef<Path>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<TransferHandle, TransferError> {
        let info = self.remote.stat(&remote).await?;
        self.spawn_download(
            remote,
            local_path.as_ref().to_path_buf(),
            info.size,
            0,
            false,
            on_progress,
        )
    }

    /// Pauses an active transfer and returns its resume snapshot. Pausing
    /// an already parked transfer returns the existing snapshot.
    pub async fn pause(&self, id: &TransferId) -> Result<ResumeSnapshot, TransferError> {
        if let Some(snapshot) = self.registry.snapshot(id) {
            return Ok(snapshot);
        }
        let Some((signal, mut status_rx)) = self.registry.subscribe(id) else {
            // The attempt can park itself between the check above and the
            // subscribe; re-check before calling the id unknown.
            return self
                .registry
                .snapshot(id)
                .ok_or_else(|| TransferError::NotFound(id.to_string()));
        };
        signal.request_pause();
        info!("pause_requested: id={}", id);

        match wait_terminal(&mut status_rx).await {
            TransferStatus::Paused => self.registry.snapshot(id).ok_or_else(|| {
                TransferError::State(format!("paused transfer {} left no snapshot", id))
            }),
            TransferStatus::Failed => {
                // The engine failed while the pause was in flight. Durable
                // bytes still park a snapshot, so hand that back if present.
                self.registry.snapshot(id).ok_or_else(|| {
                    TransferError::State(format!("transfer {} failed before pausing", id))
                })
            }
            other => Err(TransferError::State(format!(
                "transfer {} settled as {} before pausing",
                id, other
            ))),
        }
    }

    /// Resumes a parked transfer under a fresh attempt id, consuming its
    /// snapshot. Uploads restart past the snapshot offset; downloads pick
    /// up from whatever the destination file holds on disk. `local_path`
    /// supplies the source for resumed uploads whose snapshot has none
    /// (stream-sourced ones) and overrides the recorded source otherwise.
    pub async fn resume(
        &self,
        id: &TransferId,
        local_path: Option<&Path>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<TransferHandle, TransferError> {
        if self.registry.is_active(id) {
            return Err(TransferError::State(format!(
                "transfer {} is already active",
                id
            )));
        }
        let parked = self
            .registry
            .snapshot(id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;

        // Validate and re-stat before consuming, so a rejected resume
        // leaves the snapshot parked. The attempt's total comes from a
        // fresh stat, never the parked snapshot: the source file or the
        // remote object may have changed size while parked, and the
        // stream-upload sentinel (total 0, unknown) must not survive
        // into an attempt that has a real source.
        let (path, total) = match parked.direction {
            TransferDirection::Upload => {
                let path = local_path
                    .map(Path::to_path_buf)
                    .or_else(|| parked.local_path.clone())
                    .ok_or_else(|| {
                        TransferError::State(format!("upload {} needs a source path to resume", id))
                    })?;
                let meta = fs::metadata(&path).await?;
                if !meta.is_file() {
                    return Err(TransferError::State(format!(
                        "{} is not a regular file",
                        path.display()
                    )));
                }
                (path, meta.len())
            }
            TransferDirection::Download => {
                let path = parked.local_path.clone().ok_or_else(|| {
                    TransferError::State(format!("download {} has no destination path", id))
                })?;
                let info = self.remote.stat(&parked.remote).await?;
                (path, info.size)
            }
        };

        let snapshot = self
            .registry
            .take_snapshot(id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        info!(
            "resume: id={} {} {} durable={} total={}",
            id, snapshot.direction, snapshot.remote, snapshot.transferred_bytes, total
        );

        match snapshot.direction {
            TransferDirection::Upload => {
                let content_type = mime_guess::from_path(&path).first_raw().map(str::to_string);
                self.spawn_upload(
                    path,
                    snapshot.remote,
                    total,
                    snapshot.transferred_bytes,
                    content_type,
                    on_progress,
                )
            }
            TransferDirection::Download => {
                let on_disk = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                self.spawn_download(snapshot.remote, path, total, on_disk, true, on_progress)
            }
        }
    }

    /// Cancels an active or parked transfer. Active attempts abort their
    /// remote session; cancelled downloads delete the partial file.
    pub async fn cancel(&self, id: &TransferId) -> Result<(), TransferError> {
        if let Some((signal, mut status_rx)) = self.registry.subscribe(id) {
            signal.request_cancel();
            info!("cancel_requested: id={}", id);
            let status = wait_terminal(&mut status_rx).await;
            info!("cancel_settled: id={} status={}", id, status);
            // A pause that raced ahead leaves a snapshot to clean up below.
            if status != TransferStatus::Paused {
                return Ok(());
            }
        }
        match self.registry.take_snapshot(id) {
            Some(snapshot) => {
                if snapshot.direction == TransferDirection::Download {
                    if let Some(path) = &snapshot.local_path {
                        remove_partial(path).await;
                    }
                }
                info!("cancel_parked: id={}", id);
                Ok(())
            }
            None => Err(TransferError::NotFound(id.to_string())),
        }
    }

    /// Cancels everything: every active attempt and every parked snapshot.
    pub async fn cancel_all(&self) -> Result<(), TransferError> {
        let ids = self.registry.active_ids();
        info!("cancel_all: active={}", ids.len());

        let mut waiters = Vec::new();
        for id in &ids {
            if let Some((signal, rx)) = self.registry.subscribe(id) {
                signal.request_cancel();
                waiters.push(rx);
            }
        }
        for mut rx in waiters {
            let _ = wait_terminal(&mut rx).await;
        }

        for snapshot in self.registry.drain_paused() {
            if snapshot.direction == TransferDirection::Download {
                if let Some(path) = &snapshot.local_path {
                    remove_partial(path).await;
                }
            }
        }
        Ok(())
    }

    pub fn active_transfers(&self) -> Vec<TransferDescriptor> {
        self.registry.list_active()
    }

    pub fn paused_transfers(&self) -> Vec<ResumeSnapshot> {
        self.registry.list_paused()
    }

    fn spawn_upload(
        &self,
        path: PathBuf,
        remote: RemoteLocator,
        total: u64,
        start_at: u64,
        content_type: Option<String>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<TransferHandle, TransferError> {
        let id = TransferId::new();
        let descriptor = TransferDescriptor {
            id: id.clone(),
            direction: TransferDirection::Upload,
            remote: remote.clone(),
            local_path: Some(path.clone()),
            total_bytes: total,
            transferred_bytes: start_at,
            status: TransferStatus::Active,
            started_at: Utc::now().timestamp(),
        };
        let registration = self.registry.register(descriptor)?;
        let ctx = AttemptContext {
            signal: registration.signal,
            transferred: registration.transferred,
            reporter: Arc::new(ProgressReporter::new(id.to_string(), total, start_at, on_progress)),
            checkpoint: Arc::new(Checkpoint::new(start_at)),
        };
        info!(
            "upload_start: {} -> {} size={} start={}",
            path.display(),
            remote,
            total,
            start_at
        );

        let client = Arc::clone(&self.remote);
        let registry = Arc::clone(&self.registry);
        let task_id = id.clone();
        let join = tokio::spawn(async move {
            let result =
                upload_file(client, &remote, &path, total, start_at, content_type, ctx.clone())
                    .await;
            settle(
                &registry,
                task_id,
                TransferDirection::Upload,
                remote,
                Some(path),
                total,
                ctx,
                result,
            )
            .await
        });
        Ok(TransferHandle { id, join })
    }

    fn spawn_download(
        &self,
        remote: RemoteLocator,
        path: PathBuf,
        total: u64,
        baseline: u64,
        resume: bool,
        on_progress: Option<ProgressCallback>,
    ) -> Result<TransferHandle, TransferError> {
        let id = TransferId::new();
        let descriptor = TransferDescriptor {
            id: id.clone(),
            direction: TransferDirection::Download,
            remote: remote.clone(),
            local_path: Some(path.clone()),
            total_bytes: total,
            transferred_bytes: baseline,
            status: TransferStatus::Active,
            started_at: Utc::now().timestamp(),
        };
        let registration = self.registry.register(descriptor)?;
        let ctx = AttemptContext {
            signal: registration.signal,
            transferred: registration.transferred,
            reporter: Arc::new(ProgressReporter::new(id.to_string(), total, baseline, on_progress)),
            checkpoint: Arc::new(Checkpoint::new(baseline)),
        };

        let client = Arc::clone(&self.remote);
        let registry = Arc::clone(&self.registry);
        let task_id = id.clone();
        let join = tokio::spawn(async move {
            let result = download_file(client, &remote, &path, total, resume, ctx.clone()).await;
            settle(
                &registry,
                task_id,
                TransferDirection::Download,
                remote,
                Some(path),
                total,
                ctx,
                result,
            )
            .await
        });
        Ok(TransferHandle { id, join })
    }
}

/// Folds an engine result into the registry and the returned status.
#[allow(clippy::too_many_arguments)]
async fn settle(
    registry: &TransferRegistry,
    id: TransferId,
    direction: TransferDirection,
    remote: RemoteLocator,
    local_path: Option<PathBuf>,
    total: u64,
    ctx: AttemptContext,
    result: Result<EngineOutcome, TransferError>,
) -> Result<TransferStatus, TransferError> {
    match result {
        Ok(EngineOutcome::Completed) => {
            registry.finish(&id, TransferStatus::Completed);
            info!("{}_done: {} id={}", direction, remote, id);
            Ok(TransferStatus::Completed)
        }
        Ok(EngineOutcome::Interrupted(Interrupt::Pause)) => {
            let snapshot = ResumeSnapshot {
                transfer_id: id.clone(),
                direction,
                remote,
                local_path,
                total_bytes: total,
                transferred_bytes: ctx.checkpoint.durable(),
                remote_session_token: ctx.checkpoint.session(),
                captured_at: Utc::now().timestamp(),
            };
            info!(
                "{}_paused: id={} durable={}",
                direction, id, snapshot.transferred_bytes
            );
            registry.park(&id, TransferStatus::Paused, snapshot);
            Ok(TransferStatus::Paused)
        }
        Ok(EngineOutcome::Interrupted(Interrupt::Cancel)) => {
            if direction == TransferDirection::Download {
                if let Some(path) = &local_path {
                    remove_partial(path).await;
                }
            }
            registry.finish(&id, TransferStatus::Cancelled);
            info!("{}_cancelled: id={}", direction, id);
            Ok(TransferStatus::Cancelled)
        }
        Err(e) => {
            let durable = ctx.checkpoint.durable();
            if durable > 0 {
                let snapshot = ResumeSnapshot {
                    transfer_id: id.clone(),
                    direction,
                    remote: remote.clone(),
                    local_path,
                    total_bytes: total,
                    transferred_bytes: durable,
                    remote_session_token: ctx.checkpoint.session(),
                    captured_at: Utc::now().timestamp(),
                };
                registry.park(&id, TransferStatus::Failed, snapshot);
            } else {
                registry.finish(&id, TransferStatus::Failed);
            }
            error!(
                "{}_failed: {} id={} durable={} error={}",
                direction, remote, id, durable, e
            );
            Err(e)
        }
    }
}

/// Blocks until the status feed leaves `Active`.
async fn wait_terminal(rx: &mut watch::Receiver<TransferStatus>) -> TransferStatus {
    loop {
        let status = *rx.borrow_and_update();
        if status != TransferStatus::Active {
            return status;
        }
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => info!("partial_removed: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("partial_remove_failed: {} error={}", path.display(), e),
    }
}
