//! In-memory remote used by the engine tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use xfer_engine::{
    ChunkStream, MultipartRemote, ObjectInfo, RemoteClient, RemoteEntry, RemoteLocator,
    TransferError, UploadedPart,
};

#[derive(Default)]
struct Sessions {
    counter: u64,
    open: HashMap<String, OpenSession>,
    aborted: Vec<String>,
}

struct OpenSession {
    key: String,
    parts: Vec<(i32, Bytes)>,
}

/// Object store backed by a map, with knobs to slow transfers down or
/// fail a stream partway through.
pub struct MemoryRemote {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    sessions: Mutex<Sessions>,
    fail_after_chunks: Mutex<Option<usize>>,
    fail_put_after: Mutex<Option<Duration>>,
    /// Chunk size served by `get_stream`.
    pub chunk_size: usize,
    /// Delay before each served chunk.
    pub chunk_delay: Duration,
    /// Delay inside each `upload_part`.
    pub part_delay: Duration,
    /// When false the remote only accepts whole-object puts.
    pub multipart_enabled: bool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Sessions::default()),
            fail_after_chunks: Mutex::new(None),
            fail_put_after: Mutex::new(None),
            chunk_size: 64 * 1024,
            chunk_delay: Duration::ZERO,
            part_delay: Duration::ZERO,
            multipart_enabled: true,
        }
    }

    pub fn with_object(self, key: &str, data: Vec<u8>) -> Self {
        self.objects.lock().unwrap().insert(key.to_string(), data);
        self
    }

    /// Replaces an object in place.
    pub fn insert_object(&self, key: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), data);
    }

    /// Makes `get_stream` fail after serving this many chunks. `None`
    /// clears the fault.
    pub fn set_fail_after(&self, chunks: Option<usize>) {
        *self.fail_after_chunks.lock().unwrap() = chunks;
    }

    /// Makes `put_stream` consume its source, wait, then fail without
    /// storing anything. `None` clears the fault.
    pub fn set_put_failure(&self, delay: Option<Duration>) {
        *self.fail_put_after.lock().unwrap() = delay;
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// Total multipart sessions ever opened.
    pub fn session_count(&self) -> u64 {
        self.sessions.lock().unwrap().counter
    }

    pub fn aborted_sessions(&self) -> Vec<String> {
        self.sessions.lock().unwrap().aborted.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().unwrap().open.len()
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    fn scheme(&self) -> &'static str {
        "mem"
    }

    async fn verify(&self) -> Result<(), TransferError> {
        Ok(())
    }

    async fn stat(&self, locator: &RemoteLocator) -> Result<ObjectInfo, TransferError> {
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(&locator.key)
            .ok_or_else(|| TransferError::transport(format!("no such key: {}", locator.key), false))?;
        Ok(ObjectInfo {
            size: data.len() as u64,
            etag: None,
            modified_at: None,
        })
    }

    async fn list(&self, locator: &RemoteLocator) -> Result<Vec<RemoteEntry>, TransferError> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|(key, _)| key.starts_with(&locator.key))
            .map(|(key, data)| RemoteEntry {
                key: key.clone(),
                size: data.len() as u64,
                is_dir: false,
                modified_at: None,
            })
            .collect())
    }

    async fn get_stream(
        &self,
        locator: &RemoteLocator,
        start: u64,
    ) -> Result<ChunkStream, TransferError> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(&locator.key)
            .cloned()
            .ok_or_else(|| {
                TransferError::transport(format!("no such key: {}", locator.key), false)
            })?;
        let start = (start as usize).min(data.len());
        let chunks: Vec<Bytes> = data[start..]
            .chunks(self.chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();

        let delay = self.chunk_delay;
        let fail_after = *self.fail_after_chunks.lock().unwrap();
        let stream = stream::unfold(
            (chunks.into_iter(), 0usize),
            move |(mut chunks, served)| async move {
                let bytes = chunks.next()?;
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                if let Some(limit) = fail_after {
                    if served >= limit {
                        return Some((
                            Err(TransferError::transport("injected stream failure", true)),
                            (chunks, served),
                        ));
                    }
                }
                Some((Ok(bytes), (chunks, served + 1)))
            },
        );
        Ok(Box::pin(stream))
    }

    async fn put_stream(
        &self,
        locator: &RemoteLocator,
        mut source: ChunkStream,
        _size_hint: Option<u64>,
        _content_type: Option<&str>,
    ) -> Result<u64, TransferError> {
        let mut data = Vec::new();
        while let Some(chunk) = source.next().await {
            let bytes = chunk?;
            data.extend_from_slice(&bytes);
        }
        let fail_after = *self.fail_put_after.lock().unwrap();
        if let Some(delay) = fail_after {
            tokio::time::sleep(delay).await;
            return Err(TransferError::transport("injected put failure", true));
        }
        let len = data.len() as u64;
        self.objects.lock().unwrap().insert(locator.key.clone(), data);
        Ok(len)
    }

    async fn delete(&self, locator: &RemoteLocator) -> Result<(), TransferError> {
        self.objects.lock().unwrap().remove(&locator.key);
        Ok(())
    }

    async fn rename(&self, from: &RemoteLocator, to: &RemoteLocator) -> Result<(), TransferError> {
        let mut objects = self.objects.lock().unwrap();
        let data = objects
            .remove(&from.key)
            .ok_or_else(|| TransferError::transport(format!("no such key: {}", from.key), false))?;
        objects.insert(to.key.clone(), data);
        Ok(())
    }

    async fn mkdir(&self, _locator: &RemoteLocator) -> Result<(), TransferError> {
        Ok(())
    }

    fn multipart(&self) -> Option<&dyn MultipartRemote> {
        if self.multipart_enabled {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl MultipartRemote for MemoryRemote {
    async fn create_session(
        &self,
        locator: &RemoteLocator,
        _content_type: Option<&str>,
    ) -> Result<String, TransferError> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.counter += 1;
        let token = format!("session-{}", sessions.counter);
        sessions.open.insert(
            token.clone(),
            OpenSession {
                key: locator.key.clone(),
                parts: Vec::new(),
            },
        );
        Ok(token)
    }

    async fn upload_part(
        &self,
        _locator: &RemoteLocator,
        session: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, TransferError> {
        if self.part_delay > Duration::ZERO {
            tokio::time::sleep(self.part_delay).await;
        }
        let mut sessions = self.sessions.lock().unwrap();
        let open = sessions
            .open
            .get_mut(session)
            .ok_or_else(|| TransferError::transport(format!("unknown session {}", session), false))?;
        open.parts.push((part_number, body));
        Ok(UploadedPart {
            part_number,
            etag: format!("etag-{}", part_number),
        })
    }

    async fn complete_session(
        &self,
        _locator: &RemoteLocator,
        session: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), TransferError> {
        let mut sessions = self.sessions.lock().unwrap();
        let open = sessions
            .open
            .remove(session)
            .ok_or_else(|| TransferError::transport(format!("unknown session {}", session), false))?;

        let mut data = Vec::new();
        for part in &parts {
            let (_, bytes) = open
                .parts
                .iter()
                .find(|(number, _)| *number == part.part_number)
                .ok_or_else(|| {
                    TransferError::transport(format!("part {} was never uploaded", part.part_number), false)
                })?;
            data.extend_from_slice(bytes);
        }
        drop(sessions);
        self.objects.lock().unwrap().insert(open.key, data);
        Ok(())
    }

    async fn abort_session(
        &self,
        _locator: &RemoteLocator,
        session: &str,
    ) -> Result<(), TransferError> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.open.remove(session);
        sessions.aborted.push(session.to_string());
        Ok(())
    }
}
