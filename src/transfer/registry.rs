//! In-memory registry of live transfers and parked resume snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::types::{ResumeSnapshot, TransferDescriptor, TransferId, TransferStatus};
use crate::error::TransferError;

/// Cooperative interruption flags checked by the engines at part and
/// chunk boundaries.
#[derive(Debug, Clone, Default)]
pub struct TransferSignal {
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancel,
    Pause,
}

impl TransferSignal {
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Cancel wins when both flags are set.
    pub fn interruption(&self) -> Option<Interrupt> {
        if self.cancel.load(Ordering::SeqCst) {
            Some(Interrupt::Cancel)
        } else if self.pause.load(Ordering::SeqCst) {
            Some(Interrupt::Pause)
        } else {
            None
        }
    }
}

/// What `register` hands back to the engine wrapper.
#[derive(Debug)]
pub struct Registration {
    pub signal: TransferSignal,
    pub transferred: Arc<AtomicU64>,
}

struct ActiveEntry {
    descriptor: TransferDescriptor,
    signal: TransferSignal,
    transferred: Arc<AtomicU64>,
    status_tx: watch::Sender<TransferStatus>,
}

/// Tracks running transfers and snapshots of paused ones.
///
/// Locks guard short critical sections and are never held across awaits.
#[derive(Default)]
pub struct TransferRegistry {
    active: Mutex<HashMap<TransferId, ActiveEntry>>,
    paused: Mutex<HashMap<TransferId, ResumeSnapshot>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a transfer. At most one active transfer may exist per
    /// (direction, remote locator) pair.
    pub fn register(&self, descriptor: TransferDescriptor) -> Result<Registration, TransferError> {
        let mut active = self.active.lock().unwrap();
        if active.values().any(|entry| {
            entry.descriptor.direction == descriptor.direction
                && entry.descriptor.remote == descriptor.remote
        }) {
            return Err(TransferError::State(format!(
                "{} already active for {}",
                descriptor.direction, descriptor.remote
            )));
        }

        let signal = TransferSignal::default();
        let transferred = Arc::new(AtomicU64::new(descriptor.transferred_bytes));
        let (status_tx, _) = watch::channel(TransferStatus::Active);
        let registration = Registration {
            signal: signal.clone(),
            transferred: Arc::clone(&transferred),
        };
        active.insert(
            descriptor.id.clone(),
            ActiveEntry {
                descriptor,
                signal,
                transferred,
                status_tx,
            },
        );
        Ok(registration)
    }

    /// Removes an active transfer, broadcasting its terminal status first.
    pub fn finish(&self, id: &TransferId, status: TransferStatus) {
        let mut active = self.active.lock().unwrap();
        if let Some(entry) = active.remove(id) {
            entry.status_tx.send_replace(status);
        }
    }

    /// Moves an active transfer into the parked set with its snapshot.
    pub fn park(&self, id: &TransferId, status: TransferStatus, snapshot: ResumeSnapshot) {
        let mut paused = self.paused.lock().unwrap();
        paused.insert(snapshot.transfer_id.clone(), snapshot);
        drop(paused);

        let mut active = self.active.lock().unwrap();
        if let Some(entry) = active.remove(id) {
            entry.status_tx.send_replace(status);
        }
    }

    pub fn is_active(&self, id: &TransferId) -> bool {
        self.active.lock().unwrap().contains_key(id)
    }

    /// Peeks at a parked snapshot without consuming it.
    pub fn snapshot(&self, id: &TransferId) -> Option<ResumeSnapshot> {
        self.paused.lock().unwrap().get(id).cloned()
    }

    /// Consumes a parked snapshot. Resume and cancel both go through here,
    /// so a snapshot is used at most once.
    pub fn take_snapshot(&self, id: &TransferId) -> Option<ResumeSnapshot> {
        self.paused.lock().unwrap().remove(id)
    }

    /// Interruption signal and status feed for one active transfer.
    pub fn subscribe(
        &self,
        id: &TransferId,
    ) -> Option<(TransferSignal, watch::Receiver<TransferStatus>)> {
        let active = self.active.lock().unwrap();
        active
            .get(id)
            .map(|entry| (entry.signal.clone(), entry.status_tx.subscribe()))
    }

    pub fn active_ids(&self) -> Vec<TransferId> {
        self.active.lock().unwrap().keys().cloned().collect()
    }

    /// Descriptors of running transfers with live byte counts.
    pub fn list_active(&self) -> Vec<TransferDescriptor> {
        let active = self.active.lock().unwrap();
        active
            .values()
            .map(|entry| {
                let mut descriptor = entry.descriptor.clone();
                descriptor.transferred_bytes = entry.transferred.load(Ordering::SeqCst);
                descriptor
            })
            .collect()
    }

    pub fn list_paused(&self) -> Vec<ResumeSnapshot> {
        self.paused.lock().unwrap().values().cloned().collect()
    }

    /// Empties the parked set, returning what was in it.
    pub fn drain_paused(&self) -> Vec<ResumeSnapshot> {
        self.paused.lock().unwrap().drain().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteLocator;
    use crate::transfer::types::TransferDirection;

    fn descriptor(direction: TransferDirection, key: &str) -> TransferDescriptor {
        TransferDescriptor {
            id: TransferId::new(),
            direction,
            remote: RemoteLocator::new("bucket", key),
            local_path: None,
            total_bytes: 100,
            transferred_bytes: 0,
            status: TransferStatus::Active,
            started_at: 0,
        }
    }

    fn snapshot_for(descriptor: &TransferDescriptor) -> ResumeSnapshot {
        ResumeSnapshot {
            transfer_id: descriptor.id.clone(),
            direction: descriptor.direction,
            remote: descriptor.remote.clone(),
            local_path: None,
            total_bytes: descriptor.total_bytes,
            transferred_bytes: 40,
            remote_session_token: None,
            captured_at: 0,
        }
    }

    #[test]
    fn rejects_duplicate_active_identity() {
        let registry = TransferRegistry::new();
        registry
            .register(descriptor(TransferDirection::Upload, "a.bin"))
            .unwrap();
        let err = registry
            .register(descriptor(TransferDirection::Upload, "a.bin"))
            .unwrap_err();
        assert!(matches!(err, TransferError::State(_)));
    }

    #[test]
    fn same_locator_different_direction_is_allowed() {
        let registry = TransferRegistry::new();
        registry
            .register(descriptor(TransferDirection::Upload, "a.bin"))
            .unwrap();
        registry
            .register(descriptor(TransferDirection::Download, "a.bin"))
            .unwrap();
        assert_eq!(registry.list_active().len(), 2);
    }

    #[test]
    fn finish_broadcasts_then_removes() {
        let registry = TransferRegistry::new();
        let desc = descriptor(TransferDirection::Upload, "a.bin");
        let id = desc.id.clone();
        registry.register(desc).unwrap();

        let (_, rx) = registry.subscribe(&id).unwrap();
        registry.finish(&id, TransferStatus::Completed);

        assert!(!registry.is_active(&id));
        assert_eq!(*rx.borrow(), TransferStatus::Completed);
    }

    #[test]
    fn park_moves_transfer_to_paused_set() {
        let registry = TransferRegistry::new();
        let desc = descriptor(TransferDirection::Download, "b.bin");
        let id = desc.id.clone();
        let snap = snapshot_for(&desc);
        registry.register(desc).unwrap();

        registry.park(&id, TransferStatus::Paused, snap);

        assert!(!registry.is_active(&id));
        assert_eq!(registry.snapshot(&id).unwrap().transferred_bytes, 40);
        // Consuming takes it out for good.
        assert!(registry.take_snapshot(&id).is_some());
        assert!(registry.take_snapshot(&id).is_none());
    }

    #[test]
    fn parked_identity_does_not_block_new_transfers() {
        let registry = TransferRegistry::new();
        let desc = descriptor(TransferDirection::Upload, "c.bin");
        let id = desc.id.clone();
        let snap = snapshot_for(&desc);
        registry.register(desc).unwrap();
        registry.park(&id, TransferStatus::Paused, snap);

        registry
            .register(descriptor(TransferDirection::Upload, "c.bin"))
            .unwrap();
    }

    #[test]
    fn cancel_outranks_pause() {
        let signal = TransferSignal::default();
        signal.request_pause();
        signal.request_cancel();
        assert_eq!(signal.interruption(), Some(Interrupt::Cancel));
    }

    #[test]
    fn live_transferred_bytes_show_in_listing() {
        let registry = TransferRegistry::new();
        let desc = descriptor(TransferDirection::Upload, "d.bin");
        let registration = registry.register(desc).unwrap();
        registration.transferred.store(55, Ordering::SeqCst);

        let listed = registry.list_active();
        assert_eq!(listed[0].transferred_bytes, 55);
    }
}
