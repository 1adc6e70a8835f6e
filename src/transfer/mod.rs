//! Resumable transfer pipeline: part sizing, progress reporting, the
//! transfer registry, both engines and the lifecycle manager.

mod download;
mod manager;
mod progress;
mod registry;
mod sizing;
mod types;
mod upload;

pub use manager::{TransferHandle, TransferManager};
pub use progress::{ProgressCallback, PROGRESS_INTERVAL};
pub use sizing::{plan_for_size, PartPlan, SINGLE_PART_THRESHOLD};
pub use types::{
    ResumeSnapshot, TransferDescriptor, TransferDirection, TransferId, TransferProgress,
    TransferStatus,
};
