//! Resumable transfer engine for S3-compatible and FTP remotes.
//!
//! A [`TransferManager`] drives uploads and downloads against one
//! [`RemoteClient`]. Large uploads split into multipart sessions sized by
//! a total-size policy; transfers can be paused into resume snapshots,
//! resumed under a fresh attempt, or cancelled with server-side cleanup.

pub mod error;
pub mod remote;
pub mod transfer;

pub use error::TransferError;
pub use remote::{
    ChunkStream, FtpConfig, FtpRemote, MultipartRemote, ObjectInfo, RemoteClient, RemoteEntry,
    RemoteLocator, S3Config, S3Remote, UploadedPart,
};
pub use transfer::{
    ProgressCallback, ResumeSnapshot, TransferDescriptor, TransferDirection, TransferHandle,
    TransferId, TransferManager, TransferProgress, TransferStatus,
};
