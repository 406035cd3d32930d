//! # Downloads
//!
//! One physical transfer per resource, observed by any number of
//! subscribers, with pause, resume and cancel.

pub mod coordinator;
pub mod http;
pub mod task;
pub mod transform;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{DownloadCoordinator, ResumeRecord, resume_key};
pub use http::{HttpTransport, create_client};
pub use task::{
    DownloadEvent, DownloadRequest, DownloadState, DownloadSubscription, DownloadTask,
    progress_fraction,
};
pub use transform::{PassThrough, ResourceTransform};
pub use transport::{ResumeToken, TransferCheckpoint, TransferResponse, Transport};
