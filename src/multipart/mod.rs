//! Multipart upload lifecycle.
//!
//! [`MultipartEngine`] drives uploads from creation through part uploads to
//! completion or abort, backed by an [`UploadRegistry`] and a storage
//! backend.

pub mod engine;
pub mod registry;

pub use engine::{
    CompletePart, ListMultipartsInfo, ListPartsInfo, MultipartEngine, PartInfo, MAX_PARTS_LIST,
    MAX_PART_NUMBER, MAX_UPLOADS_LIST,
};
pub use registry::{MultipartUpload, PartRecord, UploadRegistry, UploadSummary};
