//! # att-attacher
//!
//! Attachment lifecycle for Attache.
//!
//! ## Features
//!
//! - `UploadedFile` value type and its JSON column format
//! - Metadata extraction and uploading into named storages
//! - Validation rules that accumulate error messages
//! - `Attacher`: assign -> validate -> cache -> promote -> persist -> destroy
//! - Atomic promotion guarded by a reload/compare/write protocol
//! - Background promote/destroy jobs and a worker
//!
//! ## Example
//!
//! ```rust,ignore
//! use att_attacher::{AtomicOptions, Attacher, AttacherContext, UploadInput};
//!
//! let mut attacher = Attacher::load(&*records, key, "image", ctx.clone()).await?;
//! attacher.assign(UploadInput::new(bytes).with_filename("photo.jpg")).await?;
//!
//! if attacher.errors().is_empty() {
//!     attacher.persist(&*records).await?;
//!     attacher.atomic_promote(&*records, AtomicOptions::locked()).await?;
//! }
//! ```

pub mod atomic;
pub mod attacher;
pub mod background;
pub mod error;
pub mod file;
pub mod record;
pub mod uploader;
pub mod validation;

pub use attacher::{Attacher, AttacherConfig, AttacherContext, AttacherState};
pub use background::{DestroyJob, Job, JobOutcome, JobQueue, PromoteJob, Worker, WorkerStats};
pub use error::{AttachmentError, AttachmentResult};
pub use file::{Metadata, UploadedFile};
pub use record::{
    AtomicOptions, MemoryRecordStore, PersistStrategy, PersistenceError, PersistenceResult,
    RecordGuard, RecordStore, ReloadStrategy,
};
pub use uploader::{
    BasicMetadata, MetadataExtractor, SignatureExtractor, UploadInput, Uploader,
};
pub use validation::{pretty_filesize, Validator};
