//! Japanese reading-annotation pipeline: select text fragments from a
//! document tree, batch them behind sentinel markers, resolve them against
//! a content-addressed cache, dispatch the misses to a remote annotation
//! service under a sliding-window rate budget, and patch the sanitized
//! ruby markup back into the tree. Reconciliation sessions keep the result
//! current as the document changes.

pub mod config;
pub mod dom;
pub mod error;
pub mod markers;
pub mod pipeline;
pub mod textutil;

pub use dom::{MemTree, TreeAdapter};
pub use error::PipelineError;
pub use pipeline::remote::{AnnotateOptions, AnnotateService, HttpAnnotateService, ReadingScript};
pub use pipeline::session::{ChangeEvent, WatchSource};
pub use pipeline::{Annotator, PassStats, PipelineSettings};
