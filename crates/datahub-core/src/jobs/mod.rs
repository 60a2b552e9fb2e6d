//! Concrete job kinds (spec §4.7). Each is a thin `JobBody` wrapping a
//! `DataSource`/`Store`/`JobStore` collaborator; the manager and pool
//! never know these types exist, only the trait object they produce.

mod download;
mod export;
mod registry;

pub use download::{DownloadJob, DownloadSpec};
pub use export::{ExportFormat, ExportJob, ExportSpec};
pub use registry::{register_defaults, SourceRegistry};
