//! Builds the [`CommandRegistry`] factories for the two bundled job
//! kinds out of a [`JobSpec`]'s opaque metadata map (spec §9 "new job
//! kinds add a tag and a factory entry").

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::DataHubError;
use crate::job::{CommandRegistry, JobKind, JobSpec};
use crate::store::{DataSource, Store};

use super::download::{DownloadJob, DownloadSpec};
use super::export::{ExportFormat, ExportJob, ExportSpec};

/// Named data sources a `DownloadJob` spec can select by the `source`
/// metadata key. A `HashMap` is enough since sources are registered
/// once at startup (same reasoning as `CommandRegistry` itself).
pub type SourceRegistry = HashMap<String, Arc<dyn DataSource>>;

fn metadata_str(spec: &JobSpec, key: &str) -> Result<String, DataHubError> {
    spec.metadata
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| DataHubError::ValidationError(format!("metadata.{key} must be a string")))
}

fn metadata_usize(spec: &JobSpec, key: &str, default: usize) -> usize {
    spec.metadata
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(default)
}

/// Registers factories for [`JobKind::Download`] and [`JobKind::Export`]
/// against the shared `store` and named `sources`. A caller building a
/// `JobManager` for a custom job kind starts from a fresh
/// `CommandRegistry` and calls `register` directly instead.
pub fn register_defaults(
    registry: &mut CommandRegistry,
    store: Arc<dyn Store>,
    sources: SourceRegistry,
) {
    let download_store = Arc::clone(&store);
    let sources = Arc::new(sources);
    registry.register(JobKind::Download, move |spec: &JobSpec| {
        let source_name = metadata_str(spec, "source")?;
        let source = sources.get(&source_name).cloned().ok_or_else(|| {
            DataHubError::ValidationError(format!("unknown data source {source_name}"))
        })?;
        let batch_size = metadata_usize(spec, "batch_size", 100);
        let download_spec = DownloadSpec {
            job_id: spec.id.clone(),
            batch_size,
        };
        Ok(Arc::new(DownloadJob::new(download_spec, source, Arc::clone(&download_store)))
            as Arc<dyn crate::job::JobBody>)
    });

    let export_store = store;
    registry.register(JobKind::Export, move |spec: &JobSpec| {
        let query = metadata_str(spec, "query")?;
        let destination = PathBuf::from(metadata_str(spec, "destination")?);
        let format = match spec.metadata.get("format").and_then(|v| v.as_str()) {
            Some("tsv") => ExportFormat::Tsv,
            Some("json") => ExportFormat::Json,
            _ => ExportFormat::Csv,
        };
        let chunk_size = metadata_usize(spec, "chunk_size", 1000);
        let export_spec = ExportSpec {
            job_id: spec.id.clone(),
            query,
            destination,
            format,
            chunk_size,
        };
        Ok(Arc::new(ExportJob::new(export_spec, Arc::clone(&export_store)))
            as Arc<dyn crate::job::JobBody>)
    });
}
