//! Streams query results from the connection-pooled [`Store`] to a CSV,
//! TSV, or JSON file (spec §4.7 `ExportJob`).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::info;

use crate::error::{CancelReason, DataHubError, Result};
use crate::job::{JobBody, JobContext, JobValidationError, Metadata};
use crate::progress::ReportThrottle;
use crate::store::Store;

/// Output encoding for an export (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Tsv,
    Json,
}

impl ExportFormat {
    fn separator(self) -> Option<char> {
        match self {
            ExportFormat::Csv => Some(','),
            ExportFormat::Tsv => Some('\t'),
            ExportFormat::Json => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportSpec {
    pub job_id: String,
    pub query: String,
    pub destination: PathBuf,
    pub format: ExportFormat,
    pub chunk_size: usize,
}

/// Streams a query's results to `destination` one chunk at a time,
/// reporting progress every 1,000 rows and checking for pause/cancel
/// at every row (spec §4.7: "pause takes effect within 100ms").
///
/// On cancellation the partial output file is deleted: unlike
/// `DownloadJob`'s external cursor, an export's resume point is a raw
/// byte offset into a file whose last line may not be a complete
/// record, so retrying an export always starts clean rather than
/// attempting to resume a truncated file.
pub struct ExportJob {
    spec: ExportSpec,
    store: Arc<dyn Store>,
}

impl ExportJob {
    pub fn new(spec: ExportSpec, store: Arc<dyn Store>) -> Self {
        Self { spec, store }
    }

    fn encode_delimited(row: &serde_json::Map<String, Value>, sep: char) -> String {
        row.values()
            .map(|v| {
                let raw = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if raw.contains(sep) || raw.contains('"') || raw.contains('\n') {
                    format!("\"{}\"", raw.replace('"', "\"\""))
                } else {
                    raw
                }
            })
            .collect::<Vec<_>>()
            .join(&sep.to_string())
    }
}

#[async_trait]
impl JobBody for ExportJob {
    fn validate(&self) -> std::result::Result<(), JobValidationError> {
        if self.spec.query.trim().is_empty() {
            return Err(JobValidationError("export query must not be empty".into()));
        }
        if self.spec.chunk_size == 0 {
            return Err(JobValidationError("chunk_size must be > 0".into()));
        }
        Ok(())
    }

    async fn execute(&self, ctx: JobContext) -> Result<()> {
        let file = tokio::fs::File::create(&self.spec.destination)
            .await
            .map_err(|e| DataHubError::persistence(format!("creating export file: {e}")))?;
        let mut writer = BufWriter::new(file);
        let mut wrote_header = false;
        let mut rows_written: u64 = 0;
        let mut offset: usize = 0;
        let mut throttle = ReportThrottle::new(std::time::Duration::from_millis(100));

        let result: Result<()> = async {
            if self.spec.format == ExportFormat::Json {
                writer
                    .write_all(b"[")
                    .await
                    .map_err(|e| DataHubError::persistence(e.to_string()))?;
            }

            loop {
                ctx.checkpoint().await;
                if ctx.is_cancelled() {
                    return Err(DataHubError::Cancelled {
                        reason: CancelReason::Requested,
                    });
                }

                let paged = format!(
                    "{} LIMIT ?1 OFFSET ?2",
                    self.spec.query.trim_end_matches(';')
                );
                let chunk = self
                    .store
                    .query(
                        &paged,
                        &[
                            serde_json::json!(self.spec.chunk_size),
                            serde_json::json!(offset),
                        ],
                    )
                    .await?;
                if chunk.rows.is_empty() {
                    break;
                }

                for row in &chunk.rows {
                    ctx.checkpoint().await;
                    if ctx.is_cancelled() {
                        return Err(DataHubError::Cancelled {
                            reason: CancelReason::Requested,
                        });
                    }

                    match self.spec.format.separator() {
                        Some(sep) => {
                            if !wrote_header {
                                let header = row.keys().cloned().collect::<Vec<_>>().join(&sep.to_string());
                                writer
                                    .write_all(format!("{header}\n").as_bytes())
                                    .await
                                    .map_err(|e| DataHubError::persistence(e.to_string()))?;
                                wrote_header = true;
                            }
                            let line = Self::encode_delimited(row, sep);
                            writer
                                .write_all(format!("{line}\n").as_bytes())
                                .await
                                .map_err(|e| DataHubError::persistence(e.to_string()))?;
                        }
                        None => {
                            if rows_written > 0 {
                                writer
                                    .write_all(b",")
                                    .await
                                    .map_err(|e| DataHubError::persistence(e.to_string()))?;
                            }
                            let encoded = serde_json::to_vec(row)
                                .map_err(|e| DataHubError::persistence(e.to_string()))?;
                            writer
                                .write_all(&encoded)
                                .await
                                .map_err(|e| DataHubError::persistence(e.to_string()))?;
                        }
                    }

                    rows_written += 1;
                    if rows_written % 1000 == 0 || throttle.ready() {
                        ctx.progress
                            .report(rows_written, format!("exported {rows_written} rows"));
                    }
                }

                offset += chunk.rows.len();
                if chunk.rows.len() < self.spec.chunk_size {
                    break;
                }
            }

            if self.spec.format == ExportFormat::Json {
                writer
                    .write_all(b"]")
                    .await
                    .map_err(|e| DataHubError::persistence(e.to_string()))?;
            }
            writer
                .flush()
                .await
                .map_err(|e| DataHubError::persistence(e.to_string()))?;
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            if matches!(e, DataHubError::Cancelled { .. }) {
                drop(writer);
                let _ = tokio::fs::remove_file(&self.spec.destination).await;
            }
        } else {
            ctx.progress.report(rows_written, "export complete");
            info!(job_id = %self.spec.job_id, rows_written, "export finished");
        }

        result
    }

    fn can_pause(&self) -> bool {
        true
    }

    fn describe(&self) -> Metadata {
        let mut m = Metadata::new();
        m.insert("destination".into(), serde_json::json!(self.spec.destination.display().to_string()));
        m.insert("format".into(), serde_json::json!(format!("{:?}", self.spec.format)));
        m
    }
}
