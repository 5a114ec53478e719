//! Result storage writers with clean feature flag handling.
//!
//! A writer is driven in four steps: `init` picks the output file,
//! `set_metadata` records the run description, `write` appends the result
//! rows and `shutdown` flushes. [`persist_result`] runs the whole sequence
//! with the writer selected by the `[storage]` configuration.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{StorageConfig, StorageFormat};
use crate::metadata::Metadata;
use crate::sweep::{Columns, MeasurementResult, MeasurementRow};

/// Persists one measurement result.
#[async_trait]
pub trait StorageWriter: Send {
    /// Prepares `path` for writing.
    async fn init(&mut self, path: &Path) -> Result<()>;

    /// Records the run description. Called once, before `write`.
    async fn set_metadata(&mut self, metadata: &Metadata) -> Result<()>;

    /// Appends result rows.
    async fn write(&mut self, columns: &Columns, rows: &[MeasurementRow]) -> Result<()>;

    /// Flushes and closes the output.
    async fn shutdown(&mut self) -> Result<()>;
}

fn prepare_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create storage directory at {:?}", dir))?;
        }
    }
    Ok(())
}

/// Column headers with units, e.g. `current_A`.
pub fn column_headers(columns: &Columns) -> [String; 5] {
    [
        "index".to_string(),
        format!("{}_{}", columns.setpoint, columns.setpoint_unit),
        format!("{}_{}", columns.measured, columns.measured_unit),
        format!("{}_{}", columns.derived, columns.derived_unit),
        "timestamp".to_string(),
    ]
}

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    /// CSV file with the metadata as `# `-prefixed JSON lines on top.
    pub struct CsvWriter {
        path: PathBuf,
        file: Option<File>,
        writer: Option<csv::Writer<File>>,
    }

    impl Default for CsvWriter {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CsvWriter {
        /// Unopened writer.
        pub fn new() -> Self {
            Self {
                path: PathBuf::new(),
                file: None,
                writer: None,
            }
        }
    }

    #[async_trait]
    impl StorageWriter for CsvWriter {
        async fn init(&mut self, path: &Path) -> Result<()> {
            prepare_parent(path)?;
            self.path = path.to_path_buf();
            let file = File::create(&self.path)
                .with_context(|| format!("Failed to create CSV file at {:?}", self.path))?;
            self.file = Some(file);
            info!(path = %self.path.display(), "CSV writer initialized");
            Ok(())
        }

        async fn set_metadata(&mut self, metadata: &Metadata) -> Result<()> {
            let file = self
                .file
                .as_mut()
                .context("CSV writer used before init")?;

            let json_string = serde_json::to_string_pretty(metadata)
                .context("Failed to serialize metadata to JSON")?;

            for line in json_string.lines() {
                file.write_all(b"# ")
                    .and_then(|_| file.write_all(line.as_bytes()))
                    .and_then(|_| file.write_all(b"\n"))
                    .context("Failed to write metadata to CSV file")?;
            }
            Ok(())
        }

        async fn write(&mut self, columns: &Columns, rows: &[MeasurementRow]) -> Result<()> {
            if self.writer.is_none() {
                let file = self.file.take().context("CSV writer used before init")?;
                let mut writer = csv::Writer::from_writer(file);
                writer
                    .write_record(column_headers(columns))
                    .context("Failed to write CSV header")?;
                self.writer = Some(writer);
            }
            let writer = self.writer.as_mut().context("CSV writer used before init")?;
            for row in rows {
                writer
                    .write_record(&[
                        row.index.to_string(),
                        row.setpoint.to_string(),
                        row.measured.to_string(),
                        row.derived.map_or(String::new(), |v| v.to_string()),
                        row.timestamp.to_rfc3339(),
                    ])
                    .context("Failed to write row to CSV file")?;
            }
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            if let Some(mut writer) = self.writer.take() {
                writer.flush().context("Failed to flush CSV writer")?;
            }
            if let Some(mut file) = self.file.take() {
                file.flush().context("Failed to flush CSV file")?;
            }
            info!(path = %self.path.display(), "CSV writer shut down");
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::DaqError;

    /// Placeholder when the `storage_csv` feature is off.
    pub struct CsvWriter;

    impl CsvWriter {
        /// Placeholder writer.
        pub fn new() -> Self {
            Self
        }
    }

    impl Default for CsvWriter {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl StorageWriter for CsvWriter {
        async fn init(&mut self, _path: &Path) -> Result<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn set_metadata(&mut self, _metadata: &Metadata) -> Result<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn write(&mut self, _columns: &Columns, _rows: &[MeasurementRow]) -> Result<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn shutdown(&mut self) -> Result<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvWriter;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvWriter;

// ============================================================================
// JSON Writer
// ============================================================================

/// Single JSON document `{ "metadata", "columns", "rows" }`, written on shutdown.
#[derive(Default)]
pub struct JsonWriter {
    path: PathBuf,
    metadata: Option<serde_json::Value>,
    columns: Option<serde_json::Value>,
    rows: Vec<serde_json::Value>,
}

impl JsonWriter {
    /// Unopened writer.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageWriter for JsonWriter {
    async fn init(&mut self, path: &Path) -> Result<()> {
        prepare_parent(path)?;
        self.path = path.to_path_buf();
        info!(path = %self.path.display(), "JSON writer initialized");
        Ok(())
    }

    async fn set_metadata(&mut self, metadata: &Metadata) -> Result<()> {
        self.metadata =
            Some(serde_json::to_value(metadata).context("Failed to serialize metadata to JSON")?);
        Ok(())
    }

    async fn write(&mut self, columns: &Columns, rows: &[MeasurementRow]) -> Result<()> {
        if self.columns.is_none() {
            self.columns =
                Some(serde_json::to_value(columns).context("Failed to serialize columns")?);
        }
        for row in rows {
            self.rows
                .push(serde_json::to_value(row).context("Failed to serialize row")?);
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        let document = serde_json::json!({
            "metadata": self.metadata.take(),
            "columns": self.columns.take(),
            "rows": std::mem::take(&mut self.rows),
        });
        let text =
            serde_json::to_string_pretty(&document).context("Failed to serialize JSON document")?;
        tokio::fs::write(&self.path, text)
            .await
            .with_context(|| format!("Failed to write JSON file at {:?}", self.path))?;
        info!(path = %self.path.display(), "JSON writer shut down");
        Ok(())
    }
}

/// Writer for a configured format.
pub fn writer_for(format: StorageFormat) -> Box<dyn StorageWriter> {
    match format {
        StorageFormat::Csv => Box::new(CsvWriter::new()),
        StorageFormat::Json => Box::new(JsonWriter::new()),
    }
}

/// Output path for `result`: `<output_dir>/<kind>_<start time>_<run id prefix>.<ext>`.
pub fn result_path(config: &StorageConfig, result: &MeasurementResult) -> PathBuf {
    let run_id = result.run_id().simple().to_string();
    let file_name = format!(
        "{}_{}_{}.{}",
        result.kind(),
        result.started_at().format("%Y%m%d_%H%M%S"),
        &run_id[..8],
        config.format.extension()
    );
    config.output_dir.join(file_name)
}

/// Writes `result` with its metadata and returns the file path.
pub async fn persist_result(
    config: &StorageConfig,
    metadata: &Metadata,
    result: &MeasurementResult,
) -> Result<PathBuf> {
    let path = result_path(config, result);
    let mut writer = writer_for(config.format);
    writer.init(&path).await?;
    writer.set_metadata(metadata).await?;
    writer.write(result.columns(), result.rows()).await?;
    writer.shutdown().await?;
    Ok(path)
}
