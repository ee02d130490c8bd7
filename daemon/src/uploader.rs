use crate::metrics::UploadMetrics;
use anyhow::{Context, Result};
use jobmon_spool::{is_duplicate_record, SpoolEntry, SpoolManager};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

/// Where finished runs are delivered: one JSON document per line.
pub struct ResultSink {
    writer: Box<dyn Write + Send>,
    name: String,
}

impl ResultSink {
    /// Appends to `path`, or writes to stdout when no path is configured.
    pub fn open(path: Option<&Path>) -> io::Result<Self> {
        match path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Self::from_writer(file, path.display().to_string()))
            }
            None => Ok(Self::from_writer(io::stdout(), "stdout")),
        }
    }

    pub fn from_writer(writer: impl Write + Send + 'static, name: impl Into<String>) -> Self {
        Self {
            writer: Box::new(writer),
            name: name.into(),
        }
    }

    fn deliver(&mut self, entry: &SpoolEntry) -> Result<()> {
        let mut line = serde_json::to_vec(&entry.run)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub pending: usize,
    pub delivered: usize,
}

/// Drains finished runs into a sink. Only runs written successfully are
/// removed from the spool, so anything else is retried next cycle.
pub struct Uploader {
    spool: Arc<SpoolManager>,
    sink: ResultSink,
    metrics: UploadMetrics,
}

impl Uploader {
    pub fn new(spool: Arc<SpoolManager>, sink: ResultSink, metrics: UploadMetrics) -> Self {
        Self { spool, sink, metrics }
    }

    pub fn flush(&mut self) -> Result<FlushReport> {
        let result = self.flush_inner();
        self.metrics.record_cycle(result.is_ok());
        result
    }

    fn flush_inner(&mut self) -> Result<FlushReport> {
        let entries = self
            .spool
            .finished_jobs()
            .context("Failed to list finished jobs")?;
        self.metrics.set_pending(entries.len() as u64);
        if entries.is_empty() {
            return Ok(FlushReport::default());
        }

        let mut delivered = Vec::with_capacity(entries.len());
        let mut delivery_err = None;
        for entry in &entries {
            match self.sink.deliver(entry) {
                Ok(()) => {
                    self.metrics
                        .record_delivery(&entry.run.id, is_duplicate_record(&entry.run));
                    delivered.push(entry.uniq_id.as_str());
                }
                Err(e) => {
                    log::error!(
                        "Failed to deliver {} to {}: {:#}",
                        entry.uniq_id,
                        self.sink.name,
                        e
                    );
                    delivery_err = Some(e);
                    break;
                }
            }
        }

        self.spool
            .remove_jobs(&delivered)
            .context("Failed to remove delivered jobs from spool")?;
        log::info!(
            "Delivered {} of {} finished jobs to {}",
            delivered.len(),
            entries.len(),
            self.sink.name
        );

        if let Some(e) = delivery_err {
            return Err(e.context(format!(
                "{} finished jobs left in spool",
                entries.len() - delivered.len()
            )));
        }

        Ok(FlushReport {
            pending: entries.len(),
            delivered: delivered.len(),
        })
    }
}
