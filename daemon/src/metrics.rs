use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Uploader counters, exported in Prometheus text format
#[derive(Clone)]
pub struct UploadMetrics {
    delivered: Arc<DashMap<String, AtomicU64>>,
    duplicates: Arc<DashMap<String, AtomicU64>>,
    flush_cycles: Arc<AtomicU64>,
    failed_cycles: Arc<AtomicU64>,
    pending: Arc<AtomicU64>,
}

impl UploadMetrics {
    pub fn new() -> Self {
        Self {
            delivered: Arc::new(DashMap::new()),
            duplicates: Arc::new(DashMap::new()),
            flush_cycles: Arc::new(AtomicU64::new(0)),
            failed_cycles: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_delivery(&self, job_id: &str, duplicate: bool) {
        bump(&self.delivered, job_id);
        if duplicate {
            bump(&self.duplicates, job_id);
        }
    }

    pub fn record_cycle(&self, ok: bool) {
        self.flush_cycles.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed_cycles.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_pending(&self, count: u64) {
        self.pending.store(count, Ordering::Relaxed);
    }

    pub fn delivered(&self, job_id: &str) -> u64 {
        self.delivered
            .get(job_id)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn export(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP jobmon_flush_cycles_total Total number of spool flush cycles\n");
        output.push_str("# TYPE jobmon_flush_cycles_total counter\n");
        output.push_str(&format!(
            "jobmon_flush_cycles_total {}\n\n",
            self.flush_cycles.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP jobmon_flush_failures_total Flush cycles that left entries behind\n");
        output.push_str("# TYPE jobmon_flush_failures_total counter\n");
        output.push_str(&format!(
            "jobmon_flush_failures_total {}\n\n",
            self.failed_cycles.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP jobmon_spool_pending Finished runs seen at the start of the last cycle\n");
        output.push_str("# TYPE jobmon_spool_pending gauge\n");
        output.push_str(&format!(
            "jobmon_spool_pending {}\n\n",
            self.pending.load(Ordering::Relaxed)
        ));

        write_per_job(
            &mut output,
            "jobmon_runs_delivered_total",
            "Job runs delivered to the results sink",
            &self.delivered,
        );
        write_per_job(
            &mut output,
            "jobmon_duplicate_runs_total",
            "Delivered runs that were rejected as already running",
            &self.duplicates,
        );

        output
    }
}

impl Default for UploadMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(map: &DashMap<String, AtomicU64>, job_id: &str) {
    map.entry(job_id.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn write_per_job(output: &mut String, name: &str, help: &str, map: &DashMap<String, AtomicU64>) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} counter\n", name));
    let mut rows: Vec<(String, u64)> = map
        .iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect();
    rows.sort();
    for (job_id, count) in rows {
        output.push_str(&format!(
            "{}{{job_id=\"{}\"}} {}\n",
            name,
            escape_label(&job_id),
            count
        ));
    }
    output.push('\n');
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
