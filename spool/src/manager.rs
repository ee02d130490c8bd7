use crate::error::{Result, SpoolError};
use crate::lock::{LockCoordinator, RetryPolicy};
use crate::store::{self, SpoolStore};
use common::uniq_id::{encode_job_id, uniq_run_id, Marker, UniqRunId};
use common::{JobRun, SpoolConfig};
use std::path::{Path, PathBuf};

pub const ERR_JOB_ALREADY_RUNNING: &str = "A job with same ID is already running";

/// A finished run waiting to be shipped.
#[derive(Debug, Clone, PartialEq)]
pub struct SpoolEntry {
    pub uniq_id: String,
    pub run: JobRun,
}

/// Owner of the spool directory. Every mutation for a job ID happens while
/// holding that job's lock, so several processes can share one directory.
pub struct SpoolManager {
    store: SpoolStore,
    locks: LockCoordinator,
}

impl SpoolManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_retry_policy(dir, RetryPolicy::default())
    }

    pub fn with_retry_policy(dir: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        let dir = dir.into();
        Self {
            locks: LockCoordinator::new(dir.clone(), policy),
            store: SpoolStore::new(dir),
        }
    }

    pub fn from_config(config: &SpoolConfig) -> Self {
        Self::with_retry_policy(
            &config.dir,
            RetryPolicy::new(config.lock_retry_limit, config.lock_retry_interval()),
        )
    }

    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    /// Registers `run` and returns its handle.
    ///
    /// When another run of the same job is still marked running and
    /// `forced_run` is false, the "already running" diagnostic is appended to
    /// `run`, the record is persisted as finished so it gets shipped as is,
    /// and `SpoolError::AlreadyRunning` carries the handle back. With
    /// `forced_run` every prior running entry of the job is deleted first.
    pub fn new_job(&self, run: &mut JobRun, forced_run: bool) -> Result<String> {
        self.store.ensure_dir()?;
        let _lock = self.locks.acquire(&run.id)?;

        let encoded = encode_job_id(&run.id);
        let running = self.store.find(Marker::Running, Some(&encoded))?;
        let duplicate = !forced_run && !running.is_empty();

        if duplicate {
            log::warn!("job {}: {} running entries found", run.id, running.len());
            run.add_error(ERR_JOB_ALREADY_RUNNING);
        }
        if forced_run && !running.is_empty() {
            log::info!("job {}: forced run, removing {} running entries", run.id, running.len());
            self.store.remove_files(&running)?;
        }

        let marker = if duplicate { Marker::Finished } else { Marker::Running };
        let uniq_id = uniq_run_id(marker, run.started_at, &run.id);
        self.store
            .create(&self.store.entry_path(&uniq_id), run)
            .map_err(|e| log_failure(&run.id, e))?;

        if duplicate {
            return Err(SpoolError::AlreadyRunning {
                job_id: run.id.clone(),
                uniq_id,
            });
        }
        Ok(uniq_id)
    }

    /// Flips the entry's marker to finished and rewrites it with the final
    /// state of `run`. Fails if the running entry is gone or a finished entry
    /// already holds the target name. A duplicate record, which is created
    /// finished, is rewritten in place; any other finished handle is rejected.
    pub fn finish_job(&self, uniq_id: &str, run: &JobRun) -> Result<()> {
        let parsed = UniqRunId::parse(uniq_id)
            .ok_or_else(|| SpoolError::InvalidUniqId(uniq_id.to_string()))?;
        if !parsed.belongs_to(&run.id) {
            return Err(SpoolError::JobIdMismatch {
                job_id: run.id.clone(),
                uniq_id: uniq_id.to_string(),
            });
        }

        self.store.ensure_dir()?;
        let _lock = self.locks.acquire(&run.id)?;

        let from = self.store.entry_path(uniq_id);
        if parsed.marker == Marker::Finished {
            if !is_duplicate_record(&self.store.read(&from)?) {
                return Err(SpoolError::AlreadyFinished {
                    job_id: run.id.clone(),
                    uniq_id: uniq_id.to_string(),
                });
            }
            return self.store.write(&from, run).map_err(|e| log_failure(&run.id, e));
        }

        let to = self
            .store
            .entry_path(&parsed.with_marker(Marker::Finished).to_string());
        self.store
            .rename(&from, &to)
            .map_err(|source| {
                log_failure(
                    &run.id,
                    SpoolError::Finish {
                        job_id: run.id.clone(),
                        uniq_id: uniq_id.to_string(),
                        source,
                    },
                )
            })?;

        self.store.write(&to, run).map_err(|e| log_failure(&run.id, e))
    }

    /// All finished entries in directory listing order.
    pub fn finished_jobs(&self) -> Result<Vec<SpoolEntry>> {
        let mut entries = Vec::new();
        for path in self.store.find(Marker::Finished, None)? {
            let Some(uniq_id) = store::stem(&path) else {
                continue;
            };
            let run = self.store.read(&path).map_err(|e| {
                log::error!("could not read spool entry {:?}: {}", path, e);
                e
            })?;
            entries.push(SpoolEntry { uniq_id, run });
        }
        Ok(entries)
    }

    /// Handles of the entries currently marked running for `job_id`.
    pub fn running_jobs(&self, job_id: &str) -> Result<Vec<String>> {
        let paths = self.store.find(Marker::Running, Some(&encode_job_id(job_id)))?;
        Ok(paths.iter().filter_map(|p| store::stem(p)).collect())
    }

    /// Deletes the given entries. Already missing entries are fine; the
    /// first other failure aborts the rest of the batch.
    pub fn remove_jobs<S: AsRef<str>>(&self, uniq_ids: &[S]) -> Result<()> {
        for uniq_id in uniq_ids {
            let uniq_id = uniq_id.as_ref();
            let parsed = UniqRunId::parse(uniq_id)
                .ok_or_else(|| SpoolError::InvalidUniqId(uniq_id.to_string()))?;

            let path = self.store.entry_path(uniq_id);
            if !path.exists() {
                continue;
            }
            let _lock = self.locks.acquire_encoded(uniq_id, &parsed.encoded_job_id)?;
            store::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Whether `run` was recorded while another run of its job was in progress.
pub fn is_duplicate_record(run: &JobRun) -> bool {
    run.errors().iter().any(|e| e == ERR_JOB_ALREADY_RUNNING)
}

fn log_failure(job_id: &str, e: SpoolError) -> SpoolError {
    log::error!("job {}: {}", job_id, e);
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::fs;
    use std::io;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn quick() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(20))
    }

    fn manager(tmp: &TempDir) -> SpoolManager {
        SpoolManager::with_retry_policy(tmp.path().join("spool"), quick())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn entry_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_db_ping_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);

        let mut run = JobRun::new("db-ping", at(1000));
        let uniq_id = spool.new_job(&mut run, false).unwrap();
        assert_eq!(uniq_id, "0_1000_64622d70696e67");
        assert_eq!(entry_names(spool.dir()), ["0_1000_64622d70696e67.json"]);

        run.set_result("ExitCode", 0);
        spool.finish_job(&uniq_id, &run).unwrap();
        assert_eq!(entry_names(spool.dir()), ["1_1000_64622d70696e67.json"]);

        let finished = spool.finished_jobs().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].uniq_id, "1_1000_64622d70696e67");
        assert_eq!(finished[0].run, run);

        spool.remove_jobs(&[finished[0].uniq_id.as_str()]).unwrap();
        assert!(entry_names(spool.dir()).is_empty());
    }

    #[test]
    fn test_duplicate_run_is_persisted_and_signalled() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);

        let mut first = JobRun::new("dup-check", at(1000));
        let first_id = spool.new_job(&mut first, false).unwrap();
        assert!(first.errors().is_empty());

        let mut second = JobRun::new("dup-check", at(1000));
        let err = spool.new_job(&mut second, false).unwrap_err();
        assert!(err.is_already_running());

        let second_id = err.uniq_id().unwrap().to_string();
        assert_ne!(second_id, first_id);
        assert_eq!(second.errors(), [ERR_JOB_ALREADY_RUNNING]);

        assert_eq!(spool.running_jobs("dup-check").unwrap(), [first_id]);
        let finished = spool.finished_jobs().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].uniq_id, second_id);
        assert_eq!(finished[0].run.errors(), [ERR_JOB_ALREADY_RUNNING]);
        assert_eq!(entry_names(spool.dir()).len(), 2);
    }

    #[test]
    fn test_forced_run_replaces_all_running_entries() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);
        fs::create_dir_all(spool.dir()).unwrap();

        let encoded = encode_job_id("nightly");
        for secs in [10, 20, 30] {
            let stale = JobRun::new("nightly", at(secs));
            let path = spool.dir().join(format!("0_{}_{}.json", secs, encoded));
            fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();
        }
        assert_eq!(spool.running_jobs("nightly").unwrap().len(), 3);

        let mut run = JobRun::new("nightly", at(40));
        let uniq_id = spool.new_job(&mut run, true).unwrap();
        assert!(run.errors().is_empty());
        assert_eq!(spool.running_jobs("nightly").unwrap(), [uniq_id]);
    }

    #[test]
    fn test_forced_run_without_prior_entries() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);
        let mut run = JobRun::new("nightly", at(40));
        let uniq_id = spool.new_job(&mut run, true).unwrap();
        assert!(uniq_id.starts_with("0_40_"));
    }

    #[test]
    fn test_other_jobs_do_not_count_as_duplicates() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);
        spool.new_job(&mut JobRun::new("a", at(1)), false).unwrap();
        spool.new_job(&mut JobRun::new("ab", at(1)), false).unwrap();
        assert_eq!(spool.running_jobs("a").unwrap().len(), 1);
        assert_eq!(spool.running_jobs("ab").unwrap().len(), 1);
    }

    #[test]
    fn test_finish_keeps_segments_and_writes_final_state() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);

        let mut run = JobRun::new("check-disk", at(1_700_000_000));
        let uniq_id = spool.new_job(&mut run, false).unwrap();
        run.add_error("exit status 2");
        run.set_result("Severity", json!("alert"));
        spool.finish_job(&uniq_id, &run).unwrap();

        assert!(spool.running_jobs("check-disk").unwrap().is_empty());
        let finished = spool.finished_jobs().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].uniq_id, "1_1700000000_636865636b2d6469736b");
        assert_eq!(finished[0].run.errors(), ["exit status 2"]);
        assert_eq!(finished[0].run.result("Severity"), Some(&json!("alert")));
    }

    #[test]
    fn test_finish_fails_when_running_entry_is_gone() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);

        let mut run = JobRun::new("db-ping", at(1000));
        let uniq_id = spool.new_job(&mut run, false).unwrap();
        spool.finish_job(&uniq_id, &run).unwrap();

        let err = spool.finish_job(&uniq_id, &run).unwrap_err();
        assert!(matches!(err, SpoolError::Finish { .. }));
        assert_eq!(spool.finished_jobs().unwrap().len(), 1);
    }

    #[test]
    fn test_finish_duplicate_record_rewrites_in_place() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);

        spool.new_job(&mut JobRun::new("j", at(1)), false).unwrap();
        let mut dup = JobRun::new("j", at(2));
        let dup_id = spool.new_job(&mut dup, false).unwrap_err().uniq_id().unwrap().to_string();

        dup.set_result("Skipped", true);
        spool.finish_job(&dup_id, &dup).unwrap();
        let finished = spool.finished_jobs().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].run.result("Skipped"), Some(&json!(true)));
    }

    #[test]
    fn test_finish_rejects_already_finished_run() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);

        let mut run = JobRun::new("db-ping", at(1000));
        let uniq_id = spool.new_job(&mut run, false).unwrap();
        run.set_result("ExitCode", 0);
        spool.finish_job(&uniq_id, &run).unwrap();
        let finished_id = spool.finished_jobs().unwrap().remove(0).uniq_id;

        let mut rewritten = run.clone();
        rewritten.set_result("ExitCode", 2);
        assert!(matches!(
            spool.finish_job(&finished_id, &rewritten),
            Err(SpoolError::AlreadyFinished { .. })
        ));
        assert_eq!(spool.finished_jobs().unwrap()[0].run, run);
    }

    #[test]
    fn test_finish_keeps_duplicate_from_same_second() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);

        let mut first = JobRun::new("dup-check", at(1000));
        let first_id = spool.new_job(&mut first, false).unwrap();
        let mut dup = JobRun::new("dup-check", at(1000));
        let dup_id = spool.new_job(&mut dup, false).unwrap_err().uniq_id().unwrap().to_string();
        assert_eq!(dup_id, "1_1000_6475702d636865636b");

        first.set_result("Result", "first-final");
        match spool.finish_job(&first_id, &first) {
            Err(SpoolError::Finish { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let finished = spool.finished_jobs().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].uniq_id, dup_id);
        assert_eq!(finished[0].run.errors(), [ERR_JOB_ALREADY_RUNNING]);
        assert_eq!(spool.running_jobs("dup-check").unwrap(), [first_id]);
    }

    #[test]
    fn test_second_duplicate_in_same_second_keeps_first_record() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);
        spool.new_job(&mut JobRun::new("j", at(5)), false).unwrap();

        let mut dup = JobRun::new("j", at(5));
        dup.set_result("Attempt", 1);
        assert!(spool.new_job(&mut dup, false).unwrap_err().is_already_running());

        let mut again = JobRun::new("j", at(5));
        again.set_result("Attempt", 2);
        match spool.new_job(&mut again, false) {
            Err(SpoolError::Io { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let finished = spool.finished_jobs().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].run.result("Attempt"), Some(&json!(1)));
    }

    #[test]
    fn test_finish_rejects_foreign_or_malformed_ids() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);

        let mut run = JobRun::new("a", at(1));
        let uniq_id = spool.new_job(&mut run, false).unwrap();

        let other = JobRun::new("b", at(1));
        assert!(matches!(
            spool.finish_job(&uniq_id, &other),
            Err(SpoolError::JobIdMismatch { .. })
        ));
        assert!(matches!(
            spool.finish_job("garbage", &run),
            Err(SpoolError::InvalidUniqId(_))
        ));
        assert_eq!(spool.running_jobs("a").unwrap(), [uniq_id]);
    }

    #[test]
    fn test_listing_only_returns_finished_entries() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);

        let mut ids = Vec::new();
        for (job, secs) in [("a", 1), ("b", 2), ("c", 3)] {
            let mut run = JobRun::new(job, at(secs));
            ids.push((spool.new_job(&mut run, false).unwrap(), run));
        }
        let (done_id, done_run) = &ids[1];
        spool.finish_job(done_id, done_run).unwrap();

        let finished = spool.finished_jobs().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].run.id, "b");
        assert!(finished.iter().all(|e| e.uniq_id.starts_with("1_")));
    }

    #[test]
    fn test_listing_fails_on_corrupt_entry() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);
        fs::create_dir_all(spool.dir()).unwrap();
        fs::write(spool.dir().join("1_5_6a.json"), "{\"ID\":").unwrap();

        assert!(matches!(spool.finished_jobs(), Err(SpoolError::Decode { .. })));
    }

    #[test]
    fn test_listing_empty_or_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);
        assert!(spool.finished_jobs().unwrap().is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);

        let mut run = JobRun::new("db-ping", at(1000));
        let uniq_id = spool.new_job(&mut run, false).unwrap();
        spool.finish_job(&uniq_id, &run).unwrap();
        let done = spool.finished_jobs().unwrap().remove(0).uniq_id;

        spool.remove_jobs(&[done.clone()]).unwrap();
        spool.remove_jobs(&[done.clone()]).unwrap();
        assert!(spool.finished_jobs().unwrap().is_empty());
    }

    #[test]
    fn test_remove_rejects_malformed_id() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);
        assert!(matches!(
            spool.remove_jobs(&["../etc/passwd"]),
            Err(SpoolError::InvalidUniqId(_))
        ));
    }

    #[test]
    fn test_remove_rejects_uppercase_hex() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);
        let mut run = JobRun::new("j", at(5));
        let uniq_id = spool.new_job(&mut run, false).unwrap();

        let shouted = uniq_id.to_uppercase();
        assert!(matches!(
            spool.remove_jobs(&[shouted.as_str()]),
            Err(SpoolError::InvalidUniqId(_))
        ));
        assert_eq!(spool.running_jobs("j").unwrap(), [uniq_id]);
    }

    #[test]
    fn test_remove_aborts_batch_on_first_real_error() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);
        fs::create_dir_all(spool.dir()).unwrap();

        let blocker = spool.dir().join("1_1_6a.json");
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), "").unwrap();
        let mut later = JobRun::new("j", at(2));
        let later_id = spool.new_job(&mut later, false).unwrap();

        assert!(spool.remove_jobs(&["1_1_6a", later_id.as_str()]).is_err());
        assert_eq!(spool.running_jobs("j").unwrap(), [later_id]);
    }

    #[test]
    fn test_new_job_fails_while_lock_held_elsewhere() {
        let tmp = TempDir::new().unwrap();
        let spool = manager(&tmp);
        fs::create_dir_all(spool.dir()).unwrap();

        let outsider = LockCoordinator::new(spool.dir(), quick());
        let _held = outsider.acquire("slow-job").unwrap();

        let start = Instant::now();
        let mut run = JobRun::new("slow-job", at(1));
        let err = spool.new_job(&mut run, false).unwrap_err();
        assert!(start.elapsed() >= quick().max_wait());

        match err {
            SpoolError::LockContended { job_id, owner, .. } => {
                assert_eq!(job_id, "slow-job");
                assert_eq!(owner, format!("process with id {}", std::process::id()));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(spool.running_jobs("slow-job").unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_creations_leave_one_running_entry() {
        let tmp = TempDir::new().unwrap();
        let dir = Arc::new(tmp.path().join("spool"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let dir = dir.clone();
                std::thread::spawn(move || {
                    let spool = SpoolManager::with_retry_policy(
                        dir.as_path(),
                        RetryPolicy::new(500, Duration::from_millis(2)),
                    );
                    let mut run = JobRun::new("race", at(100 + i));
                    spool.new_job(&mut run, false)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_already_running()))
            .count();
        assert_eq!(duplicates, 7);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

        let spool = SpoolManager::new(dir.as_path());
        assert_eq!(spool.running_jobs("race").unwrap().len(), 1);
        assert_eq!(spool.finished_jobs().unwrap().len(), 7);
    }
}
