use crate::error::{GlobError, Result, SpoolError};
use common::uniq_id::{entry_file_name, entry_pattern, Marker};
use common::JobRun;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

const SPOOL_DIR_MODE: u32 = 0o777;
const SPOOL_ENTRY_MODE: u32 = 0o666;

/// One JSON file per run instance. Directory globbing is the only index.
pub struct SpoolStore {
    dir: PathBuf,
}

impl SpoolStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, uniq_id: &str) -> PathBuf {
        self.dir.join(entry_file_name(uniq_id))
    }

    pub fn ensure_dir(&self) -> Result<()> {
        match fs::metadata(&self.dir) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => DirBuilder::new()
                .recursive(true)
                .mode(SPOOL_DIR_MODE)
                .create(&self.dir)
                .map_err(|source| SpoolError::CreateDir {
                    path: self.dir.clone(),
                    source,
                }),
            Err(e) => Err(SpoolError::io("while checking spool dir exists", &self.dir, e)),
        }
    }

    /// Truncates and rewrites the whole entry.
    pub fn write(&self, path: &Path, run: &JobRun) -> Result<()> {
        self.ensure_dir()?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(SPOOL_ENTRY_MODE)
            .open(path)
            .map_err(|e| SpoolError::io("can not open file for writing", path, e))?;
        encode(file, path, run)
    }

    /// Writes a new entry. An entry already at `path` is left untouched and
    /// reported as `AlreadyExists`.
    pub fn create(&self, path: &Path, run: &JobRun) -> Result<()> {
        self.ensure_dir()?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(SPOOL_ENTRY_MODE)
            .open(path)
            .map_err(|e| SpoolError::io("can not create spool entry", path, e))?;
        encode(file, path, run)
    }

    pub fn read(&self, path: &Path) -> Result<JobRun> {
        let file = File::open(path).map_err(|e| SpoolError::io("while opening file", path, e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| SpoolError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Entries carrying `marker`, optionally only those of one encoded job ID.
    /// Order is whatever the directory listing yields.
    pub fn find(&self, marker: Marker, encoded_job_id: Option<&str>) -> Result<Vec<PathBuf>> {
        let dir = glob::Pattern::escape(&self.dir.to_string_lossy());
        let pattern = format!("{}/{}", dir, entry_pattern(marker, encoded_job_id));
        let glob_err = |source: GlobError| SpoolError::Glob {
            pattern: pattern.clone(),
            source,
        };

        let paths = glob::glob(&pattern).map_err(|e| glob_err(e.into()))?;
        let mut found = Vec::new();
        for entry in paths {
            found.push(entry.map_err(|e| glob_err(e.into()))?);
        }
        Ok(found)
    }

    /// Moves an entry without replacing an existing one at `to`.
    pub fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::hard_link(from, to)?;
        fs::remove_file(from)
    }

    /// Stops at the first failure. Files that are already gone count as removed.
    pub fn remove_files<P: AsRef<Path>>(&self, paths: &[P]) -> Result<()> {
        for path in paths {
            remove_file(path.as_ref())?;
        }
        Ok(())
    }
}

fn encode(file: File, path: &Path, run: &JobRun) -> Result<()> {
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, run).map_err(|source| SpoolError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    writer
        .write_all(b"\n")
        .and_then(|_| writer.flush())
        .map_err(|e| SpoolError::io("while writing spool entry", path, e))
}

pub(crate) fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SpoolError::io("while removing", path, e)),
    }
}

pub(crate) fn stem(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}
