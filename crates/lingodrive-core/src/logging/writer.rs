//! Per-instance JSONL files
//!
//! Every node instance appends to its own file, `raw/<date>_<instance>.jsonl`
//! under the logs directory, so several nodes on one machine never share a
//! file handle.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::LogRecord;

/// Appends [`LogRecord`]s to one instance's file.
pub struct InstanceLogWriter {
    instance: String,
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl std::fmt::Debug for InstanceLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLogWriter")
            .field("instance", &self.instance)
            .field("path", &self.path)
            .finish()
    }
}

impl InstanceLogWriter {
    /// Open (or create) today's file for `instance`.
    pub fn open(logs_dir: impl AsRef<Path>, instance: impl Into<String>) -> std::io::Result<Self> {
        let instance = instance.into();
        let raw = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw.join(format!("{}_{}.jsonl", date, instance));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            instance,
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush, so a crash loses at most the current line.
    pub fn append(&self, record: &LogRecord) -> std::io::Result<()> {
        let line = record
            .to_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = self.file.lock();
        writeln!(file, "{}", line)?;
        file.flush()
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.file.lock().flush()
    }
}

impl Drop for InstanceLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read every record under `logs_dir/raw`, oldest first.
///
/// Lines that fail to parse are skipped.
pub fn read_records(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<LogRecord>> {
    let raw = logs_dir.as_ref().join("raw");
    if !raw.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for dir_entry in fs::read_dir(&raw)? {
        let path = dir_entry?.path();
        if path.extension().map_or(true, |ext| ext != "jsonl") {
            continue;
        }
        let content = fs::read_to_string(&path)?;
        records.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .filter_map(|line| LogRecord::from_line(line).ok()),
        );
    }

    records.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_raw_dir() {
        let temp = tempfile::tempdir().unwrap();
        let logs = temp.path().join("logs");

        let writer = InstanceLogWriter::open(&logs, "reader").unwrap();
        assert!(logs.join("raw").is_dir());
        assert!(writer.path().exists());
        assert!(writer.path().to_string_lossy().ends_with("_reader.jsonl"));
    }

    #[test]
    fn test_two_instances_merge_on_read() {
        let temp = tempfile::tempdir().unwrap();
        let logs = temp.path().join("logs");

        let host = InstanceLogWriter::open(&logs, "host").unwrap();
        let reader = InstanceLogWriter::open(&logs, "reader").unwrap();
        host.append(&LogRecord::now("info", "host", "t", "Committed manifest"))
            .unwrap();
        reader
            .append(&LogRecord::now("info", "reader", "t", "Session ready"))
            .unwrap();
        drop(host);
        drop(reader);

        std::fs::write(logs.join("raw/garbage.jsonl"), "not json\n").unwrap();

        let records = read_records(&logs).unwrap();
        assert_eq!(records.len(), 2);
        let instances: Vec<_> = records.iter().map(|r| r.instance.as_str()).collect();
        assert!(instances.contains(&"host"));
        assert!(instances.contains(&"reader"));
    }

    #[test]
    fn test_read_missing_dir_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        assert!(read_records(temp.path().join("nope")).unwrap().is_empty());
    }
}
