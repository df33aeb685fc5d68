//! Log sinks that receive captured process output verbatim.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

/// Appends every captured line of one process to a file, in arrival order.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogSink {
    /// Creates (or truncates) the log file, creating parent directories as needed.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Writes one line and flushes it so the file is readable mid-run.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Resolves the log file for a role inside an optional log directory.
///
/// Returns `None` when no log directory is configured.
pub fn resolve_log_path(log_dir: Option<&Path>, run: &str, role: &str) -> Option<PathBuf> {
    log_dir.map(|dir| dir.join(format!("{run}-{role}.log")))
}
