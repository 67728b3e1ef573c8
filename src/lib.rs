pub mod agent_core;
pub mod config;
pub mod inference;
pub mod mcp_client;
pub mod repl;

use std::path::{Path, PathBuf};

/// Return the platform-standard data directory for mcpscope.
///
/// - macOS: `~/Library/Application Support/com.mcpscope.app/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.mcpscope.app\`
/// - Linux: `$XDG_DATA_HOME/com.mcpscope.app/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcpscope/` only if none of the above can be resolved.
pub(crate) fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("com.mcpscope.app");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcpscope")
}

/// Initialize the tracing subscriber.
///
/// Logs go to `{data_dir}/mcpscope.log`, rotated on every start (keeps the
/// last 3), unless `log_stderr` is set. If the log file cannot be opened the
/// subscriber falls back to stderr.
pub fn init_tracing(log_stderr: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcpscope=info,warn"));

    let log_dir = data_dir();
    let log_path = log_dir.join("mcpscope.log");
    let log_file = if log_stderr {
        None
    } else {
        open_log_file(&log_dir, &log_path)
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    match log_file {
        Some(file) => builder
            .with_writer(FlushingWriter::new(file))
            .with_ansi(false)
            .init(),
        None => builder.with_writer(std::io::stderr).init(),
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== mcpscope starting ==="
    );
}

fn open_log_file(log_dir: &Path, log_path: &Path) -> Option<std::fs::File> {
    let _ = std::fs::create_dir_all(log_dir);
    rotate_log_file(log_path, 3);
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
    {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("mcpscope: cannot open {}: {e}; logging to stderr", log_path.display());
            None
        }
    }
}

/// Rotate log files: `mcpscope.log` → `mcpscope.log.1` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A file writer that flushes after every write, so each log line is on
/// disk even if the process is killed mid-session.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_file_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("mcpscope.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("mcpscope.log.1"), "one").unwrap();
        std::fs::write(dir.path().join("mcpscope.log.3"), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |suffix: &str| {
            std::fs::read_to_string(dir.path().join(format!("mcpscope.log.{suffix}"))).unwrap()
        };
        assert_eq!(read("1"), "current");
        assert_eq!(read("2"), "one");
        assert!(!dir.path().join("mcpscope.log.3").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"hello\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }
}
