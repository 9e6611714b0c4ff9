//! Tracing setup.
//!
//! With a log directory, output goes to `gateway-chat.log` there (rotated
//! on every start, three old files kept) through a writer that flushes
//! after each line. Without one, output goes to stderr.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "gateway-chat.log";

const DEFAULT_FILTER: &str = "gateway_chat=info,warn";
const KEEP_ROTATED: u32 = 3;

/// Platform data directory for logs.
///
/// - macOS: `~/Library/Application Support/gateway-chat/`
/// - Linux: `$XDG_DATA_HOME/gateway-chat/` (fallback `~/.local/share/...`)
/// - Windows: `{FOLDERID_RoamingAppData}\gateway-chat\`
///
/// Falls back to `~/.gateway-chat/`, then the working directory.
pub fn default_log_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("gateway-chat");
    }
    dirs::home_dir()
        .map(|home| home.join(".gateway-chat"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// `json` switches to one JSON object per event. Returns the log file path
/// when logging to a file.
pub fn init_tracing(log_dir: Option<&Path>, json: bool) -> io::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let log_path = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(LOG_FILE_NAME);
            rotate_log_file(&path, KEEP_ROTATED);
            Some(path)
        }
        None => None,
    };

    let writer = match &log_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(FlushingWriter::new(file))
        }
        None => BoxMakeWriter::new(io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(log_path.is_none())
        .with_target(true)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    // Startup banner — makes it easy to find the right log file
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "stderr".into()),
        pid = std::process::id(),
        "=== gateway-chat starting ==="
    );
    Ok(log_path)
}

/// Shift `name.log.{n-1}` → `.{n}` and `name.log` → `.1`, dropping the oldest.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let rotated = |i: u32| PathBuf::from(format!("{}.{i}", base_path.display()));

    let _ = std::fs::remove_file(rotated(keep));
    for i in (1..keep).rev() {
        let _ = std::fs::rename(rotated(i), rotated(i + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, rotated(1));
    }
}

/// File writer that flushes after every write so a crash loses nothing.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
