pub mod agent_core;
pub mod config;
pub mod inference;
pub mod mcp_client;

use std::path::{Path, PathBuf};

use config::AppConfig;
use mcp_client::{McpClient, ProcessPool};

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "toolweave.log";

/// Rotated log files kept besides the current one.
const LOG_FILES_KEPT: u32 = 3;

/// Return the platform-standard data directory for toolweave.
///
/// - macOS: `~/Library/Application Support/toolweave/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolweave\`
/// - Linux: `$XDG_DATA_HOME/toolweave/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolweave/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolweave");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolweave")
}

/// Install the global tracing subscriber, writing to `<log_dir>/toolweave.log`.
///
/// On each call:
/// 1. Rotates existing logs (toolweave.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh log with a line-flushing writer so a crash loses nothing.
/// 3. Logs a startup banner with the log path.
///
/// `RUST_LOG` overrides the default filter `toolweave=info,warn`.
pub fn init_tracing(log_dir: &Path) -> anyhow::Result<()> {
    use anyhow::Context;
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;

    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, LOG_FILES_KEPT);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolweave=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing subscriber already installed: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== toolweave starting ==="
    );
    Ok(())
}

/// Build an [`McpClient`] from config and connect every server.
///
/// Partial startup is fine: servers that fail are logged and left in
/// `error` status, and their tools are simply absent.
pub async fn start_client(config: &AppConfig) -> McpClient {
    let client = McpClient::new(config.servers.clone(), ProcessPool::new())
        .with_request_timeout(config.agent.request_timeout())
        .with_retry_policy(config.agent.refresh);

    for (name, err) in client.connect_all().await {
        tracing::warn!(server = %name, error = %err, "MCP server failed to start (non-fatal)");
    }

    tracing::info!(
        configured = client.configured_servers().len(),
        connected = client.connected_servers().len(),
        total_tools = client.registry().tool_count(),
        "MCP client initialized"
    );
    client
}

/// Rotate log files: `toolweave.log` → `.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    // Delete the oldest
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    // Current → .1
    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
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
