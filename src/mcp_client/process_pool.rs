//! Shared, reference-counted pool of MCP server processes.
//!
//! Servers launched with an identical command line and environment share a
//! single OS process. Every connection holds a [`ProcessHandle`]; the process
//! is terminated exactly once, when the last handle is released. A process
//! that exits on its own is removed from the pool so the next `acquire`
//! spawns a fresh one.
//!
//! Entries are tagged with a generation number. A handle only ever resolves
//! to the generation it was issued for, so a stale handle can never touch a
//! respawned process that happens to reuse the same key.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use super::errors::McpError;
use super::transport::{dispatch_line, PendingRequests};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Number of trailing stderr lines kept for crash diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Maximum chars of stderr included in an error message.
const MAX_STDERR_CHARS: usize = 2000;

// ─── Process Key ─────────────────────────────────────────────────────────────

/// Identity of a server process: command, arguments, and sorted environment.
///
/// Two configurations produce the same key iff they would launch the same
/// process, regardless of the order their environment was declared in.
pub fn process_key(command: &str, args: &[String], env: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    format!("{command}::{}::{}", args.join("|"), pairs.join("|"))
}

// ─── Managed Process ─────────────────────────────────────────────────────────

/// A running server process shared by one or more connections.
pub struct ManagedProcess {
    key: String,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: PendingRequests,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    terminate_tx: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
}

impl ManagedProcess {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Requests awaiting a response from this process.
    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Last lines the process wrote to stderr.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        let joined = tail.iter().cloned().collect::<Vec<_>>().join("\n");
        truncate_chars(&joined, MAX_STDERR_CHARS)
    }

    /// Write one newline-terminated line to stdin.
    ///
    /// Writers are serialized so concurrent requests never interleave bytes.
    pub async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    fn terminate(&self) {
        let tx = self
            .terminate_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    async fn wait_for_exit(&self) {
        let mut rx = self.exited.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ─── Pool ────────────────────────────────────────────────────────────────────

struct PoolEntry {
    generation: u64,
    process: Arc<ManagedProcess>,
    ref_count: usize,
    holders: Vec<String>,
}

#[derive(Default)]
struct PoolInner {
    processes: HashMap<String, PoolEntry>,
    next_generation: u64,
}

#[derive(Default)]
struct PoolCounters {
    spawned: AtomicU64,
    exited: AtomicU64,
}

/// Lifetime counters for the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Processes currently in the pool.
    pub live: usize,
    /// Processes spawned since the pool was created.
    pub spawned: u64,
    /// Processes that have exited (terminated or crashed).
    pub exited: u64,
}

/// Registry of shared server processes.
///
/// Cloning yields another reference to the same pool.
#[derive(Clone, Default)]
pub struct ProcessPool {
    inner: Arc<Mutex<PoolInner>>,
    counters: Arc<PoolCounters>,
}

fn lock(inner: &Mutex<PoolInner>) -> MutexGuard<'_, PoolInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl ProcessPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a handle to the process for this command line, spawning it if no
    /// live process with the same key exists.
    ///
    /// A process that fails to spawn is never registered.
    pub async fn acquire(
        &self,
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ProcessHandle, McpError> {
        let key = process_key(command, args, env);

        // Spawning happens under the lock so two concurrent acquires of the
        // same key cannot both launch a process. `Command::spawn` does not block.
        let mut inner = lock(&self.inner);

        if let Some(entry) = inner.processes.get_mut(&key) {
            if !entry.process.has_exited() {
                entry.ref_count += 1;
                entry.holders.push(server_name.to_string());
                tracing::info!(
                    server = %server_name,
                    key = %key,
                    ref_count = entry.ref_count,
                    "reusing shared server process"
                );
                return Ok(ProcessHandle::new(self, &key, entry.generation, server_name));
            }
            // Exited but the watcher has not cleared it yet.
            inner.processes.remove(&key);
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;

        let process = spawn_process(
            server_name,
            command,
            args,
            env,
            &key,
            generation,
            Arc::downgrade(&self.inner),
            Arc::clone(&self.counters),
        )?;

        tracing::info!(
            server = %server_name,
            key = %key,
            pid = ?process.pid(),
            "spawned server process"
        );

        inner.processes.insert(
            key.clone(),
            PoolEntry {
                generation,
                process,
                ref_count: 1,
                holders: vec![server_name.to_string()],
            },
        );
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);

        Ok(ProcessHandle::new(self, &key, generation, server_name))
    }

    /// Release a handle. Equivalent to [`ProcessHandle::release`].
    pub async fn release(&self, handle: &ProcessHandle) {
        handle.release().await;
    }

    /// Current reference count for a key (0 if absent).
    pub fn ref_count(&self, key: &str) -> usize {
        lock(&self.inner)
            .processes
            .get(key)
            .map_or(0, |e| e.ref_count)
    }

    /// Server names currently holding the process for `key`.
    pub fn holders(&self, key: &str) -> Vec<String> {
        lock(&self.inner)
            .processes
            .get(key)
            .map(|e| e.holders.clone())
            .unwrap_or_default()
    }

    pub fn is_alive(&self, key: &str) -> bool {
        lock(&self.inner)
            .processes
            .get(key)
            .is_some_and(|e| !e.process.has_exited())
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.len(),
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            exited: self.counters.exited.load(Ordering::Relaxed),
        }
    }
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// One reference to a pooled process.
///
/// Dropping an unreleased handle releases it.
pub struct ProcessHandle {
    pool: Arc<Mutex<PoolInner>>,
    key: String,
    generation: u64,
    server_name: String,
    released: AtomicBool,
}

impl ProcessHandle {
    fn new(pool: &ProcessPool, key: &str, generation: u64, server_name: &str) -> Self {
        Self {
            pool: Arc::clone(&pool.inner),
            key: key.to_string(),
            generation,
            server_name: server_name.to_string(),
            released: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// The live process this handle refers to, if it is still running.
    pub fn process(&self) -> Option<Arc<ManagedProcess>> {
        if self.is_released() {
            return None;
        }
        lock(&self.pool)
            .processes
            .get(&self.key)
            .filter(|e| e.generation == self.generation)
            .map(|e| Arc::clone(&e.process))
    }

    /// Drop this reference and wait for the process to exit if it was the last.
    pub async fn release(&self) {
        if let Some(process) = self.release_ref() {
            process.wait_for_exit().await;
        }
    }

    /// Decrement the reference count. Returns the process if it is being
    /// terminated by this call.
    fn release_ref(&self) -> Option<Arc<ManagedProcess>> {
        if self.released.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                server = %self.server_name,
                key = %self.key,
                "process handle released twice; ignoring"
            );
            return None;
        }

        let mut inner = lock(&self.pool);
        let entry = match inner.processes.get_mut(&self.key) {
            Some(e) if e.generation == self.generation => e,
            // Crashed and cleared, possibly already respawned under a new
            // generation: nothing of ours left to release.
            _ => return None,
        };

        entry.ref_count = entry.ref_count.saturating_sub(1);
        if let Some(pos) = entry.holders.iter().position(|h| h == &self.server_name) {
            entry.holders.remove(pos);
        }

        if entry.ref_count > 0 {
            tracing::debug!(
                server = %self.server_name,
                key = %self.key,
                ref_count = entry.ref_count,
                "released shared process reference"
            );
            return None;
        }

        let entry = inner.processes.remove(&self.key)?;
        drop(inner);

        tracing::info!(
            server = %self.server_name,
            key = %self.key,
            "last reference released; terminating server process"
        );
        entry.process.terminate();
        Some(entry.process)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.is_released() {
            let _ = self.release_ref();
        }
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn spawn_process(
    server_name: &str,
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
    key: &str,
    generation: u64,
    pool: Weak<Mutex<PoolInner>>,
    counters: Arc<PoolCounters>,
) -> Result<Arc<ManagedProcess>, McpError> {
    let mut cmd = Command::new(command);
    cmd.args(args);

    for (k, v) in env {
        cmd.env(k, v);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: server_name.to_string(),
        reason: format!("{command}: {e}"),
    })?;

    // On any early return below `child` is dropped and killed.
    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: server_name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: server_name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr = child.stderr.take().ok_or(McpError::SpawnFailed {
        name: server_name.to_string(),
        reason: "failed to capture stderr".into(),
    })?;

    let pending = PendingRequests::new();
    let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let (terminate_tx, terminate_rx) = oneshot::channel();
    let (exited_tx, exited_rx) = watch::channel(false);
    let pid = child.id();

    spawn_stdout_reader(server_name.to_string(), stdout, pending.clone());
    spawn_stderr_drain(server_name.to_string(), stderr, Arc::clone(&stderr_tail));
    spawn_exit_watcher(
        ExitWatch {
            server_name: server_name.to_string(),
            key: key.to_string(),
            generation,
            pool,
            counters,
            pending: pending.clone(),
            stderr_tail: Arc::clone(&stderr_tail),
        },
        child,
        terminate_rx,
        exited_tx,
    );

    Ok(Arc::new(ManagedProcess {
        key: key.to_string(),
        pid,
        stdin: tokio::sync::Mutex::new(stdin),
        pending,
        stderr_tail,
        terminate_tx: Mutex::new(Some(terminate_tx)),
        exited: exited_rx,
    }))
}

fn spawn_stdout_reader(server: String, stdout: ChildStdout, pending: PendingRequests) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => dispatch_line(&server, &pending, &line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "failed to read server stdout");
                    break;
                }
            }
        }
        tracing::debug!(server = %server, "server stdout closed");
    });
}

fn spawn_stderr_drain(server: String, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, "stderr: {}", line);
            let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });
}

struct ExitWatch {
    server_name: String,
    key: String,
    generation: u64,
    pool: Weak<Mutex<PoolInner>>,
    counters: Arc<PoolCounters>,
    pending: PendingRequests,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

fn spawn_exit_watcher(
    ctx: ExitWatch,
    mut child: Child,
    terminate_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
) {
    tokio::spawn(async move {
        let requested = tokio::select! {
            _ = child.wait() => false,
            _ = terminate_rx => true,
        };

        if requested {
            if let Err(e) = child.start_kill() {
                tracing::debug!(server = %ctx.server_name, error = %e, "kill failed (already exited?)");
            }
        }
        let status = child.wait().await;

        ctx.counters.exited.fetch_add(1, Ordering::Relaxed);
        let failed = ctx.pending.fail_all();

        if let Some(pool) = ctx.pool.upgrade() {
            let mut inner = lock(&pool);
            let current = inner
                .processes
                .get(&ctx.key)
                .is_some_and(|e| e.generation == ctx.generation);
            if current {
                inner.processes.remove(&ctx.key);
            }
        }

        if requested {
            tracing::info!(server = %ctx.server_name, key = %ctx.key, "server process terminated");
        } else {
            let stderr = {
                let tail = ctx.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
                tail.iter().cloned().collect::<Vec<_>>().join("\n")
            };
            tracing::warn!(
                server = %ctx.server_name,
                key = %ctx.key,
                status = ?status,
                failed_requests = failed,
                "server process exited unexpectedly{}",
                format_stderr_suffix(&truncate_chars(&stderr, MAX_STDERR_CHARS))
            );
        }

        let _ = exited_tx.send(true);
    });
}

/// Format stderr context as a suffix for error messages.
pub(crate) fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!("\n--- server stderr ---\n{stderr}")
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{truncated}... (truncated)")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
