//! Interactive terminal sessions bridged to a shell inside a container.

use std::{
    io::{Read, Write},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use portable_pty::{Child, ChildKiller, ExitStatus, MasterPty, PtySize, native_pty_system};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;
use workspace_engine_core::{
    AgentId, ContainerName, ContainerRuntime, DockerError, EventStore, TerminalEvent,
    TerminalSubscription, config::TerminalConfig,
};

use crate::shell::interactive_argv;

/// Terminal session identifier.
pub type TerminalId = Uuid;

/// How long the read loop waits for the process after the terminal closes
/// before publishing `Exit` anyway.
const REAP_GRACE: Duration = Duration::from_secs(1);
const REAP_POLL: Duration = Duration::from_millis(20);

/// Lifecycle of a terminal session. `Exited` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Idle,
    Starting,
    Running,
    Exited,
}

/// Terminal session error.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error(transparent)]
    Docker(#[from] DockerError),
    #[error("PTY error: {0}")]
    Pty(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Terminal session is not running")]
    NotRunning,
}

/// Options for a new terminal session.
#[derive(Debug, Clone)]
pub struct TerminalOptions {
    pub cols: u16,
    pub rows: u16,
    /// Command typed into the shell once the first prompt appears.
    pub initial_command: Option<String>,
    /// Argv to run instead of the interactive shell.
    pub command: Option<Vec<String>>,
    pub read_chunk_bytes: usize,
    pub term: String,
    /// Preferred shells, first available wins.
    pub shells: Vec<String>,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self::from_config(&TerminalConfig::default())
    }
}

impl TerminalOptions {
    #[must_use]
    pub fn from_config(config: &TerminalConfig) -> Self {
        Self {
            cols: config.default_cols,
            rows: config.default_rows,
            initial_command: None,
            command: None,
            read_chunk_bytes: config.read_chunk_bytes.max(1),
            term: config.term.clone(),
            shells: config.shell.clone(),
        }
    }

    #[must_use]
    pub const fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    #[must_use]
    pub fn with_initial_command(mut self, command: Option<String>) -> Self {
        self.initial_command = command;
        self
    }

    #[must_use]
    pub fn with_command(mut self, argv: Vec<String>) -> Self {
        self.command = Some(argv);
        self
    }
}

/// Types a queued command into the shell when the first prompt shows up.
///
/// The prompt check is a heuristic: any chunk containing `$`. It fires at
/// most once.
#[derive(Debug)]
struct PromptInjector {
    pending: Option<String>,
}

impl PromptInjector {
    fn new(command: Option<String>) -> Self {
        Self {
            pending: command.filter(|c| !c.trim().is_empty()),
        }
    }

    fn observe(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        if self.pending.is_none() || !chunk.contains(&b'$') {
            return None;
        }
        let mut bytes = self.pending.take()?.into_bytes();
        bytes.push(b'\n');
        Some(bytes)
    }
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| {
        warn!("terminal lock was poisoned, recovering");
        PoisonError::into_inner(e)
    })
}

/// Publishes the final state and the `Exit` event however the read loop ends.
struct ExitGuard {
    id: TerminalId,
    events: Arc<EventStore>,
    state: Arc<watch::Sender<TerminalState>>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.state.send_replace(TerminalState::Exited);
        if self.events.push_exit() {
            debug!(terminal_id = %self.id, "Published terminal exit");
        }
    }
}

struct ReadLoop {
    id: TerminalId,
    reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: SharedWriter,
    injector: PromptInjector,
    chunk_bytes: usize,
    cancelled: Arc<AtomicBool>,
    exit_code: Arc<Mutex<Option<i32>>>,
    reaped: Arc<AtomicBool>,
}

impl ReadLoop {
    fn run(mut self, guard: ExitGuard) {
        let mut buf = vec![0u8; self.chunk_bytes];
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                debug!(terminal_id = %self.id, "Read loop cancelled");
                break;
            }
            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    let injection = self.injector.observe(&chunk);
                    guard.events.push_output(chunk);
                    if let Some(command) = injection {
                        self.inject(&command);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // EIO once every slave handle is closed.
                    debug!(terminal_id = %self.id, error = %e, "Terminal read ended");
                    break;
                }
            }
        }

        match self.try_reap(REAP_GRACE) {
            Ok(Some(status)) => self.record_exit(&status),
            Ok(None) => {
                // The terminal is closed but the process lingers; `Exit` must not wait on it.
                debug!(terminal_id = %self.id, "Terminal closed before its process exited");
                drop(guard);
                match self.child.wait() {
                    Ok(status) => self.record_exit(&status),
                    Err(e) => warn!(terminal_id = %self.id, error = %e, "Failed to reap terminal process"),
                }
                return;
            }
            Err(e) => warn!(terminal_id = %self.id, error = %e, "Failed to reap terminal process"),
        }
        drop(guard);
    }

    fn try_reap(&mut self, grace: Duration) -> std::io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(REAP_POLL);
        }
    }

    fn record_exit(&self, status: &ExitStatus) {
        let code = i32::try_from(status.exit_code()).ok();
        *lock(&self.exit_code) = code;
        self.reaped.store(true, Ordering::Release);
        info!(terminal_id = %self.id, exit_code = ?code, "Terminal exited");
    }

    fn inject(&self, command: &[u8]) {
        let mut writer = lock(&self.writer);
        if let Err(e) = writer.write_all(command).and_then(|()| writer.flush()) {
            warn!(terminal_id = %self.id, error = %e, "Failed to send initial command");
        } else {
            debug!(terminal_id = %self.id, "Sent initial command");
        }
    }
}

/// Start the read loop thread. If the thread cannot start, the child is
/// killed before the error is returned.
fn start_reader(
    spawn: impl FnOnce() -> std::io::Result<JoinHandle<()>>,
    killer: &mut dyn ChildKiller,
) -> std::io::Result<JoinHandle<()>> {
    spawn().inspect_err(|e| {
        warn!(error = %e, "Failed to start terminal reader, killing process");
        if let Err(kill) = killer.kill() {
            debug!(error = %kill, "Terminal process already gone");
        }
    })
}

/// A pseudo-terminal backed shell running inside an agent's container.
///
/// One background thread reads the terminal for the whole session and
/// publishes [`TerminalEvent`]s; `write`, `resize` and `terminate` can be
/// called concurrently with it. Dropping the session terminates it.
pub struct TerminalSession {
    id: TerminalId,
    agent: AgentId,
    container: ContainerName,
    events: Arc<EventStore>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: SharedWriter,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    state: Arc<watch::Sender<TerminalState>>,
    size: Mutex<(u16, u16)>,
    exit_code: Arc<Mutex<Option<i32>>>,
    reaped: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    terminated: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("agent", &self.agent)
            .field("container", &self.container)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    /// Start an interactive shell in `container`.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Docker`] if the container is not running or
    /// the exec client cannot be spawned, [`TerminalError::Pty`] if no
    /// pseudo-terminal could be allocated.
    pub async fn spawn(
        runtime: Arc<dyn ContainerRuntime>,
        agent: AgentId,
        container: ContainerName,
        options: TerminalOptions,
    ) -> Result<Self, TerminalError> {
        let id = Uuid::new_v4();
        let (state, _) = watch::channel(TerminalState::Idle);
        let state = Arc::new(state);
        state.send_replace(TerminalState::Starting);

        runtime.ensure_running(&container).await?;

        let size = if options.cols > 0 && options.rows > 0 {
            PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            }
        } else {
            PtySize::default()
        };
        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| TerminalError::Pty(e.to_string()))?;

        let argv = options
            .command
            .clone()
            .unwrap_or_else(|| interactive_argv(&options.shells));
        let cmd = runtime.pty_command(&container, &argv, &[("TERM".to_string(), options.term.clone())]);
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DockerError::SpawnFailed(e.to_string()))?;
        // Keeping the slave open would hide the child's exit from the reader.
        drop(pair.slave);

        let pid = child.process_id();
        let mut killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::Pty(e.to_string()))?;
        let writer: SharedWriter = Arc::new(Mutex::new(
            pair.master
                .take_writer()
                .map_err(|e| TerminalError::Pty(e.to_string()))?,
        ));

        let events = Arc::new(EventStore::new());
        let exit_code = Arc::new(Mutex::new(None));
        let reaped = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));

        state.send_replace(TerminalState::Running);
        info!(
            terminal_id = %id,
            agent = %agent,
            container = %container,
            ?pid,
            cols = size.cols,
            rows = size.rows,
            "Terminal session started"
        );

        let read_loop = ReadLoop {
            id,
            reader,
            child,
            writer: Arc::clone(&writer),
            injector: PromptInjector::new(options.initial_command),
            chunk_bytes: options.read_chunk_bytes.max(1),
            cancelled: Arc::clone(&cancelled),
            exit_code: Arc::clone(&exit_code),
            reaped: Arc::clone(&reaped),
        };
        let guard = ExitGuard {
            id,
            events: Arc::clone(&events),
            state: Arc::clone(&state),
        };
        let thread = std::thread::Builder::new().name(format!("wse-pty-{}", id.simple()));
        let handle = start_reader(move || thread.spawn(move || read_loop.run(guard)), killer.as_mut())?;

        Ok(Self {
            id,
            agent,
            container,
            events,
            master: Mutex::new(pair.master),
            writer,
            killer: Mutex::new(killer),
            pid,
            state,
            size: Mutex::new((size.cols, size.rows)),
            exit_code,
            reaped,
            cancelled,
            terminated: AtomicBool::new(false),
            reader: Mutex::new(Some(handle)),
        })
    }

    #[must_use]
    pub const fn id(&self) -> TerminalId {
        self.id
    }

    #[must_use]
    pub const fn agent(&self) -> &AgentId {
        &self.agent
    }

    #[must_use]
    pub const fn container(&self) -> &ContainerName {
        &self.container
    }

    /// Local process id of the exec client.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn state(&self) -> TerminalState {
        *self.state.borrow()
    }

    /// Current `(cols, rows)`.
    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    /// Exit code, once the process has been reaped. A process that outlives
    /// its terminal is reaped after `Exit` is published.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }

    /// Subscribe to output (history first) followed by `Exit`.
    #[must_use]
    pub fn subscribe(&self) -> TerminalSubscription {
        self.events.subscribe()
    }

    /// Output published so far.
    #[must_use]
    pub fn history(&self) -> Vec<TerminalEvent> {
        self.events.get_history()
    }

    /// Wait until the session has exited.
    pub async fn wait_exited(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == TerminalState::Exited).await;
    }

    /// Forward raw bytes to the shell.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::NotRunning`] once the session has exited or
    /// been terminated, or an I/O error from the terminal.
    pub fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        if self.state() == TerminalState::Exited || self.terminated.load(Ordering::Acquire) {
            return Err(TerminalError::NotRunning);
        }
        let mut writer = lock(&self.writer);
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Change the window size. Failures only affect rendering and are logged.
    pub fn resize(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 || self.state() != TerminalState::Running {
            return;
        }
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        match lock(&self.master).resize(size) {
            Ok(()) => *lock(&self.size) = (cols, rows),
            Err(e) => debug!(terminal_id = %self.id, error = %e, "Resize failed"),
        }
    }

    /// Ask the shell to exit and stop reading. Returns immediately; safe to
    /// call more than once or after the session has exited.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancelled.store(true, Ordering::Release);
        if self.reaped.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = lock(&self.killer).kill() {
            debug!(terminal_id = %self.id, error = %e, "Terminal process already gone");
        }
        // Detach the reader; it publishes `Exit` once the terminal closes.
        drop(lock(&self.reader).take());
        info!(terminal_id = %self.id, container = %self.container, "Terminal session terminated");
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.terminate();
    }
}
