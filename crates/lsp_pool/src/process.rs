//! One running language server: spawn, handshake, request correlation,
//! teardown.
//!
//! The transport owns a reader task that demuxes responses from
//! server-initiated traffic and a drained stderr task; writes to the child's
//! stdin are serialized through a mutex. Callers get their reply through a
//! one-shot slot registered in the pending table under a fresh request id,
//! so parallel requests on the same process are safe. Ids are never reused
//! within a process's lifetime; a replacement process starts a fresh
//! counter.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{oneshot, Mutex},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::ServerDescriptor,
    framing,
    protocol::{self, Incoming, RequestId, METHOD_EXIT, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_SHUTDOWN},
    Error,
};

/// Bound on the graceful `shutdown` request during teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// How long to wait for the OS process to die after a kill.
const KILL_WAIT: Duration = Duration::from_secs(2);
/// How long to wait for background tasks before aborting them.
const TASK_JOIN_WAIT: Duration = Duration::from_millis(500);

/// Lifecycle state of a server process.
///
/// `Ready` is the only state in which requests may be dispatched; `Dead` is
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Starting = 0,
    Initializing = 1,
    Ready = 2,
    Unhealthy = 3,
    Dead = 4,
}

impl ProcessState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ProcessState::Starting,
            1 => ProcessState::Initializing,
            2 => ProcessState::Ready,
            3 => ProcessState::Unhealthy,
            _ => ProcessState::Dead,
        }
    }
}

type PendingSlots = HashMap<RequestId, oneshot::Sender<Result<Value, Error>>>;

/// State shared between the process handle and its reader task. The reader
/// never sees the supervisor or the full process handle.
#[derive(Debug)]
struct ProcessCore {
    language: String,
    state: AtomicU8,
    pending: Mutex<PendingSlots>,
    done: CancellationToken,
}

impl ProcessCore {
    fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Moves to `next` unless the process is already terminal.
    fn set_state(&self, next: ProcessState) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                if ProcessState::from_u8(raw) == ProcessState::Dead {
                    None
                } else {
                    Some(next as u8)
                }
            });
    }

    /// Releases every pending waiter with an error produced per slot.
    async fn drain_pending(&self, make_error: impl Fn() -> Error) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(make_error()));
        }
    }
}

/// Handle to one spawned language server and its stdio transport.
#[derive(Debug)]
pub(crate) struct ServerProcess {
    core: Arc<ProcessCore>,
    stdin: Arc<Mutex<ChildStdin>>,
    next_id: AtomicU64,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    last_response_at: AtomicU64,
    consecutive_failures: AtomicU32,
    restart_count: u32,
    capabilities: OnceLock<Value>,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl ServerProcess {
    /// Spawns the server, wires its stdio, and completes the
    /// `initialize`/`initialized` handshake. The returned process is
    /// `Ready`; any failure tears the child down before returning.
    pub(crate) async fn spawn(
        language: &str,
        descriptor: &ServerDescriptor,
        workspace_root: &std::path::Path,
        request_timeout: Duration,
        restart_count: u32,
    ) -> Result<Arc<Self>, Error> {
        let mut command = Command::new(&descriptor.command);
        command
            .args(&descriptor.args)
            .current_dir(workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &descriptor.env {
            command.env(key, value);
        }

        let mut child = spawn_with_retry(&mut command, &descriptor.command).await?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Protocol("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Protocol("child stdout unavailable".into()))?;
        let stderr = child.stderr.take();
        let pid = child.id();

        let core = Arc::new(ProcessCore {
            language: language.to_string(),
            state: AtomicU8::new(ProcessState::Starting as u8),
            pending: Mutex::new(HashMap::new()),
            done: CancellationToken::new(),
        });
        let stdin = Arc::new(Mutex::new(stdin));

        let reader = tokio::spawn(reader_task(core.clone(), stdin.clone(), stdout));
        let mut tasks = vec![reader];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_task(language.to_string(), stderr)));
        }

        let process = Arc::new(Self {
            core,
            stdin,
            next_id: AtomicU64::new(0),
            child: Mutex::new(Some(child)),
            pid,
            last_response_at: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            restart_count,
            capabilities: OnceLock::new(),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
            request_timeout,
        });

        process.core.set_state(ProcessState::Initializing);
        match process
            .request_inner(
                METHOD_INITIALIZE,
                protocol::initialize_params(workspace_root),
                request_timeout,
                false,
            )
            .await
        {
            Ok(reply) => {
                let capabilities = reply.get("capabilities").cloned().unwrap_or(Value::Null);
                let _ = process.capabilities.set(capabilities);
            }
            Err(err) => {
                let reason = err.to_string();
                process.shutdown().await;
                return Err(Error::Handshake(reason));
            }
        }
        if let Err(err) = process
            .send_notification(METHOD_INITIALIZED, Value::Object(Default::default()))
            .await
        {
            let reason = err.to_string();
            process.shutdown().await;
            return Err(Error::Handshake(reason));
        }

        process.core.set_state(ProcessState::Ready);
        debug!(language, pid, "language server ready");
        Ok(process)
    }

    pub(crate) fn state(&self) -> ProcessState {
        self.core.state()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state() == ProcessState::Ready
    }

    /// Moves a `Ready` process to `Unhealthy`; other states are untouched.
    pub(crate) fn mark_unhealthy(&self) {
        let _ = self.core.state.compare_exchange(
            ProcessState::Ready as u8,
            ProcessState::Unhealthy as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn mark_dead(&self) {
        self.core.set_state(ProcessState::Dead);
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Milliseconds since the Unix epoch of the most recent successful
    /// reply; zero until the first one.
    pub(crate) fn last_response_at_millis(&self) -> u64 {
        self.last_response_at.load(Ordering::SeqCst)
    }

    pub(crate) fn last_response_at(&self) -> Option<SystemTime> {
        match self.last_response_at_millis() {
            0 => None,
            millis => Some(UNIX_EPOCH + Duration::from_millis(millis)),
        }
    }

    /// Capabilities object the server declared during `initialize`.
    pub(crate) fn capabilities(&self) -> Option<&Value> {
        self.capabilities.get()
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.core.pending.lock().await.len()
    }

    /// Sends a request and awaits its reply, the per-request deadline, or
    /// teardown, whichever comes first. Successes and countable failures
    /// update the health counters.
    pub(crate) async fn send_request(&self, method: &str, params: Value) -> Result<Value, Error> {
        self.request_inner(method, params, self.request_timeout, true)
            .await
    }

    async fn request_inner(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
        record: bool,
    ) -> Result<Value, Error> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.core.pending.lock().await;
            pending.insert(id, tx);
        }

        let envelope = protocol::request(id, method, params);
        if let Err(err) = self.write_framed(&envelope, deadline).await {
            let mut pending = self.core.pending.lock().await;
            pending.remove(&id);
            return Err(err);
        }

        let outcome = tokio::select! {
            received = rx => match received {
                Ok(delivered) => delivered,
                Err(_) if self.core.done.is_cancelled() => Err(Error::Shutdown),
                Err(_) => Err(Error::TransportClosed),
            },
            _ = time::sleep(deadline) => {
                let mut pending = self.core.pending.lock().await;
                pending.remove(&id);
                Err(Error::Timeout(deadline))
            }
            _ = self.core.done.cancelled() => {
                let mut pending = self.core.pending.lock().await;
                pending.remove(&id);
                Err(Error::Shutdown)
            }
        };

        if record {
            match &outcome {
                Ok(_) => self.record_success(),
                Err(err) if err.counts_as_failure() => self.record_failure(),
                Err(_) => {}
            }
        }
        outcome
    }

    /// Fire-and-forget notification; no correlation, no reply.
    pub(crate) async fn send_notification(&self, method: &str, params: Value) -> Result<(), Error> {
        let envelope = protocol::notification(method, params);
        self.write_framed(&envelope, self.request_timeout).await
    }

    async fn write_framed(&self, envelope: &Value, deadline: Duration) -> Result<(), Error> {
        let mut stdin = self.stdin.lock().await;
        match time::timeout(deadline, framing::write_message(&mut *stdin, envelope)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline)),
        }
    }

    fn record_success(&self) {
        let now = unix_millis();
        let _ = self
            .last_response_at
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            });
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
    }

    /// Graceful teardown: best-effort `shutdown`/`exit` handshake, then the
    /// kill path, then release of every pending waiter. Converges to `Dead`
    /// no matter what the child does. Idempotent.
    pub(crate) async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.state() == ProcessState::Ready {
            let _ = self
                .request_inner(METHOD_SHUTDOWN, Value::Null, SHUTDOWN_GRACE, false)
                .await;
            let _ = self
                .send_notification(METHOD_EXIT, Value::Null)
                .await;
        }

        self.core.done.cancel();

        if let Some(mut child) = self.child.lock().await.take() {
            if child.try_wait().ok().flatten().is_none() {
                let _ = child.start_kill();
            }
            let _ = time::timeout(KILL_WAIT, child.wait()).await;
        }

        self.core.set_state(ProcessState::Dead);
        self.core.drain_pending(|| Error::Shutdown).await;

        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain(..).collect()
        };
        for mut handle in handles {
            if time::timeout(TASK_JOIN_WAIT, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        debug!(language = %self.core.language, "language server torn down");
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.core.done.cancel();
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.start_kill();
            }
        }
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

/// Retries transient `ExecutableFileBusy` failures with a tiny doubling
/// delay; everything else is surfaced immediately.
async fn spawn_with_retry(command: &mut Command, binary: &str) -> Result<Child, Error> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(Error::Spawn {
                    command: binary.to_string(),
                    source,
                });
            }
        }
    }

    unreachable!("spawn_with_retry returns before exhausting retries")
}

/// Demuxes the server's stdout: replies are routed to their pending slot,
/// server-initiated requests are answered with an empty result so the
/// server is never left blocked, and the known notification set is
/// ignored. Exits on EOF, protocol fault, or teardown; always transitions
/// the process to `Dead` and releases every waiter on the way out.
async fn reader_task(
    core: Arc<ProcessCore>,
    stdin: Arc<Mutex<ChildStdin>>,
    stdout: ChildStdout,
) {
    let mut reader = BufReader::new(stdout);

    loop {
        let message = tokio::select! {
            _ = core.done.cancelled() => break,
            read = framing::read_message(&mut reader) => match read {
                Ok(value) => value,
                Err(Error::Eof) => {
                    debug!(language = %core.language, "server closed stdout");
                    break;
                }
                Err(err) => {
                    warn!(language = %core.language, "reader stopping: {err}");
                    break;
                }
            },
        };

        match protocol::decode_message(message) {
            Some(Incoming::Response { id, result, error }) => {
                let slot = {
                    let mut pending = core.pending.lock().await;
                    pending.remove(&id)
                };
                // A missing slot means the caller timed out or detached;
                // the late reply is discarded.
                let Some(tx) = slot else { continue };
                let outcome = match (result, error) {
                    (_, Some(err)) => Err(Error::Lsp {
                        code: err.code,
                        message: err.message,
                        data: err.data,
                    }),
                    (Some(value), None) => Ok(value),
                    (None, None) => {
                        Err(Error::Protocol("response carries neither result nor error".into()))
                    }
                };
                let _ = tx.send(outcome);
            }
            Some(Incoming::ServerRequest { id, method }) => {
                debug!(language = %core.language, %method, "answering server request with empty result");
                let reply = protocol::empty_response(id);
                let mut stdin = stdin.lock().await;
                if framing::write_message(&mut *stdin, &reply).await.is_err() {
                    break;
                }
            }
            Some(Incoming::Notification { method }) => {
                if !protocol::is_ignored_server_method(&method) {
                    debug!(language = %core.language, %method, "ignoring server notification");
                }
            }
            None => {
                warn!(language = %core.language, "discarding message that is not JSON-RPC");
            }
        }
    }

    core.set_state(ProcessState::Dead);
    let done = core.done.is_cancelled();
    core.drain_pending(|| if done { Error::Shutdown } else { Error::TransportClosed })
        .await;
}

/// Drains stderr so the child never blocks on a full pipe; lines are
/// forwarded to the log.
async fn stderr_task(language: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(language = %language, "server stderr: {line}");
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
