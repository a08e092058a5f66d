//! Public surface of the supervisor: the pool, the query path, health
//! snapshots, and shutdown.
//!
//! The supervisor exclusively owns every process; callers only ever see
//! transient read-only views of state. The pool map sits behind one
//! reader/writer lock whose writer sections are brief map mutations; spawn
//! and teardown I/O always happens outside it, and a dedicated spawn lock
//! serializes spawn-and-install sequences so two callers cannot race a
//! language into the pool twice.

use std::{
    collections::HashMap,
    sync::{atomic::AtomicUsize, atomic::Ordering, Arc},
    time::{Duration, SystemTime},
};

use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::SupervisorConfig,
    eviction, health,
    health::{LivenessProbe, RestartGate, SignalProbe},
    process::{ProcessState, ServerProcess},
    protocol::{
        METHOD_DEFINITION, METHOD_DID_CLOSE, METHOD_DID_OPEN, METHOD_DOCUMENT_SYMBOL,
        METHOD_HOVER, METHOD_REFERENCES, METHOD_WORKSPACE_SYMBOL,
    },
    queue::Dispatcher,
    Error,
};

/// One pooled language: its process and its request queue. The two are
/// created and torn down together.
pub(crate) struct LanguageEntry {
    pub(crate) process: Arc<ServerProcess>,
    pub(crate) dispatcher: Arc<Dispatcher>,
}

/// State shared with the health task. Owned behind an `Arc` by the
/// supervisor and the health loop; nothing here points back at either.
pub(crate) struct Shared {
    pub(crate) config: SupervisorConfig,
    pub(crate) pool: RwLock<HashMap<String, LanguageEntry>>,
    pub(crate) gates: Mutex<HashMap<String, RestartGate>>,
    pub(crate) max_processes: AtomicUsize,
    pub(crate) probe: Arc<dyn LivenessProbe>,
    pub(crate) done: CancellationToken,
    pub(crate) spawn_lock: Mutex<()>,
}

/// Read-only health view of one pooled language.
#[derive(Clone, Debug)]
pub struct LanguageHealth {
    pub language: String,
    pub state: ProcessState,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub last_response_at: Option<SystemTime>,
    /// True when the request queue is loaded enough that `reject_fast`
    /// would shed the call.
    pub queue_rejecting: bool,
}

/// Supervisor for a bounded pool of language server subprocesses.
///
/// Construct it inside a Tokio runtime; a background health task starts
/// immediately and runs until [`Supervisor::shutdown`].
pub struct Supervisor {
    shared: Arc<Shared>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Creates a supervisor with the default POSIX liveness probe.
    pub fn new(config: SupervisorConfig) -> Result<Self, Error> {
        Self::with_probe(config, Arc::new(SignalProbe))
    }

    /// Creates a supervisor with a caller-supplied liveness probe.
    pub fn with_probe(
        config: SupervisorConfig,
        probe: Arc<dyn LivenessProbe>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let shared = Arc::new(Shared {
            max_processes: AtomicUsize::new(config.max_total_processes),
            config,
            pool: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            probe,
            done: CancellationToken::new(),
            spawn_lock: Mutex::new(()),
        });
        let health_task = health::spawn_health_task(shared.clone());
        Ok(Self {
            shared,
            health_task: Mutex::new(Some(health_task)),
        })
    }

    /// Ensures a `Ready` server exists for `language`. A no-op when one is
    /// already running; otherwise spawns (or restarts) through the backoff
    /// gate.
    pub async fn start_server(&self, language: &str) -> Result<(), Error> {
        ensure_started(&self.shared, language).await
    }

    /// Shuts the server for `language` down and removes it from the pool.
    /// Idempotent; clears any pending backoff gate since the stop is
    /// deliberate.
    pub async fn stop_server(&self, language: &str) {
        remove_and_teardown(&self.shared, language).await;
        let mut gates = self.shared.gates.lock().await;
        if let Some(gate) = gates.get_mut(language) {
            gate.not_before = None;
        }
    }

    /// Issues one request against `language`, starting its server if
    /// needed. Resolves with the server's result, the caller's own
    /// cancellation, or a terminal error; it never blocks forever.
    pub async fn query(
        &self,
        language: &str,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, Error> {
        ensure_started(&self.shared, language).await?;

        let dispatcher = {
            let pool = self.shared.pool.read().await;
            pool.get(language).map(|entry| entry.dispatcher.clone())
        }
        .ok_or_else(|| Error::backend_unavailable(language, "server is not running"))?;

        let reply = dispatcher.enqueue(method, params, cancel.clone()).await?;
        tokio::select! {
            delivered = reply => delivered.unwrap_or_else(|_| {
                if self.shared.done.is_cancelled() {
                    Err(Error::Shutdown)
                } else {
                    Err(Error::backend_unavailable(language, "request dropped during teardown"))
                }
            }),
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.shared.done.cancelled() => Err(Error::Shutdown),
        }
    }

    /// Sends a notification directly to a `Ready` server; fails fast
    /// otherwise.
    pub async fn notify(&self, language: &str, method: &str, params: Value) -> Result<(), Error> {
        let process = {
            let pool = self.shared.pool.read().await;
            pool.get(language).map(|entry| entry.process.clone())
        }
        .ok_or_else(|| Error::backend_unavailable(language, "server is not running"))?;

        if !process.is_ready() {
            return Err(Error::WorkspaceNotReady {
                language: language.to_string(),
            });
        }
        process.send_notification(method, params).await
    }

    /// Classifies the server for `language` as usable or not.
    pub async fn health_check(&self, language: &str) -> Result<(), Error> {
        if !self.shared.config.servers.contains_key(language) {
            return Err(Error::backend_unavailable(language, "no server descriptor configured"));
        }
        let state = {
            let pool = self.shared.pool.read().await;
            pool.get(language).map(|entry| entry.process.state())
        };
        match state {
            Some(ProcessState::Ready) => Ok(()),
            Some(ProcessState::Dead) | None => {
                Err(Error::backend_unavailable(language, "server is not running"))
            }
            Some(_) => Err(Error::WorkspaceNotReady {
                language: language.to_string(),
            }),
        }
    }

    /// Restarts `language` immediately, bypassing the backoff gate.
    pub async fn force_restart(&self, language: &str) -> Result<(), Error> {
        health::restart_language(&self.shared, language, true).await
    }

    /// Restarts every pooled server that is not `Ready`. Returns the
    /// languages that could not be recovered and why.
    pub async fn recover_all(&self) -> HashMap<String, Error> {
        let unhealthy: Vec<String> = {
            let pool = self.shared.pool.read().await;
            pool.iter()
                .filter(|(_, entry)| !entry.process.is_ready())
                .map(|(language, _)| language.clone())
                .collect()
        };

        let mut failures = HashMap::new();
        for language in unhealthy {
            if let Err(err) = health::restart_language(&self.shared, &language, true).await {
                failures.insert(language, err);
            }
        }
        failures
    }

    /// Health view of one language, if pooled.
    pub async fn language_health(&self, language: &str) -> Option<LanguageHealth> {
        let entry = {
            let pool = self.shared.pool.read().await;
            pool.get(language)
                .map(|entry| (entry.process.clone(), entry.dispatcher.clone()))
        };
        let (process, dispatcher) = entry?;
        let restart_count = {
            let gates = self.shared.gates.lock().await;
            gates
                .get(language)
                .map(|gate| gate.count)
                .unwrap_or_else(|| process.restart_count())
        };
        Some(LanguageHealth {
            language: language.to_string(),
            state: process.state(),
            restart_count,
            consecutive_failures: process.consecutive_failures(),
            last_response_at: process.last_response_at(),
            queue_rejecting: dispatcher.reject_fast(),
        })
    }

    /// Health view of the whole pool.
    pub async fn health_snapshot(&self) -> HashMap<String, LanguageHealth> {
        let languages: Vec<String> = {
            let pool = self.shared.pool.read().await;
            pool.keys().cloned().collect()
        };
        let mut snapshot = HashMap::new();
        for language in languages {
            if let Some(view) = self.language_health(&language).await {
                snapshot.insert(language, view);
            }
        }
        snapshot
    }

    /// True when the queue for `language` is loaded enough that callers
    /// should shed the request instead of paying the admission wait.
    pub async fn reject_fast(&self, language: &str) -> bool {
        let pool = self.shared.pool.read().await;
        pool.get(language)
            .map(|entry| entry.dispatcher.reject_fast())
            .unwrap_or(false)
    }

    /// Languages in LRU order (never-responded last), for observability.
    pub async fn eviction_candidates(&self) -> Vec<String> {
        eviction::eviction_candidates(&self.shared).await
    }

    /// Shuts down every server idle for longer than `older_than`.
    pub async fn evict_idle(&self, older_than: Duration) -> Vec<String> {
        eviction::evict_idle(&self.shared, older_than).await
    }

    /// Adjusts the global process cap, evicting down to it if necessary.
    pub async fn set_max_processes(&self, cap: usize) -> Result<(), Error> {
        eviction::set_max_processes(&self.shared, cap).await
    }

    /// Capabilities the server for `language` declared at initialize.
    pub async fn capabilities(&self, language: &str) -> Option<Value> {
        let pool = self.shared.pool.read().await;
        pool.get(language)
            .and_then(|entry| entry.process.capabilities().cloned())
    }

    /// Shuts the whole pool down: every queue is drained, every child is
    /// terminated, every background task joined. Idempotent.
    pub async fn shutdown(&self) {
        self.shared.done.cancel();

        // Wait out any spawn already past its shutdown check so it cannot
        // install a process behind the sweep below.
        drop(self.shared.spawn_lock.lock().await);

        let languages: Vec<String> = {
            let pool = self.shared.pool.read().await;
            pool.keys().cloned().collect()
        };
        for language in languages {
            remove_and_teardown(&self.shared, &language).await;
        }

        let handle = { self.health_task.lock().await.take() };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("supervisor shut down");
    }

    // Convenience wrappers over `query`/`notify` building the LSP
    // parameter shapes.

    pub async fn goto_definition(
        &self,
        language: &str,
        uri: &str,
        line: u32,
        character: u32,
        cancel: CancellationToken,
    ) -> Result<Value, Error> {
        self.query(
            language,
            METHOD_DEFINITION,
            position_params(uri, line, character),
            cancel,
        )
        .await
    }

    pub async fn find_references(
        &self,
        language: &str,
        uri: &str,
        line: u32,
        character: u32,
        include_declaration: bool,
        cancel: CancellationToken,
    ) -> Result<Value, Error> {
        let mut params = position_params(uri, line, character);
        params["context"] = json!({ "includeDeclaration": include_declaration });
        self.query(language, METHOD_REFERENCES, params, cancel).await
    }

    pub async fn document_symbols(
        &self,
        language: &str,
        uri: &str,
        cancel: CancellationToken,
    ) -> Result<Value, Error> {
        self.query(
            language,
            METHOD_DOCUMENT_SYMBOL,
            json!({ "textDocument": { "uri": uri } }),
            cancel,
        )
        .await
    }

    pub async fn workspace_symbols(
        &self,
        language: &str,
        pattern: &str,
        cancel: CancellationToken,
    ) -> Result<Value, Error> {
        self.query(
            language,
            METHOD_WORKSPACE_SYMBOL,
            json!({ "query": pattern }),
            cancel,
        )
        .await
    }

    pub async fn hover(
        &self,
        language: &str,
        uri: &str,
        line: u32,
        character: u32,
        cancel: CancellationToken,
    ) -> Result<Value, Error> {
        self.query(language, METHOD_HOVER, position_params(uri, line, character), cancel)
            .await
    }

    /// Announces an open document to the server for `language`.
    pub async fn did_open(
        &self,
        language: &str,
        uri: &str,
        text: &str,
    ) -> Result<(), Error> {
        self.notify(
            language,
            METHOD_DID_OPEN,
            json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": language,
                    "version": 1,
                    "text": text,
                }
            }),
        )
        .await
    }

    pub async fn did_close(&self, language: &str, uri: &str) -> Result<(), Error> {
        self.notify(
            language,
            METHOD_DID_CLOSE,
            json!({ "textDocument": { "uri": uri } }),
        )
        .await
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shared.done.cancel();
        if let Ok(mut guard) = self.health_task.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

fn position_params(uri: &str, line: u32, character: u32) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character },
    })
}

/// Ensures a pooled, `Ready` server for `language`: a no-op when one
/// exists, a gate-checked restart when the pooled one has degraded, and a
/// gate-checked fresh spawn otherwise.
pub(crate) async fn ensure_started(shared: &Arc<Shared>, language: &str) -> Result<(), Error> {
    if shared.done.is_cancelled() {
        return Err(Error::Shutdown);
    }
    if !shared.config.servers.contains_key(language) {
        return Err(Error::backend_unavailable(language, "no server descriptor configured"));
    }

    let existing = {
        let pool = shared.pool.read().await;
        pool.get(language).map(|entry| entry.process.state())
    };
    match existing {
        Some(ProcessState::Ready) => return Ok(()),
        Some(_) => return health::restart_language(shared, language, false).await,
        None => {}
    }

    // Fresh spawn: the gate still applies (a previous spawn may have
    // failed) but the attempt itself does not advance the curve.
    let restart_count = {
        let gates = shared.gates.lock().await;
        let gate = gates.get(language).copied().unwrap_or_default();
        if let Some(not_before) = gate.not_before {
            let now = std::time::Instant::now();
            if not_before > now {
                return Err(Error::backoff_gated(language, not_before - now));
            }
        }
        gate.count
    };

    spawn_and_install(shared, language, restart_count, true).await
}

/// Spawns, initializes, and installs a server for `language`. With
/// `arm_gate_on_failure`, a failed spawn advances the backoff gate so
/// follow-up attempts are throttled.
pub(crate) async fn spawn_and_install(
    shared: &Arc<Shared>,
    language: &str,
    restart_count: u32,
    arm_gate_on_failure: bool,
) -> Result<(), Error> {
    let Some(descriptor) = shared.config.servers.get(language) else {
        return Err(Error::backend_unavailable(language, "no server descriptor configured"));
    };

    let _guard = shared.spawn_lock.lock().await;
    if shared.done.is_cancelled() {
        return Err(Error::Shutdown);
    }
    {
        // Another caller may have installed this language while we waited.
        let pool = shared.pool.read().await;
        if pool.contains_key(language) {
            return Ok(());
        }
    }

    eviction::ensure_capacity(shared).await?;

    let spawned = ServerProcess::spawn(
        language,
        descriptor,
        &shared.config.workspace_root,
        shared.config.request_timeout,
        restart_count,
    )
    .await;

    let process = match spawned {
        Ok(process) => process,
        Err(err) => {
            if arm_gate_on_failure {
                let mut gates = shared.gates.lock().await;
                let gate = gates.entry(language.to_string()).or_default();
                gate.count += 1;
                let delay = health::backoff_delay(
                    shared.config.base_backoff,
                    shared.config.max_backoff,
                    gate.count,
                );
                gate.not_before = Some(std::time::Instant::now() + delay);
            }
            debug!(language, "spawn failed: {err}");
            return Err(Error::backend_unavailable(language, err.to_string()));
        }
    };

    if shared.done.is_cancelled() {
        process.shutdown().await;
        return Err(Error::Shutdown);
    }

    let dispatcher = Arc::new(Dispatcher::start(
        language.to_string(),
        process.clone(),
        shared.config.queue_size_per_language,
        shared.config.max_queue_wait,
    ));

    let mut pool = shared.pool.write().await;
    pool.insert(
        language.to_string(),
        LanguageEntry { process, dispatcher },
    );
    Ok(())
}

/// Removes `language` from the pool and tears its queue and process down.
/// Queued tickets are released with `BackendUnavailable`; pending requests
/// with `Shutdown`.
pub(crate) async fn remove_and_teardown(shared: &Arc<Shared>, language: &str) {
    let entry = {
        let mut pool = shared.pool.write().await;
        pool.remove(language)
    };
    let Some(entry) = entry else {
        return;
    };
    entry.dispatcher.close();
    entry.process.shutdown().await;
    entry.dispatcher.join().await;
}
