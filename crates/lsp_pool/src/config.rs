use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    time::Duration,
};

use crate::Error;

/// Global cap on concurrently running server processes.
pub const DEFAULT_MAX_TOTAL_PROCESSES: usize = 4;
/// Per-language request queue capacity.
pub const DEFAULT_QUEUE_SIZE_PER_LANGUAGE: usize = 10;
/// How long `query` waits for a free queue slot before rejecting.
pub const DEFAULT_MAX_QUEUE_WAIT: Duration = Duration::from_millis(200);
/// Request errors tolerated before a server is marked unhealthy.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// First restart delay; doubles on every subsequent restart.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(1000);
/// Ceiling for the restart delay curve.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(30_000);
/// Cadence of the periodic health pass.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Response silence tolerated on a `Ready` server before it is suspect.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);
/// Per-request deadline once a request is on the wire.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Launch description for one language server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment entries applied on top of the inherited env.
    pub env: BTreeMap<String, String>,
}

impl ServerDescriptor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Immutable supervisor configuration.
///
/// `workspace_root` doubles as the `rootUri` sent during `initialize` and as
/// the working directory of every spawned server. The numeric limits default
/// to values that keep a handful of servers responsive on a developer
/// machine; see the `DEFAULT_*` constants.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub workspace_root: PathBuf,
    pub servers: HashMap<String, ServerDescriptor>,
    pub max_total_processes: usize,
    pub queue_size_per_language: usize,
    pub max_queue_wait: Duration,
    pub max_consecutive_failures: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub health_check_interval: Duration,
    pub response_timeout: Duration,
    pub request_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            servers: HashMap::new(),
            max_total_processes: DEFAULT_MAX_TOTAL_PROCESSES,
            queue_size_per_language: DEFAULT_QUEUE_SIZE_PER_LANGUAGE,
            max_queue_wait: DEFAULT_MAX_QUEUE_WAIT,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Registers a server descriptor for a language identifier.
    pub fn server(mut self, language: impl Into<String>, descriptor: ServerDescriptor) -> Self {
        self.servers.insert(language.into(), descriptor);
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_total_processes == 0 {
            return Err(Error::InvalidConfig(
                "max_total_processes must be at least 1".into(),
            ));
        }
        if self.queue_size_per_language == 0 {
            return Err(Error::InvalidConfig(
                "queue_size_per_language must be at least 1".into(),
            ));
        }
        for (language, descriptor) in &self.servers {
            if descriptor.command.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "server command for `{language}` must not be empty"
                )));
            }
        }
        Ok(())
    }
}
