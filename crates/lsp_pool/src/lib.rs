#![forbid(unsafe_code)]
//! Supervisor for a bounded pool of Language Server Protocol subprocesses.
//!
//! Owns child language servers speaking LSP over stdio and exposes a
//! cancellable query interface on top of them. Each language gets one
//! process, one bounded request queue, and one reader task; a periodic
//! health pass restarts crashed or silent servers behind an exponential
//! backoff gate, and an LRU policy keeps the pool under a global cap.
//!
//! ## Transport and lifecycle
//! - Children are spawned with piped stdio and `kill_on_drop`; messages use
//!   strict `Content-Length` framing over stdin/stdout. A reader task
//!   demuxes replies from server-initiated traffic; writes are serialized
//!   through the process handle.
//! - Immediately after spawn the supervisor sends `initialize`, records the
//!   server's capabilities, and sends `initialized`; only then is the
//!   process installed in the pool. On teardown it sends `shutdown` then
//!   `exit`, and kills the child if it lingers.
//! - Every externally visible wait takes a [`CancellationToken`]: admission
//!   onto a full queue, the reply wait, and the initialize handshake. A
//!   query resolves with a result, the caller's own cancellation, or a
//!   typed error; it never blocks forever.
//!
//! ## Recovery
//! - The health task checks each process for death, response silence, the
//!   consecutive-failure threshold, and OS liveness (signal 0 on POSIX;
//!   pluggable via [`LivenessProbe`] elsewhere).
//! - Restarts double their delay per attempt up to a cap; the curve
//!   persists across the processes it throttles. [`Supervisor::force_restart`]
//!   bypasses the gate for operator recovery.
//! - When the pool is full, the least recently used server is evicted with
//!   a normal graceful shutdown; the next query respawns it transparently.
//!
//! ## Error model
//! [`Error`] keeps failure origins distinct so callers can tell a missing
//! or throttled backend (`BackendUnavailable`), a warming one
//! (`WorkspaceNotReady`), admission pressure (`RateLimited`), a slow reply
//! (`Timeout`), a server-reported JSON-RPC error (`Lsp`), and a broken pipe
//! (`TransportClosed`) apart.
//!
//! ```rust,no_run
//! use lsp_pool::{ServerDescriptor, Supervisor, SupervisorConfig};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SupervisorConfig::new("/path/to/workspace")
//!     .server("rust", ServerDescriptor::new("rust-analyzer"));
//! let supervisor = Supervisor::new(config)?;
//!
//! let definition = supervisor
//!     .goto_definition(
//!         "rust",
//!         "file:///path/to/workspace/src/main.rs",
//!         12,
//!         4,
//!         CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{definition}");
//! supervisor.shutdown().await;
//! # Ok(()) }
//! ```
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

mod config;
mod error;
mod eviction;
mod framing;
mod health;
mod process;
pub mod protocol;
mod queue;
mod supervisor;

pub use config::{
    ServerDescriptor, SupervisorConfig, DEFAULT_BASE_BACKOFF, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_MAX_BACKOFF, DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_MAX_QUEUE_WAIT,
    DEFAULT_MAX_TOTAL_PROCESSES, DEFAULT_QUEUE_SIZE_PER_LANGUAGE, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_RESPONSE_TIMEOUT,
};
pub use error::Error;
pub use health::{LivenessProbe, SignalProbe};
pub use process::ProcessState;
pub use supervisor::{LanguageHealth, Supervisor};

#[cfg(test)]
mod tests;
