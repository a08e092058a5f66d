//! Periodic health evaluation and gate-checked restarts.
//!
//! A single task wakes every `health_check_interval` and inspects every
//! pooled process: dead state, response silence, the consecutive-failure
//! threshold, and an OS liveness probe. Anything that has left `Ready` is
//! restarted through the per-language backoff gate, so a crash-looping
//! server costs an exponentially growing delay instead of a spawn storm.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time};
use tracing::{debug, info, warn};

use crate::{
    process::{ProcessState, ServerProcess},
    supervisor::{self, Shared},
    Error,
};

/// Abstract OS-level liveness check so non-POSIX hosts can supply their
/// own probe.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// POSIX probe: signal 0 reports whether the pid can be addressed at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalProbe;

#[cfg(unix)]
impl LivenessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            // Still running, just not ours to signal.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

#[cfg(not(unix))]
impl LivenessProbe for SignalProbe {
    fn is_alive(&self, _pid: u32) -> bool {
        // No portable probe here; hosts should install their own via
        // `Supervisor::with_probe`.
        true
    }
}

/// Per-language restart bookkeeping. Outlives the processes it describes so
/// the backoff curve persists across successive crashes.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RestartGate {
    pub(crate) count: u32,
    pub(crate) not_before: Option<Instant>,
}

/// Delay before restart attempt number `restart_count`:
/// `min(base * 2^(count-1), max)`.
pub(crate) fn backoff_delay(base: Duration, max: Duration, restart_count: u32) -> Duration {
    if restart_count == 0 {
        return Duration::ZERO;
    }
    let exponent = restart_count.saturating_sub(1).min(31);
    let multiplier = 1u32 << exponent;
    base.checked_mul(multiplier).unwrap_or(max).min(max)
}

pub(crate) fn spawn_health_task(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(shared.config.health_check_interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        // The first tick of an interval fires immediately; skip it so a
        // freshly created supervisor does not race its own startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shared.done.cancelled() => break,
                _ = ticker.tick() => {}
            }
            run_health_pass(&shared).await;
        }
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    Healthy,
    Unhealthy,
    Dead,
}

/// One sweep over the pool.
async fn run_health_pass(shared: &Arc<Shared>) {
    let entries: Vec<(String, Arc<ServerProcess>)> = {
        let pool = shared.pool.read().await;
        pool.iter()
            .map(|(language, entry)| (language.clone(), entry.process.clone()))
            .collect()
    };

    for (language, process) in entries {
        let verdict = evaluate(shared, &process);
        match verdict {
            Verdict::Healthy => continue,
            Verdict::Unhealthy => {
                warn!(language, "server marked unhealthy");
                process.mark_unhealthy();
            }
            Verdict::Dead => {
                warn!(language, "server process is gone");
                process.mark_dead();
            }
        }
        if let Err(err) = restart_language(shared, &language, false).await {
            debug!(language, "restart deferred: {err}");
        }
    }
}

fn evaluate(shared: &Shared, process: &ServerProcess) -> Verdict {
    match process.state() {
        ProcessState::Dead => return Verdict::Dead,
        ProcessState::Unhealthy => return Verdict::Unhealthy,
        _ => {}
    }

    if let Some(pid) = process.pid() {
        if !shared.probe.is_alive(pid) {
            return Verdict::Dead;
        }
    }

    if process.consecutive_failures() >= shared.config.max_consecutive_failures {
        return Verdict::Unhealthy;
    }

    let last = process.last_response_at_millis();
    if process.state() == ProcessState::Ready && last > 0 {
        let silence = crate::process::unix_millis().saturating_sub(last);
        if silence > shared.config.response_timeout.as_millis() as u64 {
            return Verdict::Unhealthy;
        }
    }

    Verdict::Healthy
}

/// Tears down and respawns the server for `language`, subject to the
/// backoff gate. `force` bypasses the gate for operator-initiated recovery;
/// every attempt (forced or not) advances the curve.
pub(crate) async fn restart_language(
    shared: &Arc<Shared>,
    language: &str,
    force: bool,
) -> Result<(), Error> {
    let restart_count = {
        let mut gates = shared.gates.lock().await;
        let gate = gates.entry(language.to_string()).or_default();
        if !force {
            if let Some(not_before) = gate.not_before {
                let now = Instant::now();
                if not_before > now {
                    return Err(Error::backoff_gated(language, not_before - now));
                }
            }
        }
        gate.count += 1;
        let delay = backoff_delay(
            shared.config.base_backoff,
            shared.config.max_backoff,
            gate.count,
        );
        gate.not_before = Some(Instant::now() + delay);
        gate.count
    };

    info!(language, restart_count, "restarting language server");
    supervisor::remove_and_teardown(shared, language).await;
    supervisor::spawn_and_install(shared, language, restart_count, false).await
}
