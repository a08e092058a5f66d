//! Per-language admission queue and dispatch worker.
//!
//! Each language owns a bounded FIFO of request tickets and a worker that
//! pops them in order and drives [`ServerProcess::send_request`]. The bound
//! converts server slowness into caller-visible back-pressure instead of
//! unbounded buffering: admission waits at most `max_wait` for a free slot
//! and then fails with `RateLimited`.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{process::ServerProcess, Error};

/// One queued request: everything the worker needs to dispatch it and hand
/// the outcome back to the waiting caller.
struct Ticket {
    method: String,
    params: Value,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<Value, Error>>,
    enqueued_at: Instant,
}

/// Bounded FIFO dispatcher for one language.
pub(crate) struct Dispatcher {
    language: String,
    tx: mpsc::Sender<Ticket>,
    capacity: usize,
    max_wait: Duration,
    closed: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn start(
        language: String,
        process: Arc<ServerProcess>,
        capacity: usize,
        max_wait: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let closed = CancellationToken::new();
        let worker = tokio::spawn(worker_loop(
            language.clone(),
            process,
            rx,
            closed.clone(),
        ));
        Self {
            language,
            tx,
            capacity,
            max_wait,
            closed,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Admits a ticket, waiting at most `max_wait` for a free slot. The
    /// returned receiver resolves when the worker delivers an outcome.
    pub(crate) async fn enqueue(
        &self,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<oneshot::Receiver<Result<Value, Error>>, Error> {
        if self.closed.is_cancelled() {
            return Err(Error::backend_unavailable(&self.language, "queue is closed"));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let ticket = Ticket {
            method: method.to_string(),
            params,
            cancel: cancel.clone(),
            reply: reply_tx,
            enqueued_at: Instant::now(),
        };

        let permit = tokio::select! {
            reserved = time::timeout(self.max_wait, self.tx.reserve()) => match reserved {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(Error::backend_unavailable(&self.language, "queue is closed"))
                }
                Err(_) => {
                    return Err(Error::RateLimited {
                        language: self.language.clone(),
                    })
                }
            },
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        permit.send(ticket);
        Ok(reply_rx)
    }

    /// Cheap load-shedding predicate: true once the queue is more than 80 %
    /// full, letting callers bail out before paying the admission wait.
    pub(crate) fn reject_fast(&self) -> bool {
        self.tx.capacity() * 5 < self.capacity
    }

    /// Stops admission and tells the worker to release queued tickets with
    /// `BackendUnavailable` instead of dispatching them.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    /// Waits for the worker to finish releasing tickets. Call after the
    /// process backing this queue has been shut down.
    pub(crate) async fn join(&self) {
        let handle = { self.worker.lock().await.take() };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    language: String,
    process: Arc<ServerProcess>,
    mut rx: mpsc::Receiver<Ticket>,
    closed: CancellationToken,
) {
    loop {
        let ticket = tokio::select! {
            _ = closed.cancelled() => break,
            next = rx.recv() => match next {
                Some(ticket) => ticket,
                None => break,
            },
        };
        dispatch(&language, &process, ticket).await;
    }

    // Release whatever is still buffered; the queue is being torn down.
    rx.close();
    while let Ok(ticket) = rx.try_recv() {
        let _ = ticket
            .reply
            .send(Err(Error::backend_unavailable(&language, "request queue drained")));
    }
}

async fn dispatch(language: &str, process: &ServerProcess, ticket: Ticket) {
    let Ticket {
        method,
        params,
        cancel,
        reply,
        enqueued_at,
    } = ticket;

    if cancel.is_cancelled() {
        let _ = reply.send(Err(Error::Cancelled));
        return;
    }
    if !process.is_ready() {
        let _ = reply.send(Err(Error::backend_unavailable(
            language,
            format!("server is {:?}", process.state()),
        )));
        return;
    }

    debug!(
        language,
        %method,
        queued_ms = enqueued_at.elapsed().as_millis() as u64,
        "dispatching request"
    );

    // Cancellation mid-flight merely detaches the waiter; the pending slot
    // is reclaimed by the reader when the stale reply arrives.
    let outcome = tokio::select! {
        result = process.send_request(&method, params) => result,
        _ = cancel.cancelled() => Err(Error::Cancelled),
    };
    let _ = reply.send(outcome);
}
