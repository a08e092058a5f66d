use super::*;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{process::ServerProcess, queue::Dispatcher};

#[cfg(unix)]
async fn slow_process(delay_secs: f64) -> (tempfile::TempDir, tempfile::TempDir, Arc<ServerProcess>) {
    let (script_dir, script) = write_fake_server();
    let workspace = tempfile::tempdir().expect("workspace");
    let descriptor = fake_descriptor_with_delay(&script, "slow", delay_secs);
    let process = ServerProcess::spawn("ts", &descriptor, workspace.path(), Duration::from_secs(10), 0)
        .await
        .expect("spawn");
    (script_dir, workspace, process)
}

#[cfg(unix)]
#[tokio::test]
async fn full_queues_rate_limit_after_the_admission_wait() {
    let (_scripts, _ws, process) = slow_process(1.0).await;
    let dispatcher = Dispatcher::start("ts".into(), process.clone(), 2, Duration::from_millis(50));

    let mut admitted = Vec::new();
    let mut rejected = 0;
    for n in 0..5 {
        match dispatcher
            .enqueue("textDocument/definition", json!({ "n": n }), CancellationToken::new())
            .await
        {
            Ok(rx) => admitted.push(rx),
            Err(Error::RateLimited { language }) => {
                assert_eq!(language, "ts");
                rejected += 1;
            }
            Err(other) => panic!("unexpected admission failure: {other}"),
        }
    }

    assert!(rejected >= 1, "expected at least one RateLimited caller");
    assert!(admitted.len() >= 3, "in-flight plus queued should be admitted");
    assert!(dispatcher.reject_fast(), "a saturated queue should shed load");

    dispatcher.close();
    process.shutdown().await;
    dispatcher.join().await;
}

#[cfg(unix)]
#[tokio::test]
async fn cancelled_tickets_are_skipped_by_the_worker() {
    let (_scripts, _ws, process) = slow_process(0.5).await;
    let dispatcher = Dispatcher::start("ts".into(), process.clone(), 4, Duration::from_millis(100));

    let _in_flight = dispatcher
        .enqueue("textDocument/definition", json!({}), CancellationToken::new())
        .await
        .expect("first ticket admitted");

    let cancel = CancellationToken::new();
    let queued = dispatcher
        .enqueue("textDocument/definition", json!({}), cancel.clone())
        .await
        .expect("second ticket admitted");
    cancel.cancel();

    let outcome = queued.await.expect("worker delivers an outcome");
    assert!(matches!(outcome, Err(Error::Cancelled)));

    dispatcher.close();
    process.shutdown().await;
    dispatcher.join().await;
}

#[cfg(unix)]
#[tokio::test]
async fn draining_releases_queued_tickets_with_backend_unavailable() {
    let (_scripts, _ws, process) = slow_process(1.0).await;
    let dispatcher = Dispatcher::start("ts".into(), process.clone(), 4, Duration::from_millis(100));

    let in_flight = dispatcher
        .enqueue("textDocument/definition", json!({}), CancellationToken::new())
        .await
        .expect("first ticket admitted");
    // Give the worker a beat to pop the first ticket into flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let queued = dispatcher
        .enqueue("textDocument/definition", json!({}), CancellationToken::new())
        .await
        .expect("second ticket admitted");

    dispatcher.close();
    process.shutdown().await;
    dispatcher.join().await;

    // The graceful shutdown handshake waits out the slow reply, so the
    // in-flight ticket completes; only the queued one is drained.
    let in_flight_outcome = in_flight.await.expect("in-flight outcome delivered");
    assert!(matches!(in_flight_outcome, Ok(_) | Err(Error::Shutdown)));
    let queued_outcome = queued.await.expect("queued outcome delivered");
    assert!(matches!(queued_outcome, Err(Error::BackendUnavailable { .. })));
}

#[cfg(unix)]
#[tokio::test]
async fn admission_waits_honor_cancellation() {
    let (_scripts, _ws, process) = slow_process(1.0).await;
    let dispatcher = Dispatcher::start("ts".into(), process.clone(), 1, Duration::from_secs(5));

    let _in_flight = dispatcher
        .enqueue("textDocument/definition", json!({}), CancellationToken::new())
        .await
        .expect("first ticket admitted");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _buffered = dispatcher
        .enqueue("textDocument/definition", json!({}), CancellationToken::new())
        .await
        .expect("second ticket fills the queue");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = dispatcher
        .enqueue("textDocument/definition", json!({}), cancel)
        .await
        .expect_err("cancelled before a slot opened");
    assert!(matches!(err, Error::Cancelled));

    dispatcher.close();
    process.shutdown().await;
    dispatcher.join().await;
}

#[cfg(unix)]
#[tokio::test]
async fn closed_queues_refuse_new_tickets() {
    let (_scripts, _ws, process) = slow_process(0.1).await;
    let dispatcher = Dispatcher::start("ts".into(), process.clone(), 2, Duration::from_millis(50));

    dispatcher.close();
    process.shutdown().await;
    dispatcher.join().await;

    let err = dispatcher
        .enqueue("textDocument/definition", json!({}), CancellationToken::new())
        .await
        .expect_err("queue is closed");
    assert!(matches!(err, Error::BackendUnavailable { .. }));
}
