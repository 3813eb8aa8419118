//! Race tests for the stream tube client
//!
//! Accept completion and tube invalidation arrive from independent sources.
//! Whatever order they reach the client in, each tube must be reported
//! closed exactly once and must be gone from `tubes()` afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use tube_client_core::test_utils::{init_test_tracing, next_event, MockRegistrar, MockStreamTube};
use tube_client_core::{
    AcceptError, AcceptedEndpoint, AccountRef, StreamTubeClient, TubeClientEvent,
    TubeClientOptions,
};

fn setup() -> (
    Arc<MockRegistrar>,
    StreamTubeClient,
    mpsc::UnboundedReceiver<TubeClientEvent>,
) {
    init_test_tracing();
    let registrar = MockRegistrar::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let client = StreamTubeClient::create(
        registrar.clone(),
        TubeClientOptions::p2p(["x-vnc"]).with_monitor_connections(true),
        tx,
    )
    .unwrap();
    client.set_to_accept_as_tcp(None);
    (registrar, client, rx)
}

async fn settle(client: &StreamTubeClient) {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    client.flush().await.unwrap();
}

fn failure() -> Result<AcceptedEndpoint, AcceptError> {
    Err(AcceptError::new("NotSupported", "no sockets"))
}

#[tokio::test]
async fn test_failure_then_invalidation_closes_once() {
    let (registrar, client, mut rx) = setup();
    let tube = MockStreamTube::incoming("/tube/race1");
    registrar
        .dispatch(AccountRef::new("/acc/1"), tube.clone())
        .await
        .unwrap();
    next_event(&mut rx).await;

    tube.complete_accept(failure());
    match next_event(&mut rx).await {
        TubeClientEvent::TubeClosed { error, .. } => assert_eq!(error, "NotSupported"),
        other => panic!("expected TubeClosed, got {other:?}"),
    }

    tube.invalidate("Cancelled", "late");
    settle(&client).await;
    assert!(rx.try_recv().is_err());
    assert!(client.tubes().is_empty());
}

#[tokio::test]
async fn test_invalidation_then_failure_closes_once() {
    let (registrar, client, mut rx) = setup();
    let tube = MockStreamTube::incoming("/tube/race2");
    registrar
        .dispatch(AccountRef::new("/acc/1"), tube.clone())
        .await
        .unwrap();
    next_event(&mut rx).await;

    tube.invalidate("Cancelled", "peer went away");
    match next_event(&mut rx).await {
        TubeClientEvent::TubeClosed { error, .. } => assert_eq!(error, "Cancelled"),
        other => panic!("expected TubeClosed, got {other:?}"),
    }

    tube.complete_accept(failure());
    settle(&client).await;
    assert!(rx.try_recv().is_err());
    assert!(client.tubes().is_empty());
    assert_eq!(tube.close_requests(), 0);
}

#[tokio::test]
async fn test_reoffer_after_failure_is_tracked_again() {
    let (registrar, client, mut rx) = setup();
    let tube = MockStreamTube::incoming("/tube/race3");
    registrar
        .dispatch(AccountRef::new("/acc/1"), tube.clone())
        .await
        .unwrap();
    next_event(&mut rx).await;

    tube.complete_accept(failure());
    next_event(&mut rx).await;

    registrar
        .dispatch(AccountRef::new("/acc/1"), tube.clone())
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        TubeClientEvent::TubeOffered { .. }
    ));

    settle(&client).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(client.tubes().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failure_and_invalidation() {
    const TUBES: usize = 50;

    let (registrar, client, mut rx) = setup();
    let mut tubes = Vec::with_capacity(TUBES);
    for i in 0..TUBES {
        let tube = MockStreamTube::incoming(format!("/tube/storm{i}"));
        registrar
            .dispatch(AccountRef::new("/acc/1"), tube.clone())
            .await
            .unwrap();
        tubes.push(tube);
    }

    let mut handles = Vec::with_capacity(TUBES * 2);
    for tube in &tubes {
        let failing = Arc::clone(tube);
        handles.push(tokio::spawn(async move {
            failing.complete_accept(failure());
        }));
        let invalidating = Arc::clone(tube);
        handles.push(tokio::spawn(async move {
            invalidating.invalidate("Cancelled", "storm");
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut offered = 0;
    let mut closed: HashMap<String, usize> = HashMap::new();
    while closed.len() < TUBES {
        match next_event(&mut rx).await {
            TubeClientEvent::TubeOffered { .. } => offered += 1,
            TubeClientEvent::TubeClosed { tube, .. } => {
                *closed.entry(tube.id().to_string()).or_default() += 1;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    settle(&client).await;
    while let Ok(event) = rx.try_recv() {
        match event {
            TubeClientEvent::TubeClosed { tube, .. } => {
                *closed.entry(tube.id().to_string()).or_default() += 1;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(offered, TUBES);
    assert!(closed.values().all(|&count| count == 1), "{closed:?}");
    assert!(client.tubes().is_empty());
}
