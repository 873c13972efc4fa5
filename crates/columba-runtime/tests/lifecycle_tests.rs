//! Service lifecycle through the non-blocking call boundary

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use columba_core::{
    ColumbaError, ColumbaResult, LifecycleError, PollConfig, ProcessStatus, RelaySelectionConfig,
    ServiceConfig,
};
use columba_harness::{
    fixtures, CountingResourceProvider, InMemoryRelayStore, MockEngineFactory, MockEngineScript,
};
use columba_runtime::{AppEvent, CompletionCallback, MeshService, ServiceBuilder};
use tokio::{sync::oneshot, time::sleep};

struct ServiceFixture {
    service: MeshService,
    factory: Arc<MockEngineFactory>,
    store: Arc<InMemoryRelayStore>,
    resources: Arc<CountingResourceProvider>,
}

fn fixture(script: MockEngineScript) -> ServiceFixture {
    let factory = Arc::new(MockEngineFactory::with_script(script));
    let store = Arc::new(InMemoryRelayStore::new());
    let resources = Arc::new(CountingResourceProvider::new());
    let service = ServiceBuilder::new(factory.clone(), store.clone())
        .with_resources(resources.clone())
        .with_poll_config(PollConfig::testing())
        .with_relay_config(RelaySelectionConfig::testing())
        .build()
        .unwrap();
    ServiceFixture {
        service,
        factory,
        store,
        resources,
    }
}

fn completion() -> (CompletionCallback, oneshot::Receiver<ColumbaResult<()>>) {
    let (tx, rx) = oneshot::channel();
    let callback: CompletionCallback = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (callback, rx)
}

/// Callback that must never run
fn counting_completion(calls: Arc<AtomicUsize>) -> CompletionCallback {
    Box::new(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
    })
}

async fn wait_for_status(service: &MeshService, expected: ProcessStatus) {
    let mut status = service.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(30),
        status.wait_for(|status| *status == expected),
    )
    .await
    .expect("status never reached")
    .unwrap();
}

async fn ready(f: &ServiceFixture) {
    let (callback, done) = completion();
    f.service.initialize(ServiceConfig::testing(), callback);
    done.await.unwrap().unwrap();
    assert_eq!(f.service.status(), ProcessStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_reaches_ready() {
    let f = fixture(MockEngineScript::instant());
    let mut events = f.service.subscribe_events();

    let (callback, done) = completion();
    let generation = f.service.initialize(ServiceConfig::testing(), callback);
    assert_eq!(generation, 1);
    done.await.unwrap().unwrap();

    assert_eq!(f.service.status_tag(), "READY");
    assert_eq!(f.factory.start_count(), 1);
    assert_eq!(f.resources.held(), 2);
    assert_eq!(f.service.lifecycle().held_leases(), 2);

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let AppEvent::StatusChanged { status } = event {
            statuses.push(status);
        }
    }
    assert_eq!(statuses, vec![ProcessStatus::Initializing, ProcessStatus::Ready]);

    // Session tasks are running
    sleep(Duration::from_millis(200)).await;
    assert!(f.factory.latest().unwrap().poll_count() > 0);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_callback_fires_once() {
    let f = fixture(MockEngineScript::slow_start(Duration::from_millis(500)));
    let early = Arc::new(AtomicUsize::new(0));
    let late = Arc::new(AtomicUsize::new(0));

    let counter = early.clone();
    f.service.register_readiness_callback(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let (callback, done) = completion();
    f.service.initialize(ServiceConfig::testing(), callback);
    assert_eq!(early.load(Ordering::SeqCst), 0);
    done.await.unwrap().unwrap();
    assert_eq!(early.load(Ordering::SeqCst), 1);

    // Registering while already ready fires immediately
    let counter = late.clone();
    f.service.register_readiness_callback(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(late.load(Ordering::SeqCst), 1);

    // A later ready transition does not fire either callback again
    f.service.shutdown();
    wait_for_status(&f.service, ProcessStatus::Shutdown).await;
    ready(&f).await;
    assert_eq!(early.load(Ordering::SeqCst), 1);
    assert_eq!(late.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_partial_initialization_releases_everything() {
    let f = fixture(MockEngineScript::instant());
    f.resources.fail_on("wake_lock");

    let (callback, done) = completion();
    f.service.initialize(ServiceConfig::testing(), callback);
    let result = done.await.unwrap();

    assert!(matches!(result, Err(ColumbaError::Resource { .. })));
    assert!(f.service.status().is_error());
    assert!(f.service.status_tag().starts_with("ERROR:"));
    assert_eq!(f.resources.acquired(), 1);
    assert_eq!(f.resources.held(), 0);
    assert!(!f.service.lifecycle().has_engine());
    assert!(f.factory.latest().unwrap().is_shut_down());

    // Recovers once the resource is available again
    f.resources.clear_failures();
    ready(&f).await;
    assert_eq!(f.resources.held(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_engine_start_failure_reports_error_tag() {
    let f = fixture(MockEngineScript::failing_start("no usable interface"));

    let (callback, done) = completion();
    f.service.initialize(ServiceConfig::testing(), callback);
    assert!(done.await.unwrap().is_err());

    let tag = f.service.status_tag();
    assert!(tag.starts_with("ERROR:"), "unexpected tag {}", tag);
    assert!(tag.contains("no usable interface"));
    assert_eq!(tag.parse::<ProcessStatus>().unwrap(), f.service.status());
    assert_eq!(f.resources.held(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_startup_timeout_is_an_error() {
    let f = fixture(MockEngineScript::slow_start(Duration::from_secs(10)));

    let (callback, done) = completion();
    f.service.initialize(ServiceConfig::testing(), callback);
    let result = done.await.unwrap();

    assert!(result.is_err());
    assert!(f.service.status_tag().contains("timed out"));
    assert!(f.factory.engines().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_refuses_engine_calls() {
    let f = fixture(MockEngineScript::instant());
    ready(&f).await;
    let engine = f.factory.latest().unwrap();

    f.service.shutdown();
    assert_eq!(f.service.status(), ProcessStatus::Restarting);
    assert!(f.service.lifecycle().is_shutdown_started());
    assert!(f
        .service
        .send_message(fixtures::destination(1), "too late")
        .await
        .is_err());

    wait_for_status(&f.service, ProcessStatus::Shutdown).await;
    assert!(engine.is_shut_down());
    assert_eq!(f.resources.held(), 0);

    // Pollers and timers are gone; nothing reaches the dead engine
    sleep(Duration::from_secs(60)).await;
    assert_eq!(engine.calls_after_shutdown(), 0);
    assert_eq!(f.service.status(), ProcessStatus::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_when_already_shut_down_is_noop() {
    let f = fixture(MockEngineScript::instant());
    f.service.shutdown();
    assert_eq!(f.service.status(), ProcessStatus::Shutdown);
    assert!(!f.service.lifecycle().is_shutdown_started());
}

#[tokio::test(start_paused = true)]
async fn test_late_teardown_does_not_clobber_newer_generation() {
    let f = fixture(MockEngineScript {
        shutdown_delay: Duration::from_millis(500),
        ..MockEngineScript::default()
    });
    ready(&f).await;
    let first = f.factory.latest().unwrap();

    f.service.shutdown();
    let (callback, done) = completion();
    let generation = f.service.initialize(ServiceConfig::testing(), callback);
    assert_eq!(generation, 2);
    done.await.unwrap().unwrap();

    // The second engine only started after the first finished tearing down
    assert!(first.is_shut_down());
    assert_eq!(f.factory.engines().len(), 2);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(f.service.status(), ProcessStatus::Ready);
    assert_eq!(f.service.generation(), 2);
    assert_eq!(first.calls_after_shutdown(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_initialize_never_completes() {
    let f = fixture(MockEngineScript::slow_start(Duration::from_millis(300)));
    let stale_calls = Arc::new(AtomicUsize::new(0));

    f.service.initialize(
        ServiceConfig::testing(),
        counting_completion(stale_calls.clone()),
    );
    sleep(Duration::from_millis(100)).await;
    let (callback, done) = completion();
    f.service.initialize(ServiceConfig::testing(), callback);
    done.await.unwrap().unwrap();

    sleep(Duration::from_secs(2)).await;
    assert_eq!(stale_calls.load(Ordering::SeqCst), 0);
    assert_eq!(f.service.status(), ProcessStatus::Ready);
    assert_eq!(f.service.generation(), 2);
    // Only the surviving attempt installed an engine
    assert_eq!(f.factory.engines().len(), 1);
    assert_eq!(f.resources.held(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_startup_cancels_attempt() {
    let f = fixture(MockEngineScript::slow_start(Duration::from_secs(1)));

    let (callback, done) = completion();
    f.service.initialize(ServiceConfig::testing(), callback);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(f.service.status(), ProcessStatus::Initializing);

    f.service.shutdown();
    let result = done.await.unwrap();
    assert!(matches!(
        result,
        Err(ColumbaError::Lifecycle(LifecycleError::Cancelled))
    ));

    wait_for_status(&f.service, ProcessStatus::Shutdown).await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(f.service.status(), ProcessStatus::Shutdown);
    assert!(!f.service.lifecycle().has_engine());
    assert_eq!(f.resources.held(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_targets_newest_initialize() {
    let f = fixture(MockEngineScript::instant());
    ready(&f).await;

    let (callback, done) = completion();
    let generation = f.service.initialize(ServiceConfig::testing(), callback);
    f.service.shutdown();
    assert_eq!(f.service.status(), ProcessStatus::Restarting);

    let result = done.await.unwrap();
    assert!(matches!(
        result,
        Err(ColumbaError::Lifecycle(LifecycleError::Cancelled))
    ));
    wait_for_status(&f.service, ProcessStatus::Shutdown).await;
    assert_eq!(f.service.generation(), generation);
    assert!(!f.service.lifecycle().has_engine());
    assert_eq!(f.resources.held(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_shutdown_and_initialize_settle_consistently() {
    let f = fixture(MockEngineScript::instant());

    for round in 0..50 {
        ready(&f).await;

        let (callback, done) = completion();
        let start = Arc::new(std::sync::Barrier::new(2));
        let initializer = std::thread::spawn({
            let service = f.service.clone();
            let start = start.clone();
            move || {
                start.wait();
                service.initialize(ServiceConfig::testing(), callback);
            }
        });
        let stopper = std::thread::spawn({
            let service = f.service.clone();
            let start = start.clone();
            move || {
                start.wait();
                service.shutdown();
            }
        });
        initializer.join().unwrap();
        stopper.join().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .expect("initialize never answered")
            .unwrap();
        assert!(
            matches!(
                result,
                Ok(()) | Err(ColumbaError::Lifecycle(LifecycleError::Cancelled))
            ),
            "round {}: {:?}",
            round,
            result
        );

        // Whichever call won, the status ends up agreeing with the engine slot
        let mut settled = None;
        for _ in 0..400 {
            let status = f.service.status();
            if matches!(status, ProcessStatus::Ready | ProcessStatus::Shutdown) {
                settled = Some(status);
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        match settled {
            Some(ProcessStatus::Ready) => {
                assert!(f.service.lifecycle().is_engine_call_safe(), "round {}", round)
            }
            Some(_) => assert!(!f.service.lifecycle().has_engine(), "round {}", round),
            None => panic!("round {}: status stuck at {}", round, f.service.status()),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_force_restart_replaces_engine() {
    let f = fixture(MockEngineScript::instant());

    let (callback, _done) = completion();
    assert!(f.service.force_restart(callback).is_err());

    ready(&f).await;
    let first = f.factory.latest().unwrap();

    let (callback, done) = completion();
    let generation = f.service.force_restart(callback).unwrap();
    assert_eq!(generation, 2);
    done.await.unwrap().unwrap();

    assert!(first.is_shut_down());
    assert_eq!(f.factory.engines().len(), 2);
    assert_eq!(f.service.status(), ProcessStatus::Ready);
    assert_eq!(f.resources.held(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_engine_calls_require_ready() {
    let f = fixture(MockEngineScript::slow_start(Duration::from_millis(500)));
    assert!(f
        .service
        .send_message(fixtures::destination(4), "hello")
        .await
        .is_err());

    let (callback, done) = completion();
    f.service.initialize(ServiceConfig::testing(), callback);
    sleep(Duration::from_millis(100)).await;
    assert!(f.service.identity().await.is_err());
    done.await.unwrap().unwrap();

    let receipt = f
        .service
        .send_message(fixtures::destination(4), "hello")
        .await
        .unwrap();
    assert_eq!(receipt.destination, fixtures::destination(4));
    assert_eq!(
        f.factory.latest().unwrap().sent_messages(),
        vec![(fixtures::destination(4), "hello".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_polled_relay_announce_gets_selected() {
    let f = fixture(MockEngineScript::instant());
    ready(&f).await;
    let engine = f.factory.latest().unwrap();

    engine.queue_announce(fixtures::peer_announce(2));
    engine.queue_announce(fixtures::propagation_announce(3, 1));
    sleep(Duration::from_millis(500)).await;

    assert_eq!(f.store.candidates().len(), 1);
    assert_eq!(engine.relay_calls(), vec![Some(fixtures::destination(3))]);
    assert_eq!(
        f.store.current_selection().map(|relay| relay.destination_id),
        Some(fixtures::destination(3))
    );
}

#[tokio::test(start_paused = true)]
async fn test_selected_relay_restored_on_start() {
    let f = fixture(MockEngineScript::instant());
    f.service
        .set_manual_relay(fixtures::destination(6), "relay-6")
        .await
        .unwrap();

    ready(&f).await;
    assert_eq!(
        f.factory.latest().unwrap().relay_calls(),
        vec![Some(fixtures::destination(6))]
    );
    assert!(!f.service.relay().auto_select());
}

#[tokio::test(start_paused = true)]
async fn test_conversation_flag_survives_restart() {
    let f = fixture(MockEngineScript::instant());
    f.service.set_conversation_active(true);
    ready(&f).await;

    assert!(f.service.poller().controller().is_active());
    f.service.shutdown();
    wait_for_status(&f.service, ProcessStatus::Shutdown).await;
    ready(&f).await;
    assert!(f.service.poller().controller().is_active());
}
