//! Lifecycle and retry behavior driven through the public API against a
//! scripted connector.  Time is paused, so multi-second retry delays run
//! instantly and deterministically.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cs_client_sdk::{
    create_instance, supervise, ClientBuilder, ClientError, ClientEvent, ClientInstance,
    Connector, ConnectorError, Phase, RetryBackoff, RetryDisposition, RetryPolicy, SupervisorExit,
    Trigger,
};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ── Scripted connector ──────────────────────────────────────────────────

#[derive(Default)]
struct FakeConnector {
    opens: AtomicUsize,
    closes: AtomicUsize,
    /// Fail this many opens before succeeding.
    failing_opens: AtomicUsize,
    always_fail_open: AtomicBool,
    open_delay: Mutex<Duration>,
    open_times: Mutex<Vec<Instant>>,
}

impl FakeConnector {
    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for FakeConnector {
    async fn open(&self) -> Result<(), ConnectorError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_times.lock().push(Instant::now());

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.always_fail_open.load(Ordering::SeqCst) {
            return Err(ConnectorError::Unreachable("gateway down".into()));
        }
        let remaining = self.failing_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectorError::Rejected("try later".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

fn client_with(connector: Arc<FakeConnector>) -> ClientInstance {
    client_with_policy(connector, RetryPolicy::Replace)
}

fn client_with_policy(connector: Arc<FakeConnector>, policy: RetryPolicy) -> ClientInstance {
    ClientBuilder::new()
        .dev_key("dk-lifecycle-test")
        .dev_sn("sn-lifecycle-test")
        .retry_policy(policy)
        .connector(connector)
        .build()
        .unwrap()
}

async fn wait_for_phase(client: &ClientInstance, phase: Phase) {
    let mut rx = client.subscribe_phase();
    tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|p| *p == phase))
        .await
        .expect("phase never reached")
        .unwrap();
}

// ── Start / stop / restart ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn repeated_start_opens_once() {
    let connector = Arc::new(FakeConnector::default());
    let client = client_with(connector.clone());

    client.start().await.unwrap();
    client.start().await.unwrap();
    client.start().await.unwrap();

    assert!(client.is_running());
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn running_tracks_last_successful_transition() {
    let connector = Arc::new(FakeConnector::default());
    let client = client_with(connector.clone());

    client.start().await.unwrap();
    assert!(client.is_running());
    client.stop().await.unwrap();
    assert!(!client.is_running());
    client.restart().await.unwrap();
    assert!(client.is_running());
    client.restart().await.unwrap();
    assert!(client.is_running());
    client.stop().await.unwrap();
    assert!(!client.is_running());

    assert_eq!(connector.opens(), 3);
    assert_eq!(connector.closes(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_open_reports_and_stays_stopped() {
    let connector = Arc::new(FakeConnector::default());
    connector.always_fail_open.store(true, Ordering::SeqCst);
    let client = client_with(connector.clone());
    let mut events = client.subscribe_events();

    let err = client.start().await.unwrap_err();
    assert_eq!(
        err.connector_error(),
        Some(&ConnectorError::Unreachable("gateway down".into()))
    );
    assert!(!client.is_running());
    assert_eq!(client.phase(), Phase::Stopped);

    match events.try_recv() {
        Ok(ClientEvent::StartFailed { trigger, .. }) => assert_eq!(trigger, Trigger::Start),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_share_one_open() {
    let connector = Arc::new(FakeConnector::default());
    *connector.open_delay.lock() = Duration::from_secs(2);
    let client = client_with(connector.clone());

    let first = client.spawn_start();
    wait_for_phase(&client, Phase::Starting).await;
    let second = client.spawn_start();

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert!(client.is_running());
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_during_slow_open_wins() {
    let connector = Arc::new(FakeConnector::default());
    *connector.open_delay.lock() = Duration::from_secs(5);
    let client = client_with(connector.clone());

    let starting = client.spawn_start();
    wait_for_phase(&client, Phase::Starting).await;

    client.stop().await.unwrap();
    assert!(!client.is_running());
    assert_eq!(client.phase(), Phase::Stopped);

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(ClientError::Interrupted)));
    assert_eq!(connector.opens(), 1);
    assert_eq!(connector.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn joined_start_reports_connector_error() {
    let connector = Arc::new(FakeConnector::default());
    connector.failing_opens.store(1, Ordering::SeqCst);
    *connector.open_delay.lock() = Duration::from_secs(2);
    let client = client_with(connector.clone());

    let first = client.spawn_start();
    wait_for_phase(&client, Phase::Starting).await;
    let second = client.spawn_start();

    let expected = ConnectorError::Rejected("try later".into());
    for result in [first.await.unwrap(), second.await.unwrap()] {
        match result {
            Err(ClientError::Open(e)) => assert_eq!(e, expected),
            other => panic!("unexpected result: {other:?}"),
        }
    }
    assert_eq!(connector.opens(), 1);
}

// ── Retry ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_retry() {
    let connector = Arc::new(FakeConnector::default());
    let client = client_with(connector.clone());

    assert_eq!(client.retry_with_seconds(5).unwrap(), RetryDisposition::Armed);
    tokio::time::sleep(Duration::from_secs(1)).await;
    client.stop().await.unwrap();
    assert!(!client.retry_pending());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.opens(), 0);
    assert!(!client.is_running());
}

#[tokio::test(start_paused = true)]
async fn second_retry_replaces_first() {
    let connector = Arc::new(FakeConnector::default());
    let client = client_with(connector.clone());
    let t0 = Instant::now();

    assert_eq!(client.retry_with_seconds(5).unwrap(), RetryDisposition::Armed);
    assert_eq!(
        client.retry_with_seconds(3).unwrap(),
        RetryDisposition::Replaced
    );
    assert!(client.retry_pending());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(client.is_running());
    assert!(!client.retry_pending());

    let times = connector.open_times.lock().clone();
    assert_eq!(times.len(), 1);
    let fired_after = times[0] - t0;
    assert!(fired_after >= Duration::from_secs(3));
    assert!(fired_after < Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn zero_second_retry_overtakes_pending_positive_retry() {
    let connector = Arc::new(FakeConnector::default());
    let client = client_with(connector.clone());
    let t0 = Instant::now();

    assert_eq!(client.retry_with_seconds(5).unwrap(), RetryDisposition::Armed);
    assert_eq!(
        client.retry_with_seconds(0).unwrap(),
        RetryDisposition::Replaced
    );
    wait_for_phase(&client, Phase::Running).await;
    assert!(Instant::now() - t0 < Duration::from_secs(5));

    // The 5s retry was superseded and never opens a second session.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let times = connector.open_times.lock().clone();
    assert_eq!(times.len(), 1);
    assert!(times[0] - t0 < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn keep_pending_zero_second_retry_beats_later_positive_one() {
    let connector = Arc::new(FakeConnector::default());
    let client = client_with_policy(connector.clone(), RetryPolicy::KeepPending);
    let t0 = Instant::now();

    assert_eq!(client.retry_with_seconds(0).unwrap(), RetryDisposition::Armed);
    assert_eq!(
        client.retry_with_seconds(3).unwrap(),
        RetryDisposition::KeptPending
    );
    wait_for_phase(&client, Phase::Running).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    let times = connector.open_times.lock().clone();
    assert_eq!(times.len(), 1);
    assert!(times[0] - t0 < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn retry_due_during_failing_start_fires_after_it() {
    let connector = Arc::new(FakeConnector::default());
    connector.failing_opens.store(1, Ordering::SeqCst);
    *connector.open_delay.lock() = Duration::from_secs(5);
    let client = client_with(connector.clone());
    let mut events = client.subscribe_events();

    let starting = client.spawn_start();
    wait_for_phase(&client, Phase::Starting).await;
    assert_eq!(client.retry_with_seconds(1).unwrap(), RetryDisposition::Armed);

    assert!(matches!(starting.await.unwrap(), Err(ClientError::Open(_))));
    wait_for_phase(&client, Phase::Running).await;
    assert_eq!(connector.opens(), 2);

    let mut started_by_retry = false;
    while let Ok(ev) = events.try_recv() {
        if let ClientEvent::Started { trigger } = ev {
            started_by_retry = trigger == Trigger::Retry;
        }
    }
    assert!(started_by_retry);
}

#[tokio::test(start_paused = true)]
async fn retry_due_during_successful_start_is_cancelled() {
    let connector = Arc::new(FakeConnector::default());
    *connector.open_delay.lock() = Duration::from_secs(5);
    let client = client_with(connector.clone());

    let starting = client.spawn_start();
    wait_for_phase(&client, Phase::Starting).await;
    client.retry_with_seconds(1).unwrap();

    starting.await.unwrap().unwrap();
    assert!(!client.retry_pending());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.opens(), 1);
    assert!(client.is_running());
}

#[tokio::test(start_paused = true)]
async fn zero_second_retry_fires_without_delay() {
    let connector = Arc::new(FakeConnector::default());
    let client = client_with(connector.clone());
    let t0 = Instant::now();

    client.retry_with_seconds(0).unwrap();
    wait_for_phase(&client, Phase::Running).await;

    let times = connector.open_times.lock().clone();
    assert_eq!(times.len(), 1);
    assert!(times[0] - t0 < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn failed_retry_is_reported_as_event() {
    let connector = Arc::new(FakeConnector::default());
    connector.always_fail_open.store(true, Ordering::SeqCst);
    let client = client_with(connector.clone());
    let mut events = client.subscribe_events();

    client.retry_with_seconds(2).unwrap();
    loop {
        match events.recv().await.unwrap() {
            ClientEvent::StartFailed { trigger, .. } => {
                assert_eq!(trigger, Trigger::Retry);
                break;
            }
            ClientEvent::RetryArmed { delay, replaced } => {
                assert_eq!(delay, Duration::from_secs(2));
                assert!(!replaced);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(!client.is_running());
    assert!(!client.retry_pending());
}

// ── Supervisor ──────────────────────────────────────────────────────────

fn fast_backoff(max_attempts: u32) -> RetryBackoff {
    RetryBackoff {
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(4),
        backoff_factor: 2.0,
        max_attempts,
    }
}

#[tokio::test(start_paused = true)]
async fn supervisor_retries_until_running() {
    let connector = Arc::new(FakeConnector::default());
    connector.failing_opens.store(2, Ordering::SeqCst);
    let client = client_with(connector.clone());
    let shutdown = CancellationToken::new();
    let supervisor = supervise(client.clone(), fast_backoff(0), shutdown.clone());

    assert!(client.start().await.is_err());
    wait_for_phase(&client, Phase::Running).await;
    assert_eq!(connector.opens(), 3);

    shutdown.cancel();
    assert_eq!(supervisor.await.unwrap(), SupervisorExit::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn supervisor_gives_up_after_max_attempts() {
    let connector = Arc::new(FakeConnector::default());
    connector.always_fail_open.store(true, Ordering::SeqCst);
    let client = client_with(connector.clone());
    let supervisor = supervise(client.clone(), fast_backoff(2), CancellationToken::new());

    assert!(client.start().await.is_err());
    assert_eq!(supervisor.await.unwrap(), SupervisorExit::Exhausted(2));
    assert_eq!(connector.opens(), 3);
    assert!(!client.is_running());
}

#[tokio::test(start_paused = true)]
async fn supervisor_exits_on_explicit_stop() {
    let connector = Arc::new(FakeConnector::default());
    let client = client_with(connector.clone());
    let supervisor = supervise(client.clone(), fast_backoff(0), CancellationToken::new());

    client.start().await.unwrap();
    client.stop().await.unwrap();
    assert_eq!(supervisor.await.unwrap(), SupervisorExit::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stop_during_failing_open_is_not_undone_by_supervisor() {
    let connector = Arc::new(FakeConnector::default());
    connector.failing_opens.store(1, Ordering::SeqCst);
    *connector.open_delay.lock() = Duration::from_secs(5);
    let client = client_with(connector.clone());
    let supervisor = supervise(client.clone(), fast_backoff(0), CancellationToken::new());

    let starting = client.spawn_start();
    wait_for_phase(&client, Phase::Starting).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    client.stop().await.unwrap();

    assert!(matches!(starting.await.unwrap(), Err(ClientError::Open(_))));
    assert_eq!(supervisor.await.unwrap(), SupervisorExit::Stopped);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.opens(), 1);
    assert!(!client.is_running());
    assert!(!client.retry_pending());
}

#[tokio::test(start_paused = true)]
async fn stop_after_failed_start_is_not_undone_by_supervisor() {
    let connector = Arc::new(FakeConnector::default());
    connector.always_fail_open.store(true, Ordering::SeqCst);
    let client = client_with(connector.clone());
    let supervisor = supervise(client.clone(), fast_backoff(0), CancellationToken::new());

    assert!(client.start().await.is_err());
    // Stop lands before the supervisor has handled the failure.
    client.stop().await.unwrap();

    assert_eq!(supervisor.await.unwrap(), SupervisorExit::Stopped);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.opens(), 1);
    assert!(!client.retry_pending());
}

#[tokio::test(start_paused = true)]
async fn caller_retry_after_stop_is_honored() {
    let connector = Arc::new(FakeConnector::default());
    let client = client_with(connector.clone());

    client.stop().await.unwrap();
    assert_eq!(client.retry_with_seconds(2).unwrap(), RetryDisposition::Armed);
    wait_for_phase(&client, Phase::Running).await;
    assert_eq!(connector.opens(), 1);
}

// ── Process registry ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn create_instance_twice_returns_same_client() {
    let connector = Arc::new(FakeConnector::default());
    let a = create_instance(Some("dk-registry-test"), connector.clone()).unwrap();
    let b = create_instance(Some("dk-registry-test"), Arc::new(FakeConnector::default())).unwrap();
    assert!(a.same_instance(&b));

    a.start().await.unwrap();
    assert!(b.is_running());
    b.stop().await.unwrap();
    assert!(!a.is_running());
    assert_eq!(connector.opens(), 1);

    // A nil key defers to the registered client.
    let c = create_instance(None, Arc::new(FakeConnector::default())).unwrap();
    assert!(c.same_instance(&a));

    let err = create_instance(Some("dk-someone-else"), connector).unwrap_err();
    assert!(matches!(err, ClientError::ConflictingDevKey { .. }));
}
