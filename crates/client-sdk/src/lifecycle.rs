//! Client lifecycle: the running/stopped state machine and the retry timer.
//!
//! # Locking
//!
//! Every transition runs under one `parking_lot::Mutex` per client, but the
//! lock is never held across a connector call.  A transition marks an
//! in-flight phase (`Starting`/`Stopping`) under the lock, calls the
//! connector unlocked, then retakes the lock to commit.  A `stop()` that
//! lands while a call is in flight records a stop request which the commit
//! step honors.  Waiters block on a `watch` channel until the phase settles.
//!
//! # Retry timer
//!
//! A retry is a spawned task sleeping on the runtime timer.  When it wakes
//! it must [`claim`](crate::retry::RetrySlot::claim) the slot under the
//! state lock; cancelling empties the slot under the same lock, so a
//! cancelled timer can never start the client.  A timer that wakes while a
//! transition is in flight leaves the slot armed and fires again once the
//! phase settles: a start that succeeds cancels it, one that fails lets it
//! run.
//!
//! # Stop intent
//!
//! `stop()` marks the client halted until the next `start`, `restart` or
//! caller-armed retry.  Retries re-armed by the supervisor are refused while
//! halted, so a failure that was already in flight cannot undo a stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cs_domain::config::RetryPolicy;
use cs_domain::identity::mask_secret;
use cs_domain::trace::TraceEvent;
use cs_domain::DeviceIdentity;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::connector::Connector;
use crate::retry::{ArmOutcome, RetrySlot};
use crate::types::{
    ClientError, ClientEvent, ClientStatus, ConnectorError, Phase, RetryDisposition, Trigger,
};

/// Handle to a device client.
///
/// Cheap to clone; every clone drives the same underlying client.  Obtain
/// one through [`create_instance`](crate::create_instance) or
/// [`ClientBuilder`](crate::ClientBuilder).
#[derive(Clone)]
pub struct ClientInstance {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<dyn DeviceIdentity>,
    connector: Arc<dyn Connector>,
    retry_policy: RetryPolicy,
    running: AtomicBool,
    state: Mutex<State>,
    phase_tx: watch::Sender<Phase>,
    events: broadcast::Sender<ClientEvent>,
}

struct State {
    phase: Phase,
    /// A stop arrived while a connector call was in flight.
    stop_requested: bool,
    /// `stop()` is the caller's latest intent.
    halted: bool,
    /// Why the most recent start attempt failed, for callers that joined it.
    last_start_error: Option<ConnectorError>,
    retry: RetrySlot,
    last_transition_at: Option<DateTime<Utc>>,
}

impl ClientInstance {
    pub(crate) fn new(
        identity: Arc<dyn DeviceIdentity>,
        connector: Arc<dyn Connector>,
        retry_policy: RetryPolicy,
        event_capacity: usize,
    ) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Stopped);
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                identity,
                connector,
                retry_policy,
                running: AtomicBool::new(false),
                state: Mutex::new(State {
                    phase: Phase::Stopped,
                    stop_requested: false,
                    halted: false,
                    last_start_error: None,
                    retry: RetrySlot::default(),
                    last_transition_at: None,
                }),
                phase_tx,
                events,
            }),
        }
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn dev_key(&self) -> &str {
        self.inner.identity.dev_key()
    }

    pub fn dev_sn(&self) -> &str {
        self.inner.identity.dev_sn()
    }

    // ── Observation ──────────────────────────────────────────────────

    /// Whether the last committed transition left a session open.
    /// Lock-free.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    pub fn retry_pending(&self) -> bool {
        self.inner.state.lock().retry.is_pending()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy
    }

    pub fn status(&self) -> ClientStatus {
        let st = self.inner.state.lock();
        ClientStatus {
            dev_key: mask_secret(self.dev_key()),
            dev_sn: self.dev_sn().to_owned(),
            phase: st.phase,
            running: st.phase == Phase::Running,
            retry_pending: st.retry.is_pending(),
            retry_due_at: st.retry.due_at(),
            last_transition_at: st.last_transition_at,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase_tx.subscribe()
    }

    /// Whether both handles drive the same client.
    pub fn same_instance(&self, other: &ClientInstance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Open a session.  No-op when already running.
    ///
    /// If a start is already in flight this joins it instead of opening a
    /// second session.  When that start does not end in `Running` the
    /// joiner gets its connector error, or [`ClientError::Interrupted`] if a
    /// stop cut it short.
    pub async fn start(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        let mut joined = false;
        loop {
            {
                let mut st = inner.state.lock();
                let phase = st.phase;
                match phase {
                    Phase::Running => {
                        st.halted = false;
                        return Ok(());
                    }
                    Phase::Stopped if joined => {
                        return Err(st
                            .last_start_error
                            .clone()
                            .map_or(ClientError::Interrupted, ClientError::Open));
                    }
                    Phase::Stopped => {
                        st.halted = false;
                        inner.set_phase(&mut st, Phase::Starting, Trigger::Start);
                        break;
                    }
                    // A start that is already being stopped is not one we
                    // can join; wait for it to settle and start afresh.
                    Phase::Starting => joined = !st.stop_requested,
                    Phase::Stopping => {}
                }
            }
            inner.wait_settled().await;
        }
        inner.open_and_commit(Trigger::Start).await
    }

    /// Close the session and cancel any pending retry.  No-op when stopped.
    ///
    /// During an in-flight transition the stop is recorded and this waits
    /// until the client has settled in `Stopped`.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        let wait = {
            let mut st = inner.state.lock();
            st.halted = true;
            inner.cancel_retry(&mut st, "stop");
            let phase = st.phase;
            match phase {
                Phase::Stopped => return Ok(()),
                Phase::Running => {
                    inner.set_phase(&mut st, Phase::Stopping, Trigger::Stop);
                    false
                }
                Phase::Starting | Phase::Stopping => {
                    st.stop_requested = true;
                    true
                }
            }
        };
        if wait {
            inner.wait_settled().await;
            return Ok(());
        }
        inner
            .close_and_commit(Trigger::Stop)
            .await
            .map_err(ClientError::Close)
    }

    /// Stop then start as one operation.
    ///
    /// The phase goes `Stopping → Starting` without settling in `Stopped`.
    /// A failed close does not prevent the open; if both fail the error
    /// carries both.  A close failure followed by a successful open is
    /// still reported as [`ClientError::Close`], with the client running.
    pub async fn restart(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        let needs_close = loop {
            {
                let mut st = inner.state.lock();
                inner.cancel_retry(&mut st, "restart");
                let phase = st.phase;
                match phase {
                    Phase::Running => {
                        st.halted = false;
                        inner.set_phase(&mut st, Phase::Stopping, Trigger::Restart);
                        break true;
                    }
                    Phase::Stopped => {
                        st.halted = false;
                        inner.set_phase(&mut st, Phase::Starting, Trigger::Restart);
                        break false;
                    }
                    Phase::Starting | Phase::Stopping => {}
                }
            }
            inner.wait_settled().await;
        };

        let close_err = if needs_close {
            let closed = inner.connector.close().await;
            let proceed = {
                let mut st = inner.state.lock();
                if let Err(e) = &closed {
                    inner.report_failure("close", Trigger::Restart, e);
                    inner.publish(ClientEvent::StopFailed {
                        trigger: Trigger::Restart,
                        error: e.clone(),
                    });
                }
                if st.stop_requested {
                    st.stop_requested = false;
                    inner.set_phase(&mut st, Phase::Stopped, Trigger::Restart);
                    if closed.is_ok() {
                        inner.publish(ClientEvent::Stopped {
                            trigger: Trigger::Restart,
                        });
                    }
                    false
                } else {
                    inner.set_phase(&mut st, Phase::Starting, Trigger::Restart);
                    true
                }
            };
            if !proceed {
                return Err(closed.map_or_else(ClientError::Close, |()| ClientError::Interrupted));
            }
            closed.err()
        } else {
            None
        };

        let opened = inner.open_and_commit(Trigger::Restart).await;
        match (close_err, opened) {
            (None, result) => result,
            (Some(close), Ok(())) => Err(ClientError::Close(close)),
            (Some(close), Err(ClientError::Open(open))) => Err(ClientError::Restart { close, open }),
            (Some(_), Err(other)) => Err(other),
        }
    }

    /// Arm a one-shot start attempt after `seconds`.
    ///
    /// `0` fires as soon as the runtime schedules the timer task.  Under the
    /// default [`RetryPolicy::Replace`] a pending retry is cancelled and
    /// replaced.  Arming while a transition is in flight is allowed; the
    /// retry waits for it to settle.  Must be called from within a tokio
    /// runtime.
    pub fn retry_with_seconds(&self, seconds: u64) -> Result<RetryDisposition, ClientError> {
        self.retry_after(Duration::from_secs(seconds))
    }

    /// [`retry_with_seconds`](Self::retry_with_seconds) with sub-second
    /// precision.
    pub fn retry_after(&self, delay: Duration) -> Result<RetryDisposition, ClientError> {
        self.arm_retry(delay, ArmSource::Caller)
    }

    /// Re-arm after a failed start on behalf of the supervisor.  Refused
    /// with [`RetryDisposition::Halted`] once the caller has stopped the
    /// client.
    pub(crate) fn rearm_after_failure(
        &self,
        delay: Duration,
    ) -> Result<RetryDisposition, ClientError> {
        self.arm_retry(delay, ArmSource::Supervisor)
    }

    fn arm_retry(
        &self,
        delay: Duration,
        source: ArmSource,
    ) -> Result<RetryDisposition, ClientError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let inner = &self.inner;

        let (id, cancel, disposition) = {
            let mut st = inner.state.lock();
            match source {
                ArmSource::Supervisor if st.halted => {
                    inner.skip_retry("stopped by caller");
                    return Ok(RetryDisposition::Halted);
                }
                ArmSource::Supervisor => {}
                ArmSource::Caller => st.halted = false,
            }
            if st.phase == Phase::Running {
                inner.skip_retry("already running");
                return Ok(RetryDisposition::AlreadyRunning);
            }
            match st.retry.arm(delay, inner.retry_policy) {
                ArmOutcome::Kept => {
                    inner.skip_retry("retry already pending");
                    return Ok(RetryDisposition::KeptPending);
                }
                ArmOutcome::Armed {
                    id,
                    cancel,
                    replaced,
                } => {
                    TraceEvent::RetryArmed {
                        dev_sn: inner.identity.dev_sn().to_owned(),
                        delay_secs: delay.as_secs(),
                        replaced,
                    }
                    .emit();
                    inner.publish(ClientEvent::RetryArmed { delay, replaced });
                    let disposition = if replaced {
                        RetryDisposition::Replaced
                    } else {
                        RetryDisposition::Armed
                    };
                    (id, cancel, disposition)
                }
            }
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            loop {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match inner.fire_retry(id).await {
                    Fire::Done => return,
                    Fire::Deferred => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = inner.wait_settled() => {}
                        }
                    }
                }
            }
        });

        Ok(disposition)
    }

    /// Cancel a pending retry without touching the session.  Returns true
    /// if one was pending.
    pub fn cancel_retry(&self) -> bool {
        let mut st = self.inner.state.lock();
        self.inner.cancel_retry(&mut st, "cancelled")
    }

    // ── Detached variants ────────────────────────────────────────────

    /// [`start`](Self::start) on a spawned task, for callers that must not
    /// wait on the connector.
    pub fn spawn_start(&self) -> JoinHandle<Result<(), ClientError>> {
        let this = self.clone();
        tokio::spawn(async move { this.start().await })
    }

    pub fn spawn_stop(&self) -> JoinHandle<Result<(), ClientError>> {
        let this = self.clone();
        tokio::spawn(async move { this.stop().await })
    }

    pub fn spawn_restart(&self) -> JoinHandle<Result<(), ClientError>> {
        let this = self.clone();
        tokio::spawn(async move { this.restart().await })
    }
}

#[derive(Clone, Copy)]
enum ArmSource {
    Caller,
    Supervisor,
}

/// What a woken retry timer should do next.
enum Fire {
    Done,
    /// A transition was in flight; the slot is still armed.
    Deferred,
}

impl std::fmt::Debug for ClientInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInstance")
            .field("dev_key", &mask_secret(self.dev_key()))
            .field("dev_sn", &self.dev_sn())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Inner {
    /// Open with the phase already set to `Starting`, then commit.
    async fn open_and_commit(&self, trigger: Trigger) -> Result<(), ClientError> {
        let opened = self.connector.open().await;
        let close_now = {
            let mut st = self.state.lock();
            match &opened {
                Ok(()) if st.stop_requested => {
                    self.set_phase(&mut st, Phase::Stopping, Trigger::Stop);
                    true
                }
                Ok(()) => {
                    self.cancel_retry(&mut st, "running");
                    self.set_phase(&mut st, Phase::Running, trigger);
                    self.publish(ClientEvent::Started { trigger });
                    false
                }
                Err(e) => {
                    let stop_landed = std::mem::take(&mut st.stop_requested);
                    self.set_phase(&mut st, Phase::Stopped, trigger);
                    st.last_start_error = Some(e.clone());
                    self.report_failure("open", trigger, e);
                    self.publish(ClientEvent::StartFailed {
                        trigger,
                        error: e.clone(),
                    });
                    if stop_landed {
                        self.publish(ClientEvent::Stopped {
                            trigger: Trigger::Stop,
                        });
                    }
                    false
                }
            }
        };

        match opened {
            Err(e) => Err(ClientError::Open(e)),
            Ok(()) if close_now => {
                // Failure already reported through events and logs.
                let _ = self.close_and_commit(Trigger::Stop).await;
                Err(ClientError::Interrupted)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Close with the phase already set to `Stopping`, then commit.  The
    /// client ends `Stopped` whether or not the close succeeded.
    async fn close_and_commit(&self, trigger: Trigger) -> Result<(), ConnectorError> {
        let closed = self.connector.close().await;
        let mut st = self.state.lock();
        st.stop_requested = false;
        self.set_phase(&mut st, Phase::Stopped, trigger);
        match &closed {
            Ok(()) => self.publish(ClientEvent::Stopped { trigger }),
            Err(e) => {
                self.report_failure("close", trigger, e);
                self.publish(ClientEvent::StopFailed {
                    trigger,
                    error: e.clone(),
                });
            }
        }
        closed
    }

    async fn fire_retry(&self, id: u64) -> Fire {
        {
            let mut st = self.state.lock();
            if !st.retry.holds(id) {
                return Fire::Done;
            }
            let phase = st.phase;
            if !phase.is_settled() {
                tracing::debug!(
                    dev_sn = %self.identity.dev_sn(),
                    %phase,
                    "retry due during a transition, waiting for it to settle"
                );
                return Fire::Deferred;
            }
            st.retry.claim(id);
            TraceEvent::RetryFired {
                dev_sn: self.identity.dev_sn().to_owned(),
            }
            .emit();
            if phase == Phase::Running {
                self.skip_retry("already running");
                return Fire::Done;
            }
            self.set_phase(&mut st, Phase::Starting, Trigger::Retry);
        }
        // Failures surface as ClientEvent::StartFailed.
        let _ = self.open_and_commit(Trigger::Retry).await;
        Fire::Done
    }

    async fn wait_settled(&self) {
        let mut rx = self.phase_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|p| p.is_settled()).await;
    }

    fn set_phase(&self, st: &mut State, to: Phase, trigger: Trigger) {
        let from = st.phase;
        if from == to {
            return;
        }
        st.phase = to;
        if to == Phase::Starting {
            st.last_start_error = None;
        }
        if to.is_settled() {
            st.last_transition_at = Some(Utc::now());
        }
        self.running.store(to == Phase::Running, Ordering::Release);
        self.phase_tx.send_replace(to);

        TraceEvent::PhaseChanged {
            dev_sn: self.identity.dev_sn().to_owned(),
            from: from.to_string(),
            to: to.to_string(),
            trigger: trigger.to_string(),
        }
        .emit();
    }

    fn cancel_retry(&self, st: &mut State, reason: &'static str) -> bool {
        if !st.retry.cancel() {
            return false;
        }
        TraceEvent::RetryCancelled {
            dev_sn: self.identity.dev_sn().to_owned(),
            reason: reason.into(),
        }
        .emit();
        self.publish(ClientEvent::RetryCancelled { reason });
        true
    }

    fn skip_retry(&self, reason: &'static str) {
        TraceEvent::RetrySkipped {
            dev_sn: self.identity.dev_sn().to_owned(),
            reason: reason.into(),
        }
        .emit();
        self.publish(ClientEvent::RetrySkipped { reason });
    }

    fn report_failure(&self, op: &str, trigger: Trigger, err: &ConnectorError) {
        tracing::warn!(
            dev_sn = %self.identity.dev_sn(),
            connector = %self.connector.name(),
            op,
            %trigger,
            error = %err,
            "connector call failed"
        );
        TraceEvent::ConnectorFailed {
            dev_sn: self.identity.dev_sn().to_owned(),
            op: op.into(),
            trigger: trigger.to_string(),
            error: err.to_string(),
        }
        .emit();
    }

    fn publish(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
