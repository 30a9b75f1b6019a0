//! Backoff supervisor: re-arms retries after failed starts.
//!
//! The lifecycle never retries on its own.  This task watches a client's
//! events and, after each `StartFailed`, re-arms a retry with
//! the next [`RetryBackoff`] delay.  A successful start resets the count;
//! an explicit `stop()` ends supervision.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryBackoff;
use crate::lifecycle::ClientInstance;
use crate::types::{ClientEvent, RetryDisposition, Trigger};

/// Why a supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Shutdown,
    /// `max_attempts` consecutive retries failed.
    Exhausted(u32),
    /// The client was stopped explicitly.
    Stopped,
    /// The client's event channel closed.
    Closed,
}

/// Spawn a supervisor for `client`.
///
/// Runs until `shutdown` is cancelled, the client is stopped, or the
/// backoff gives up.
pub fn supervise(
    client: ClientInstance,
    backoff: RetryBackoff,
    shutdown: CancellationToken,
) -> JoinHandle<SupervisorExit> {
    // Subscribe before spawning so no failure between the two is missed.
    let events = client.subscribe_events();
    tokio::spawn(run(client, backoff, shutdown, events))
}

async fn run(
    client: ClientInstance,
    backoff: RetryBackoff,
    shutdown: CancellationToken,
    mut events: tokio::sync::broadcast::Receiver<ClientEvent>,
) -> SupervisorExit {
    let mut attempt: u32 = 0;

    loop {
        let event = tokio::select! {
            ev = events.recv() => ev,
            _ = shutdown.cancelled() => {
                tracing::debug!(dev_sn = %client.dev_sn(), "supervisor shutdown");
                return SupervisorExit::Shutdown;
            }
        };

        match event {
            Ok(ClientEvent::StartFailed { trigger, error }) => {
                if backoff.should_give_up(attempt) {
                    tracing::error!(
                        dev_sn = %client.dev_sn(),
                        attempts = attempt,
                        %error,
                        "max retry attempts exhausted"
                    );
                    return SupervisorExit::Exhausted(attempt);
                }

                let delay_secs = backoff.delay_secs_for_attempt(attempt);
                attempt += 1;
                tracing::info!(
                    dev_sn = %client.dev_sn(),
                    %trigger,
                    %error,
                    delay_secs,
                    attempt,
                    "start failed, scheduling retry"
                );

                match client.rearm_after_failure(Duration::from_secs(delay_secs)) {
                    Ok(RetryDisposition::Halted) => {
                        tracing::debug!(dev_sn = %client.dev_sn(), "client stopped, supervisor exiting");
                        return SupervisorExit::Stopped;
                    }
                    Ok(RetryDisposition::KeptPending) => {
                        tracing::debug!("retry already pending, keeping it");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to arm retry");
                    }
                }
            }
            Ok(ClientEvent::Started { .. }) => {
                attempt = 0;
            }
            Ok(ClientEvent::Stopped { trigger: Trigger::Stop })
            | Ok(ClientEvent::StopFailed { trigger: Trigger::Stop, .. }) => {
                tracing::debug!(dev_sn = %client.dev_sn(), "client stopped, supervisor exiting");
                return SupervisorExit::Stopped;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "supervisor lagged behind client events");
            }
            Err(RecvError::Closed) => return SupervisorExit::Closed,
        }
    }
}
