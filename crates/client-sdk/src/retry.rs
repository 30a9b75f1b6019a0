//! The single pending-retry slot owned by each client.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cs_domain::config::RetryPolicy;
use tokio_util::sync::CancellationToken;

struct PendingRetry {
    id: u64,
    cancel: CancellationToken,
    due_at: DateTime<Utc>,
}

/// Result of [`RetrySlot::arm`].
pub(crate) enum ArmOutcome {
    Armed {
        id: u64,
        cancel: CancellationToken,
        replaced: bool,
    },
    Kept,
}

/// Holds at most one pending retry.
///
/// Every mutation happens under the owning client's state lock.  A timer
/// task may only act after [`claim`](Self::claim) succeeds with its own id,
/// so once [`cancel`](Self::cancel) returns the cancelled timer can no
/// longer touch client state, even if it already woke up.
#[derive(Default)]
pub(crate) struct RetrySlot {
    pending: Option<PendingRetry>,
    next_id: u64,
}

impl RetrySlot {
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        self.pending.as_ref().map(|p| p.due_at)
    }

    pub fn arm(&mut self, delay: Duration, policy: RetryPolicy) -> ArmOutcome {
        if self.pending.is_some() && policy == RetryPolicy::KeepPending {
            return ArmOutcome::Kept;
        }
        let replaced = self.cancel();

        self.next_id += 1;
        let id = self.next_id;
        let cancel = CancellationToken::new();
        let due_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.pending = Some(PendingRetry {
            id,
            cancel: cancel.clone(),
            due_at,
        });

        ArmOutcome::Armed {
            id,
            cancel,
            replaced,
        }
    }

    /// Cancel the pending retry.  Returns true if one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(p) => {
                p.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the retry `id` still owns the slot.
    pub fn holds(&self, id: u64) -> bool {
        matches!(&self.pending, Some(p) if p.id == id)
    }

    /// Consume the slot if the retry `id` still owns it.
    pub fn claim(&mut self, id: u64) -> bool {
        match &self.pending {
            Some(p) if p.id == id => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}
