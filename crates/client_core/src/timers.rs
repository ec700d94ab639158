use std::{collections::HashMap, time::Duration};

use shared::domain::SessionId;
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::trace;

use crate::fsm::{CallInput, TimerKind};

/// Ring and negotiation countdowns for the current session. An expiry is
/// delivered as [`CallInput::TimerExpired`] on the client's internal queue;
/// the state machine discards it if the session moved on in the meantime.
pub struct SessionTimers {
    ring: Duration,
    negotiation: Duration,
    running: HashMap<TimerKind, JoinHandle<()>>,
}

impl SessionTimers {
    pub fn new(ring: Duration, negotiation: Duration) -> Self {
        Self {
            ring,
            negotiation,
            running: HashMap::new(),
        }
    }

    pub fn duration(&self, timer: TimerKind) -> Duration {
        match timer {
            TimerKind::Ring => self.ring,
            TimerKind::Negotiation => self.negotiation,
        }
    }

    /// Starts `timer`, replacing a running countdown of the same kind.
    pub fn start(
        &mut self,
        timer: TimerKind,
        session_id: SessionId,
        expired: mpsc::UnboundedSender<CallInput>,
    ) {
        self.cancel(timer);
        let delay = self.duration(timer);
        trace!(%session_id, %timer, ?delay, "timer: started");
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = expired.send(CallInput::TimerExpired { session_id, timer });
        });
        self.running.insert(timer, handle);
    }

    pub fn cancel(&mut self, timer: TimerKind) {
        if let Some(handle) = self.running.remove(&timer) {
            trace!(%timer, "timer: cancelled");
            handle.abort();
        }
    }

    pub fn is_running(&self, timer: TimerKind) -> bool {
        self.running
            .get(&timer)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.running.drain() {
            handle.abort();
        }
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
