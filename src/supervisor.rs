use crate::config::{RecoveryPolicy, RejoinPolicy};
use crate::error::{Error, FailureKind, FailureReport};
use crate::event::Event;
use crate::manager::{SessionFailure, SessionManager};
use crate::media::LocalMediaState;
use crate::notification::Notifier;
use crate::protocol::UserId;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Decides what happens to failed sessions and owns every pending recovery timer.
pub(crate) struct RecoverySupervisor {
    policy: RecoveryPolicy,
    join_delay: Duration,
    events: UnboundedSender<Event>,
    notifier: Notifier,
    timers: CancellationToken,
}

impl RecoverySupervisor {
    pub fn new(
        policy: RecoveryPolicy,
        join_delay: Duration,
        events: UnboundedSender<Event>,
        notifier: Notifier,
    ) -> Self {
        RecoverySupervisor {
            policy,
            join_delay,
            events,
            notifier,
            timers: CancellationToken::new(),
        }
    }

    /// Handles a join announcement. Without a join delay the initiator session is created right
    /// away, otherwise the member is recorded now and the session created once the delay elapses.
    pub fn on_member_joined(
        &self,
        manager: &mut SessionManager,
        user_id: UserId,
        user_name: Arc<str>,
        media: &LocalMediaState,
    ) -> bool {
        if self.join_delay.is_zero() {
            manager.on_member_joined(user_id, user_name, media)
        } else {
            if manager.admit_member(user_id.clone(), user_name) {
                debug!("approaching {} in {:?}", user_id, self.join_delay);
                self.schedule(self.join_delay, Event::DelayedJoin { user_id });
            }
            false
        }
    }

    /// Join delay elapsed. Members which left meanwhile are skipped.
    pub fn on_delayed_join(
        &self,
        manager: &mut SessionManager,
        user_id: UserId,
        media: &LocalMediaState,
    ) -> bool {
        if manager.is_member(&user_id) {
            manager.ensure_initiator(user_id, media)
        } else {
            debug!("{} left before the join delay elapsed", user_id);
            false
        }
    }

    /// Schedules a session recreation, or gives the peer up once it failed too many times in
    /// a row. Giving up is reported exactly once per streak.
    pub fn on_session_failed(&mut self, manager: &mut SessionManager, failure: SessionFailure) {
        let SessionFailure {
            user_id,
            generation,
            error,
        } = failure;
        let retry_count = match manager.session(&user_id) {
            Some(session) if session.generation() == generation => session.retry_count(),
            _ => return,
        };
        let attempt = retry_count + 1;
        if attempt < self.policy.max_consecutive_failures {
            warn!(
                "session with {} failed ({}/{}): {}",
                user_id, attempt, self.policy.max_consecutive_failures, error
            );
            self.notifier.failure(
                FailureReport::peer(user_id.clone(), FailureKind::NegotiationFailure).with_error(error),
            );
            self.schedule(
                self.policy.retry_delay(),
                Event::RetryDue {
                    user_id,
                    generation,
                },
            );
        } else if manager.abandon(&user_id, generation) {
            self.notifier.failure(
                FailureReport::peer(user_id, FailureKind::RetryBudgetExhausted).with_error(error),
            );
        }
    }

    /// Recovery delay of a failed session elapsed. Ignored if the session got replaced meanwhile.
    pub fn on_retry_due(
        &mut self,
        manager: &mut SessionManager,
        user_id: &UserId,
        generation: u64,
        media: &LocalMediaState,
    ) -> bool {
        let recreated = manager.recreate(user_id, generation, media);
        if !recreated {
            debug!("retry of {} (generation {}) is obsolete", user_id, generation);
        }
        recreated
    }

    /// Relay connection came back after a drop.
    pub fn on_relay_rejoined(&mut self, manager: &mut SessionManager, policy: RejoinPolicy) {
        match policy {
            RejoinPolicy::KeepSessions => {
                debug!("relay rejoined, keeping existing sessions");
            }
            RejoinPolicy::DiscardSessions => {
                info!("relay rejoined, discarding existing sessions");
                self.cancel_timers();
                manager.destroy_all();
            }
        }
    }

    /// Destroys every session, forgets exhausted peers, cancels pending retries and re-issues
    /// the room join.
    pub fn force_reconnect(&mut self, manager: &mut SessionManager) -> Result<(), Error> {
        info!("force reconnect requested");
        self.cancel_timers();
        manager.destroy_all();
        manager.rejoin_room()
    }

    /// Delivers `event` to the room loop after `delay`, unless timers get cancelled first.
    pub fn schedule(&self, delay: Duration, event: Event) {
        let cancelled = self.timers.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(event);
                }
            }
        });
    }

    pub fn cancel_timers(&mut self) {
        self.timers.cancel();
        self.timers = CancellationToken::new();
    }
}

impl Drop for RecoverySupervisor {
    fn drop(&mut self) {
        self.timers.cancel();
    }
}
