/// Polling fallback controller
///
/// While the push channel is degraded, snapshot polling is the only source of
/// updates, so its frequency is raised. Activation is gated two ways: the
/// session must have connected at least once (a session that never connects
/// keeps the default-frequency poll), and the disconnect must outlast a grace
/// period so that quick reconnects never flip the dashboard into degraded
/// mode.
///
/// This is a pure state machine over {Inactive, Grace(deadline), Active}
/// driven by transport transitions and a deadline check; the context event
/// loop owns the actual timers.
use std::time::{Duration, Instant};

/// Fallback phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPhase {
    /// Push channel healthy (or never yet connected)
    Inactive,
    /// Disconnected; fallback activates at the deadline unless reconnected
    Grace(Instant),
    /// Degraded: polling at the raised frequency
    Active,
}

/// Work demanded from the poll loop by a phase transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAction {
    /// Fallback just ended; fetch a fresh snapshot immediately, since unknown
    /// changes may have occurred while degraded
    ForceRefresh,
}

/// Watches connection transitions and gates the snapshot poll frequency
pub struct PollingFallbackController {
    phase: FallbackPhase,
    connected_once: bool,
    grace: Duration,
    default_interval: Duration,
    fallback_interval: Duration,
}

impl PollingFallbackController {
    pub fn new(grace: Duration, default_interval: Duration, fallback_interval: Duration) -> Self {
        Self {
            phase: FallbackPhase::Inactive,
            connected_once: false,
            grace,
            default_interval,
            fallback_interval,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase == FallbackPhase::Active
    }

    pub fn phase(&self) -> FallbackPhase {
        self.phase
    }

    /// Current snapshot poll interval
    pub fn polling_interval(&self) -> Duration {
        if self.is_active() {
            self.fallback_interval
        } else {
            self.default_interval
        }
    }

    /// Deadline the poll loop must wake at, if a grace timer is running
    pub fn grace_deadline(&self) -> Option<Instant> {
        match self.phase {
            FallbackPhase::Grace(deadline) => Some(deadline),
            _ => None,
        }
    }

    /// The push channel connected
    pub fn on_connected(&mut self) -> Option<FallbackAction> {
        self.connected_once = true;
        match self.phase {
            FallbackPhase::Active => {
                self.phase = FallbackPhase::Inactive;
                tracing::info!("push channel restored, leaving fallback polling");
                Some(FallbackAction::ForceRefresh)
            }
            FallbackPhase::Grace(_) => {
                self.phase = FallbackPhase::Inactive;
                None
            }
            FallbackPhase::Inactive => None,
        }
    }

    /// The push channel dropped
    pub fn on_disconnected(&mut self, now: Instant) {
        if !self.connected_once {
            return;
        }
        if self.phase == FallbackPhase::Inactive {
            let deadline = now + self.grace;
            self.phase = FallbackPhase::Grace(deadline);
            tracing::debug!(grace_ms = self.grace.as_millis() as u64, "fallback grace timer started");
        }
    }

    /// Deadline check; returns true when fallback just activated
    pub fn tick(&mut self, now: Instant) -> bool {
        if let FallbackPhase::Grace(deadline) = self.phase {
            if now >= deadline {
                self.phase = FallbackPhase::Active;
                tracing::warn!("push channel still down after grace period, fallback polling active");
                return true;
            }
        }
        false
    }
}
