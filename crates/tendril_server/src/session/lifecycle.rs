//! Window connection state machine.
//!
//! ```text
//! Connecting -> Active <-> Degraded -> Reconnecting -> Active
//!                                                   \-> Destroyed
//! ```
//!
//! The machine is driven entirely by its inputs and never touches I/O;
//! the window task turns [`TickAction`]s into pings, closed transports and
//! teardown.

use tokio::time::Instant;

use super::config::SessionConfig;

/// Connection state of a window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// INIT_WINDOW sent, waiting for the first heartbeat.
    Connecting,
    /// Client is heard from regularly.
    Active,
    /// Client silent for longer than the liveness timeout.
    Degraded,
    /// Transport dropped, waiting for the client to resume.
    Reconnecting,
    /// Window torn down; nothing can revive it.
    Destroyed,
}

/// What the window should do after a heartbeat tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickAction {
    Idle,
    SendPing,
    DropTransport,
    Destroy,
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: LifecycleState,
    last_message: Instant,
    missed: u32,
    liveness_timeout: std::time::Duration,
    reconnect_after_missed: u32,
    destroy_after_missed: u32,
}

impl Lifecycle {
    pub fn new(config: &SessionConfig, now: Instant) -> Self {
        Self {
            state: LifecycleState::Connecting,
            last_message: now,
            missed: 0,
            liveness_timeout: config.liveness_timeout(),
            reconnect_after_missed: config.reconnect_after_missed,
            destroy_after_missed: config.destroy_after_missed,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn last_message(&self) -> Instant {
        self.last_message
    }

    /// Heartbeats missed since the client was last heard from
    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == LifecycleState::Destroyed
    }

    pub fn on_init_sent(&mut self, now: Instant) {
        if self.state != LifecycleState::Destroyed {
            self.state = LifecycleState::Connecting;
            self.last_message = now;
        }
    }

    /// Any decoded client message counts as a heartbeat.
    pub fn on_client_message(&mut self, now: Instant) {
        if self.state == LifecycleState::Destroyed {
            return;
        }
        self.last_message = now;
        self.missed = 0;
        if self.state != LifecycleState::Reconnecting {
            self.state = LifecycleState::Active;
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> TickAction {
        if self.state == LifecycleState::Destroyed {
            return TickAction::Idle;
        }
        if now.saturating_duration_since(self.last_message) < self.liveness_timeout {
            return match self.state {
                LifecycleState::Reconnecting => TickAction::Idle,
                _ => TickAction::SendPing,
            };
        }

        self.missed += 1;
        if self.missed >= self.destroy_after_missed {
            self.state = LifecycleState::Destroyed;
            return TickAction::Destroy;
        }
        match self.state {
            LifecycleState::Connecting | LifecycleState::Active => {
                self.state = LifecycleState::Degraded;
                TickAction::SendPing
            }
            LifecycleState::Degraded if self.missed >= self.reconnect_after_missed => {
                self.state = LifecycleState::Reconnecting;
                TickAction::DropTransport
            }
            LifecycleState::Degraded => TickAction::SendPing,
            LifecycleState::Reconnecting | LifecycleState::Destroyed => TickAction::Idle,
        }
    }

    /// The transport closed or errored.
    pub fn on_transport_lost(&mut self) {
        if self.state != LifecycleState::Destroyed {
            self.state = LifecycleState::Reconnecting;
        }
    }

    /// A client resumed with an offset the window could replay from.
    pub fn on_resumed(&mut self, now: Instant) {
        if self.state != LifecycleState::Destroyed {
            self.state = LifecycleState::Active;
            self.last_message = now;
            self.missed = 0;
        }
    }

    /// Tear down regardless of state.
    pub fn destroy(&mut self) {
        self.state = LifecycleState::Destroyed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig::standard()
            .with_liveness_timeout(Duration::from_secs(4))
            .with_missed_limits(3, 6)
    }

    #[test]
    fn test_first_heartbeat_activates() {
        let start = Instant::now();
        let mut lifecycle = Lifecycle::new(&config(), start);
        lifecycle.on_init_sent(start);
        assert_eq!(lifecycle.state(), LifecycleState::Connecting);

        assert_eq!(lifecycle.on_tick(start + Duration::from_secs(1)), TickAction::SendPing);
        lifecycle.on_client_message(start + Duration::from_secs(1));
        assert_eq!(lifecycle.state(), LifecycleState::Active);
    }

    #[test]
    fn test_silence_degrades_then_drops_transport() {
        let start = Instant::now();
        let mut lifecycle = Lifecycle::new(&config(), start);
        lifecycle.on_client_message(start);

        let silent = |secs| start + Duration::from_secs(secs);
        assert_eq!(lifecycle.on_tick(silent(2)), TickAction::SendPing);
        assert_eq!(lifecycle.state(), LifecycleState::Active);

        assert_eq!(lifecycle.on_tick(silent(5)), TickAction::SendPing);
        assert_eq!(lifecycle.state(), LifecycleState::Degraded);

        // a message while degraded recovers without reconnecting
        lifecycle.on_client_message(silent(5));
        assert_eq!(lifecycle.state(), LifecycleState::Active);
        assert_eq!(lifecycle.missed(), 0);

        assert_eq!(lifecycle.on_tick(silent(10)), TickAction::SendPing);
        assert_eq!(lifecycle.on_tick(silent(11)), TickAction::SendPing);
        assert_eq!(lifecycle.on_tick(silent(12)), TickAction::DropTransport);
        assert_eq!(lifecycle.state(), LifecycleState::Reconnecting);
    }

    #[test]
    fn test_resume_reactivates() {
        let start = Instant::now();
        let mut lifecycle = Lifecycle::new(&config(), start);
        lifecycle.on_client_message(start);
        lifecycle.on_transport_lost();
        assert_eq!(lifecycle.state(), LifecycleState::Reconnecting);

        // stray messages from the dead transport do not reactivate it
        lifecycle.on_client_message(start + Duration::from_secs(1));
        assert_eq!(lifecycle.state(), LifecycleState::Reconnecting);

        lifecycle.on_resumed(start + Duration::from_secs(2));
        assert_eq!(lifecycle.state(), LifecycleState::Active);
    }

    #[test]
    fn test_destroyed_after_cap() {
        let start = Instant::now();
        let mut lifecycle = Lifecycle::new(&config(), start);
        lifecycle.on_transport_lost();

        let mut actions = Vec::new();
        for secs in 5..11 {
            actions.push(lifecycle.on_tick(start + Duration::from_secs(secs)));
        }
        assert_eq!(actions.last(), Some(&TickAction::Destroy));
        assert!(lifecycle.is_destroyed());

        lifecycle.on_resumed(start + Duration::from_secs(12));
        assert!(lifecycle.is_destroyed());
        assert_eq!(
            lifecycle.on_tick(start + Duration::from_secs(13)),
            TickAction::Idle
        );
    }
}
