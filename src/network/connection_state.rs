use parking_lot::RwLock;
use rand::Rng;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lifecycle of a single peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Dial or handshake in progress
    Connecting { started_at: Instant },
    /// TLS session established, frames flowing
    Connected { since: Instant },
    /// Link lost; a reconnecting handler will dial again after backoff
    Disconnected { since: Instant },
    /// Terminal. Reached through `close()`, or when the link drops on a
    /// handler that does not reconnect.
    Closed,
}

impl HandlerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, HandlerState::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, HandlerState::Connecting { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, HandlerState::Closed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            HandlerState::Connecting { .. } => "connecting",
            HandlerState::Connected { .. } => "connected",
            HandlerState::Disconnected { .. } => "disconnected",
            HandlerState::Closed => "closed",
        }
    }
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validated state holder for one handler
pub struct ConnectionStateMachine {
    peer: String,
    state: RwLock<HandlerState>,
}

impl ConnectionStateMachine {
    pub fn new(peer: String) -> Self {
        Self {
            peer,
            state: RwLock::new(HandlerState::Connecting {
                started_at: Instant::now(),
            }),
        }
    }

    pub fn get(&self) -> HandlerState {
        *self.state.read()
    }

    /// Try to transition from current state to new state
    /// Returns true if transition succeeded, false if it was invalid
    pub fn try_transition(&self, new_state: HandlerState) -> bool {
        let mut state = self.state.write();
        let current = *state;

        let valid = match (current, new_state) {
            // Closed is terminal
            (HandlerState::Closed, _) => false,
            (_, HandlerState::Closed) => true,

            (HandlerState::Connecting { .. }, HandlerState::Connected { .. }) => true,
            (HandlerState::Connecting { .. }, HandlerState::Disconnected { .. }) => true,
            (HandlerState::Connected { .. }, HandlerState::Disconnected { .. }) => true,
            (HandlerState::Disconnected { .. }, HandlerState::Connecting { .. }) => true,

            _ => false,
        };

        if valid {
            *state = new_state;
            debug!(
                "✅ State transition for {}: {} -> {}",
                self.peer, current, new_state
            );
        } else if !current.is_closed() {
            warn!(
                "❌ Invalid state transition for {}: {} -> {}",
                self.peer, current, new_state
            );
        }
        valid
    }

    pub fn mark_connecting(&self) -> bool {
        self.try_transition(HandlerState::Connecting {
            started_at: Instant::now(),
        })
    }

    pub fn mark_connected(&self) -> bool {
        self.try_transition(HandlerState::Connected {
            since: Instant::now(),
        })
    }

    pub fn mark_disconnected(&self) -> bool {
        self.try_transition(HandlerState::Disconnected {
            since: Instant::now(),
        })
    }

    pub fn mark_closed(&self) -> bool {
        self.try_transition(HandlerState::Closed)
    }
}

/// Exponential reconnect backoff with jitter.
///
/// Attempt n waits a random delay in [d/2, d] where d = base * 2^n, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub const DEFAULT_BASE: Duration = Duration::from_millis(100);
    pub const DEFAULT_CAP: Duration = Duration::from_secs(5);

    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the next delay without jitter
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);

        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms < 2 {
            return ceiling;
        }
        Duration::from_millis(rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_CAP)
    }
}
