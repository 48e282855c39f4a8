//! Hysteretic chunking policy for renderer throughput: drain one line per
//! tick while the stream keeps up ("smooth"), drain everything while it falls
//! behind ("catchup"). Hysteresis keeps the mode from flapping at the
//! boundary.

use std::time::Duration;
use std::time::Instant;

const ENTER_QUEUED: usize = 8;
const ENTER_AGE: Duration = Duration::from_millis(120);
const EXIT_QUEUED: usize = 2;
const EXIT_AGE: Duration = Duration::from_millis(40);
const EXIT_HOLD: Duration = Duration::from_millis(250);
const REENTRY_COOLDOWN: Duration = Duration::from_millis(250);
const SEVERE_QUEUED: usize = 64;
const SEVERE_AGE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    Smooth,
    Catchup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainScope {
    /// Normal operation: smooth mode drains one line per tick.
    All,
    /// Only drain while catching up; smooth ticks drain nothing.
    CatchupOnly,
}

/// Renderer queue observation for one tick.
#[derive(Debug, Clone, Copy)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub oldest_age: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainDecision {
    pub mode: ChunkMode,
    /// Number of queued lines to drain this tick.
    pub drain: usize,
}

#[derive(Debug)]
pub struct ChunkPolicy {
    mode: ChunkMode,
    /// When the queue first dropped below the exit thresholds.
    calm_since: Option<Instant>,
    /// Re-entry into catchup is blocked until this instant, severe backlog
    /// excepted.
    cooldown_until: Option<Instant>,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkPolicy {
    pub fn new() -> Self {
        Self {
            mode: ChunkMode::Smooth,
            calm_since: None,
            cooldown_until: None,
        }
    }

    pub fn mode(&self) -> ChunkMode {
        self.mode
    }

    pub fn tick(&mut self, now: Instant, snapshot: QueueSnapshot, scope: DrainScope) -> DrainDecision {
        match self.mode {
            ChunkMode::Smooth => {
                let severe =
                    snapshot.queued >= SEVERE_QUEUED || snapshot.oldest_age >= SEVERE_AGE;
                let backlog =
                    snapshot.queued >= ENTER_QUEUED || snapshot.oldest_age >= ENTER_AGE;
                let cooling = self
                    .cooldown_until
                    .is_some_and(|until| now < until);
                if backlog && (!cooling || severe) {
                    self.mode = ChunkMode::Catchup;
                    self.calm_since = None;
                    return DrainDecision {
                        mode: ChunkMode::Catchup,
                        drain: snapshot.queued,
                    };
                }
                DrainDecision {
                    mode: ChunkMode::Smooth,
                    drain: self.smooth_drain(snapshot.queued, scope),
                }
            }
            ChunkMode::Catchup => {
                let calm =
                    snapshot.queued <= EXIT_QUEUED && snapshot.oldest_age <= EXIT_AGE;
                if !calm {
                    self.calm_since = None;
                    return DrainDecision {
                        mode: ChunkMode::Catchup,
                        drain: snapshot.queued,
                    };
                }
                let since = *self.calm_since.get_or_insert(now);
                if now.duration_since(since) < EXIT_HOLD {
                    return DrainDecision {
                        mode: ChunkMode::Catchup,
                        drain: snapshot.queued,
                    };
                }
                self.mode = ChunkMode::Smooth;
                self.calm_since = None;
                self.cooldown_until = Some(now + REENTRY_COOLDOWN);
                DrainDecision {
                    mode: ChunkMode::Smooth,
                    drain: self.smooth_drain(snapshot.queued, scope),
                }
            }
        }
    }

    fn smooth_drain(&self, queued: usize, scope: DrainScope) -> usize {
        match scope {
            DrainScope::CatchupOnly => 0,
            DrainScope::All => queued.min(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snap(queued: usize, age_ms: u64) -> QueueSnapshot {
        QueueSnapshot {
            queued,
            oldest_age: Duration::from_millis(age_ms),
        }
    }

    #[test]
    fn backlog_enters_catchup_and_calm_hold_leaves_it() {
        let mut policy = ChunkPolicy::new();
        let t0 = Instant::now();

        let d = policy.tick(t0, snap(9, 10), DrainScope::All);
        assert_eq!(d.mode, ChunkMode::Catchup);
        assert_eq!(d.drain, 9);

        // Calm, but not yet held for 250ms.
        let d = policy.tick(t0 + Duration::from_millis(200), snap(2, 40), DrainScope::All);
        assert_eq!(d.mode, ChunkMode::Catchup);

        // Held calm for 260ms: back to smooth.
        let d = policy.tick(t0 + Duration::from_millis(460), snap(2, 40), DrainScope::All);
        assert_eq!(d.mode, ChunkMode::Smooth);
    }

    #[test]
    fn reentry_cooldown_blocks_unless_severe() {
        let mut policy = ChunkPolicy::new();
        let t0 = Instant::now();
        policy.tick(t0, snap(9, 10), DrainScope::All);
        policy.tick(t0 + Duration::from_millis(200), snap(2, 40), DrainScope::All);
        policy.tick(t0 + Duration::from_millis(460), snap(2, 40), DrainScope::All);

        // Ordinary backlog within the cooldown window stays smooth; with the
        // catchup_only scope the tick drains nothing.
        let d = policy.tick(
            t0 + Duration::from_millis(500),
            snap(8, 10),
            DrainScope::CatchupOnly,
        );
        assert_eq!(d.mode, ChunkMode::Smooth);
        assert_eq!(d.drain, 0);

        // Severe backlog overrides the cooldown.
        let d = policy.tick(t0 + Duration::from_millis(520), snap(64, 10), DrainScope::All);
        assert_eq!(d.mode, ChunkMode::Catchup);
        assert_eq!(d.drain, 64);
    }

    #[test]
    fn old_lines_alone_trigger_catchup() {
        let mut policy = ChunkPolicy::new();
        let d = policy.tick(Instant::now(), snap(1, 120), DrainScope::All);
        assert_eq!(d.mode, ChunkMode::Catchup);
        assert_eq!(d.drain, 1);
    }

    #[test]
    fn smooth_mode_drains_at_most_one_line() {
        let mut policy = ChunkPolicy::new();
        let d = policy.tick(Instant::now(), snap(5, 10), DrainScope::All);
        assert_eq!(d.mode, ChunkMode::Smooth);
        assert_eq!(d.drain, 1);

        let d = policy.tick(Instant::now(), snap(0, 0), DrainScope::All);
        assert_eq!(d.drain, 0);
    }

    #[test]
    fn calm_interruption_resets_the_hold() {
        let mut policy = ChunkPolicy::new();
        let t0 = Instant::now();
        policy.tick(t0, snap(10, 10), DrainScope::All);
        policy.tick(t0 + Duration::from_millis(100), snap(1, 10), DrainScope::All);
        // Backlog returns: the hold restarts.
        policy.tick(t0 + Duration::from_millis(200), snap(5, 60), DrainScope::All);
        let d = policy.tick(t0 + Duration::from_millis(420), snap(1, 10), DrainScope::All);
        // Only 220ms of renewed calm at most; still catching up.
        assert_eq!(d.mode, ChunkMode::Catchup);
    }
}
