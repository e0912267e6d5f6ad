// src/core/watcher.rs
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::entity::Entity;
use crate::services::interface::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Watching {
        token: String,
        since: Instant,
        ticks: u32,
        /// A fetch for this token has been issued and not yet observed.
        in_flight: bool,
    },
}

/// What a finished poll tick means for the session.
#[derive(Debug)]
pub enum TickOutcome<E> {
    /// Completion flag set; the watch is over.
    Ready(E),
    /// Entity read, still provisioning.
    Pending(E),
    /// Read failed; try again next interval.
    Inconclusive,
    /// Result belongs to a token that is no longer watched.
    Stale,
    /// Gave up after the configured maximum watch duration.
    Stalled { token: String },
}

/// Poll-until-ready state machine.
///
/// Holds no timers itself: the owner sleeps until `due()`, calls
/// `begin_tick()`, runs the fetch and hands the result to `observe()`.
/// `due()` is `None` while a fetch is in flight so ticks never overlap.
#[derive(Debug)]
pub struct Watcher {
    interval: Duration,
    timeout: Option<Duration>,
    state: WatchState,
    next_tick: Option<Instant>,
}

impl Watcher {
    pub fn new(interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            interval,
            timeout,
            state: WatchState::Idle,
            next_tick: None,
        }
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    pub fn token(&self) -> Option<&str> {
        match &self.state {
            WatchState::Watching { token, .. } => Some(token),
            WatchState::Idle => None,
        }
    }

    pub fn ticks(&self) -> u32 {
        match &self.state {
            WatchState::Watching { ticks, .. } => *ticks,
            WatchState::Idle => 0,
        }
    }

    /// Start watching `token`, replacing any prior watch. The first tick is
    /// due immediately. Returns the replaced token.
    pub fn start(&mut self, token: String, now: Instant) -> Option<String> {
        let previous = self.clear();
        if let Some(prev) = &previous {
            debug!("Watch on '{}' replaced by '{}'", prev, token);
        }
        info!("Watching '{}' until provisioning completes", token);
        self.state = WatchState::Watching {
            token,
            since: now,
            ticks: 0,
            in_flight: false,
        };
        self.next_tick = Some(now);
        previous
    }

    /// Stop watching. Returns the token that was being watched.
    pub fn clear(&mut self) -> Option<String> {
        self.next_tick = None;
        match std::mem::replace(&mut self.state, WatchState::Idle) {
            WatchState::Watching { token, .. } => Some(token),
            WatchState::Idle => None,
        }
    }

    /// When the next fetch should be issued.
    pub fn due(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Mark a fetch as issued and return the token to fetch.
    pub fn begin_tick(&mut self) -> Option<String> {
        match &mut self.state {
            WatchState::Watching {
                token,
                ticks,
                in_flight,
                ..
            } if !*in_flight => {
                *ticks += 1;
                *in_flight = true;
                self.next_tick = None;
                Some(token.clone())
            }
            _ => None,
        }
    }

    /// Evaluate the result of the fetch issued for `token`.
    pub fn observe<E: Entity>(
        &mut self,
        token: &str,
        result: Result<E, StoreError>,
        now: Instant,
    ) -> TickOutcome<E> {
        let since = match &mut self.state {
            WatchState::Watching {
                token: current,
                since,
                in_flight,
                ..
            } if current == token => {
                *in_flight = false;
                *since
            }
            _ => {
                debug!("Discarding poll result for unwatched '{}'", token);
                return TickOutcome::Stale;
            }
        };

        let outcome = match result {
            Ok(entity) if entity.is_provisioned() => {
                info!("{} '{}' finished provisioning", E::KIND, token);
                self.clear();
                return TickOutcome::Ready(entity);
            }
            Ok(entity) => TickOutcome::Pending(entity),
            Err(StoreError::NotFound { .. }) => {
                warn!("{} '{}' not found while watching", E::KIND, token);
                TickOutcome::Inconclusive
            }
            Err(e) => {
                warn!("Poll for {} '{}' failed: {}", E::KIND, token, e);
                TickOutcome::Inconclusive
            }
        };

        if let Some(limit) = self.timeout {
            if now.duration_since(since) >= limit {
                warn!(
                    "{} '{}' still provisioning after {:?}, giving up",
                    E::KIND,
                    token,
                    limit
                );
                self.clear();
                return TickOutcome::Stalled {
                    token: token.to_string(),
                };
            }
        }

        self.next_tick = Some(now + self.interval);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::{Agent, EntityKind};

    fn agent(assigned: bool) -> Agent {
        Agent {
            id: "agent-42".into(),
            alias: "acme-bot".into(),
            alias_assigned: assigned,
            ..Default::default()
        }
    }

    fn watcher() -> Watcher {
        Watcher::new(Duration::from_millis(2000), None)
    }

    #[test]
    fn test_ready_tick_ends_watch() {
        let now = Instant::now();
        let mut w = watcher();
        w.start("agent-42".into(), now);
        assert_eq!(w.due(), Some(now));

        let token = w.begin_tick().unwrap();
        assert!(matches!(
            w.observe(&token, Ok(agent(false)), now),
            TickOutcome::Pending(_)
        ));
        assert_eq!(w.due(), Some(now + Duration::from_millis(2000)));

        let token = w.begin_tick().unwrap();
        assert!(matches!(
            w.observe(&token, Ok(agent(true)), now),
            TickOutcome::Ready(_)
        ));
        assert_eq!(w.state(), &WatchState::Idle);
        assert_eq!(w.due(), None);
        assert_eq!(w.begin_tick(), None);
    }

    #[test]
    fn test_ticks_do_not_overlap() {
        let now = Instant::now();
        let mut w = watcher();
        w.start("agent-42".into(), now);

        assert!(w.begin_tick().is_some());
        assert_eq!(w.due(), None);
        assert_eq!(w.begin_tick(), None);
        assert_eq!(w.ticks(), 1);
    }

    #[test]
    fn test_new_watch_discards_old_results() {
        let now = Instant::now();
        let mut w = watcher();
        w.start("agent-a".into(), now);
        let old = w.begin_tick().unwrap();

        assert_eq!(w.start("agent-b".into(), now), Some("agent-a".to_string()));
        assert!(matches!(
            w.observe(&old, Ok(agent(true)), now),
            TickOutcome::Stale
        ));
        assert_eq!(w.token(), Some("agent-b"));
        assert_eq!(w.begin_tick(), Some("agent-b".to_string()));
    }

    #[test]
    fn test_failed_fetch_keeps_watching() {
        let now = Instant::now();
        let mut w = watcher();
        w.start("agent-42".into(), now);
        let token = w.begin_tick().unwrap();

        let outcome = w.observe::<Agent>(
            &token,
            Err(StoreError::NotFound {
                kind: EntityKind::Agent,
                id: token.clone(),
            }),
            now,
        );
        assert!(matches!(outcome, TickOutcome::Inconclusive));
        assert_eq!(w.token(), Some("agent-42"));
        assert!(w.due().is_some());
    }

    #[test]
    fn test_stalls_after_timeout() {
        let now = Instant::now();
        let mut w = Watcher::new(Duration::from_millis(2000), Some(Duration::from_secs(5)));
        w.start("agent-42".into(), now);

        let token = w.begin_tick().unwrap();
        let later = now + Duration::from_secs(6);
        match w.observe(&token, Ok(agent(false)), later) {
            TickOutcome::Stalled { token } => assert_eq!(token, "agent-42"),
            other => panic!("expected stall, got {:?}", other),
        }
        assert_eq!(w.token(), None);
    }
}
