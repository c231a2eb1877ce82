//! Folk liveness tracking and the periodic presence tasks.
//!
//! ## Architecture
//!
//! ```text
//!   folk                               scribe
//!  ───────                            ────────
//!  heartbeat task ──Heartbeat──►  PresenceTable::see()
//!   (every 30s)                         │
//!                                 scan task (every 30s)
//!                                       │  PresenceTable::scan(now, 8s)
//!                                       ▼
//!                  ◄──FolkLore{gone}── participants
//! ```
//!
//! Both tasks run on every peer for the lifetime of a session and check the
//! peer's role on each tick, so a role change needs no task restart.
//!
//! Times are `tokio::time::Instant`, which follows the paused test clock.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use scriptorium_core::PeerId;

/// Presence timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    /// How often the scribe scans for silent folks.
    pub scan_interval: Duration,
    /// How often a folk signals the scribe.
    pub heartbeat_interval: Duration,
    /// Silence after which the scribe declares a folk gone.
    pub outstanding_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            outstanding_timeout: Duration::from_secs(8),
        }
    }
}

/// What the scribe knows about one folk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolkPresence {
    pub last_seen: Instant,
    pub in_session: bool,
}

/// Result of [`PresenceTable::see`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// First message from this folk.
    New,
    /// Folk had been declared gone and is back.
    Returned,
    /// Already in session; `last_seen` refreshed.
    Refreshed,
}

/// Scribe-side table of folks, keyed by peer.
#[derive(Debug, Default, Clone)]
pub struct PresenceTable {
    folks: HashMap<PeerId, FolkPresence>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message from `peer` at `now` and mark it in session.
    pub fn see(&mut self, peer: PeerId, now: Instant) -> Sighting {
        match self.folks.get_mut(&peer) {
            Some(folk) => {
                folk.last_seen = now;
                if folk.in_session {
                    Sighting::Refreshed
                } else {
                    folk.in_session = true;
                    Sighting::Returned
                }
            }
            None => {
                self.folks.insert(peer, FolkPresence { last_seen: now, in_session: true });
                Sighting::New
            }
        }
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<FolkPresence> {
        self.folks.remove(peer)
    }

    /// Mark every in-session folk silent for longer than `timeout` as gone
    /// and return them, sorted.
    pub fn scan(&mut self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        let mut gone: Vec<PeerId> = self
            .folks
            .iter_mut()
            .filter(|(_, f)| f.in_session && now.saturating_duration_since(f.last_seen) > timeout)
            .map(|(peer, f)| {
                f.in_session = false;
                *peer
            })
            .collect();
        gone.sort();
        gone
    }

    /// Folks currently in session, sorted.
    pub fn in_session(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .folks
            .iter()
            .filter(|(_, f)| f.in_session)
            .map(|(p, _)| *p)
            .collect();
        peers.sort();
        peers
    }

    /// Every folk in the table, including those declared gone, sorted.
    pub fn known(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.folks.keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn get(&self, peer: &PeerId) -> Option<&FolkPresence> {
        self.folks.get(peer)
    }

    pub fn len(&self) -> usize {
        self.folks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folks.is_empty()
    }
}

/// A cancellable periodic task.
///
/// The first tick fires one `period` after spawning. Dropping the handle
/// also ends the loop at its next wake-up.
pub struct ScheduledTask {
    name: &'static str,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel, mut cancelled) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.changed() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            log::debug!("{name} task stopped");
        });
        Self { name, cancel, handle }
    }

    /// Ask the task to stop without waiting for it.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop the task and wait until any in-flight tick has finished.
    pub async fn stop(self) {
        self.cancel();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                log::error!("{} task failed: {e}", self.name);
            }
        }
    }
}

/// The scan and heartbeat tasks of one session.
pub struct PresenceTimers {
    scan: ScheduledTask,
    heartbeat: ScheduledTask,
}

impl PresenceTimers {
    pub fn start<S, SFut, H, HFut>(config: &PresenceConfig, scan_tick: S, heartbeat_tick: H) -> Self
    where
        S: FnMut() -> SFut + Send + 'static,
        SFut: Future<Output = ()> + Send + 'static,
        H: FnMut() -> HFut + Send + 'static,
        HFut: Future<Output = ()> + Send + 'static,
    {
        Self {
            scan: ScheduledTask::spawn_periodic("presence scan", config.scan_interval, scan_tick),
            heartbeat: ScheduledTask::spawn_periodic("heartbeat", config.heartbeat_interval, heartbeat_tick),
        }
    }

    /// Signal both tasks to stop. Safe to call while holding locks the
    /// ticks need.
    pub fn cancel(&self) {
        self.scan.cancel();
        self.heartbeat.cancel();
    }

    /// Stop both tasks and wait for them to exit.
    pub async fn stop(self) {
        self.scan.stop().await;
        self.heartbeat.stop().await;
    }
}
