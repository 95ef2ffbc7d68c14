//! All sync sessions of one instance
//!
//! Each player gets its own [`SyncCoordinator`] behind its own mutex, so a
//! slow upload for one player never holds up a join or leave of another.

use crate::bridge::RconBridge;
use crate::coordinator::{SyncCoordinator, SyncState};
use crate::link::ControllerLink;
use log::{debug, info, warn};
use shared::config::InstanceConfig;
use shared::metrics::SyncMetrics;
use shared::{PlayerKey, Result, SyncError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

type SharedCoordinator = Arc<Mutex<SyncCoordinator>>;

pub struct InstanceSync {
    link: Arc<dyn ControllerLink>,
    bridge: Arc<dyn RconBridge>,
    config: InstanceConfig,
    metrics: Arc<SyncMetrics>,
    sessions: Mutex<HashMap<PlayerKey, SharedCoordinator>>,
    /// Players whose lock was kept after a failed checkin
    expiring: Mutex<HashSet<PlayerKey>>,
}

impl InstanceSync {
    pub fn new(
        link: Arc<dyn ControllerLink>,
        bridge: Arc<dyn RconBridge>,
        config: InstanceConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            link,
            bridge,
            config,
            metrics,
            sessions: Mutex::new(HashMap::new()),
            expiring: Mutex::new(HashSet::new()),
        }
    }

    async fn coordinator(&self, player: &PlayerKey) -> SharedCoordinator {
        let mut sessions = self.sessions.lock().await;
        let coordinator = sessions.entry(player.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(SyncCoordinator::new(
                player.clone(),
                Arc::clone(&self.link),
                Arc::clone(&self.bridge),
                self.config.clone(),
                Arc::clone(&self.metrics),
            )))
        });
        Arc::clone(coordinator)
    }

    /// Drops the map entry of `player` if it is still `coordinator` and idle
    ///
    /// Decided under the map lock; a coordinator that is locked by someone
    /// else is busy and stays.
    async fn forget_if_idle(&self, player: &PlayerKey, coordinator: &SharedCoordinator) {
        let mut sessions = self.sessions.lock().await;
        let idle = coordinator
            .try_lock()
            .map_or(false, |c| c.state() == SyncState::Idle);
        let current = sessions
            .get(player)
            .map_or(false, |c| Arc::ptr_eq(c, coordinator));
        if idle && current {
            sessions.remove(player);
        }
    }

    /// Checks out a player's inventory when they join this instance
    pub async fn player_joined(&self, player: &PlayerKey) -> Result<()> {
        let coordinator = self.coordinator(player).await;
        let mut guard = coordinator.lock().await;
        {
            // The entry may have been forgotten between lookup and lock
            let mut sessions = self.sessions.lock().await;
            let current = sessions
                .entry(player.clone())
                .or_insert_with(|| Arc::clone(&coordinator));
            if !Arc::ptr_eq(current, &coordinator) {
                return Err(SyncError::InvalidState(format!(
                    "another session of {} started concurrently",
                    player
                )));
            }
        }

        let result = guard.checkout().await;
        drop(guard);
        match &result {
            Ok(()) => {
                self.expiring.lock().await.remove(player);
            }
            Err(_) => self.forget_if_idle(player, &coordinator).await,
        }
        result
    }

    /// Checks a player's inventory back in when they leave this instance
    pub async fn player_left(&self, player: &PlayerKey) -> Result<u64> {
        let coordinator = self.coordinator(player).await;
        let mut guard = coordinator.lock().await;
        let was_checked_out = guard.state() == SyncState::AwaitingLocalChange;
        let result = guard.checkin().await;
        let abandoned = was_checked_out && result.is_err() && guard.state() == SyncState::Idle;
        drop(guard);

        if abandoned {
            self.expiring.lock().await.insert(player.clone());
        }
        self.forget_if_idle(player, &coordinator).await;
        result
    }

    /// Renews the locks of every checked out player
    ///
    /// Sessions busy with a transfer are skipped; they hold the lock for the
    /// duration anyway, and an expired lock surfaces as an upload rejection.
    pub async fn heartbeat_all(&self) {
        let coordinators: Vec<(PlayerKey, SharedCoordinator)> = self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(player, coordinator)| (player.clone(), Arc::clone(coordinator)))
            .collect();

        for (player, coordinator) in coordinators {
            let Ok(mut coordinator) = coordinator.try_lock() else {
                debug!("Skipping heartbeat for busy session of {}", player);
                continue;
            };
            if let Err(e) = coordinator.heartbeat().await {
                warn!("Heartbeat for {} failed: {}", player, e);
            }
        }
    }

    /// Spawns task that renews locks every heartbeat interval
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(sync.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                sync.heartbeat_all().await;
            }
        })
    }

    pub async fn state(&self, player: &PlayerKey) -> SyncState {
        let coordinator = self.sessions.lock().await.get(player).cloned();
        match coordinator {
            Some(coordinator) => coordinator.lock().await.state(),
            None => SyncState::Idle,
        }
    }

    pub async fn active_players(&self) -> Vec<PlayerKey> {
        let mut players: Vec<PlayerKey> = self.sessions.lock().await.keys().cloned().collect();
        players.sort();
        players
    }

    /// Abandons every session and tells the controller we are leaving
    ///
    /// The goodbye makes the controller drop every lock of this instance, so
    /// it is only sent when no lock guards a change that never reached the
    /// controller. Otherwise those locks are left to expire.
    pub async fn shutdown(&self) {
        let coordinators: Vec<(PlayerKey, SharedCoordinator)> =
            self.sessions.lock().await.drain().collect();
        info!("Shutting down with {} active sessions", coordinators.len());

        let mut expiring = self.expiring.lock().await;
        for (player, coordinator) in coordinators {
            if coordinator.lock().await.abort().await {
                expiring.insert(player);
            }
        }

        if !expiring.is_empty() {
            let mut players: Vec<&PlayerKey> = expiring.iter().collect();
            players.sort();
            warn!(
                "Not saying goodbye, locks of {:?} are left to expire",
                players.iter().map(|p| p.as_str()).collect::<Vec<_>>()
            );
            return;
        }
        if let Err(e) = self.link.goodbye().await {
            warn!("Goodbye to controller failed: {}", e);
        }
    }
}
