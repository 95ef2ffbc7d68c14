//! Exclusive, time-bounded claims on player inventories
//!
//! This module tracks which instance currently owns each player's inventory:
//! - Granting and refreshing locks on behalf of instances
//! - Releasing locks held by the caller
//! - Sweeping locks whose deadline has passed
//! - Dropping every lock of an instance known to be gone
//!
//! The registry never trusts an instance to clean up after itself. A crashed
//! or partitioned instance simply stops renewing, and the expiry sweep hands
//! its players back to the cluster.

use log::{info, warn};
use shared::{InstanceId, LockDenial, PlayerKey, NOT_HOLDER};
use std::collections::HashMap;

/// A granted claim on one player's inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub player: PlayerKey,
    /// Instance allowed to download and upload this inventory
    pub holder: InstanceId,
    /// Unix milliseconds at which the current holder first obtained the lock
    pub acquired_at_ms: u64,
    /// Unix milliseconds from which the lock no longer counts
    pub expires_at_ms: u64,
}

impl Lock {
    /// Whether the lock still counts at `now_ms`
    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Outcome of an acquire attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted { expires_at_ms: u64 },
    Denied(LockDenial),
}

/// Outcome of a release attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotReleased { reason: &'static str },
}

/// Authority over which instance holds which player
///
/// All mutation goes through `&mut self`; the controller owns the registry
/// from a single task so operations on the same player never interleave.
pub struct LockRegistry {
    locks: HashMap<PlayerKey, Lock>,
    /// Lifetime used when an acquire does not ask for one, in seconds
    default_timeout_secs: u64,
    /// Longest lifetime an instance may ask for, in seconds
    max_timeout_secs: u64,
}

impl LockRegistry {
    pub fn new(default_timeout_secs: u64, max_timeout_secs: u64) -> Self {
        Self {
            locks: HashMap::new(),
            default_timeout_secs,
            max_timeout_secs,
        }
    }

    /// Grants or refreshes the lock on `player` for `instance`
    ///
    /// A lock held by the same instance is extended, which is how heartbeats
    /// work. A lock held by anyone else is a denial unless it has already
    /// run out, in which case it is reclaimed first.
    pub fn acquire(
        &mut self,
        player: &PlayerKey,
        instance: &InstanceId,
        requested_timeout_secs: Option<u64>,
        now_ms: u64,
    ) -> AcquireOutcome {
        let timeout = requested_timeout_secs.unwrap_or(self.default_timeout_secs);
        if timeout == 0 || timeout > self.max_timeout_secs {
            return AcquireOutcome::Denied(LockDenial::InvalidTimeout {
                requested: timeout,
                max: self.max_timeout_secs,
            });
        }

        self.reclaim_if_expired(player, now_ms);

        let expires_at_ms = now_ms.saturating_add(timeout.saturating_mul(1000));

        match self.locks.get_mut(player) {
            Some(lock) if lock.holder != *instance => {
                warn!(
                    "Lock on {} denied to {}: held by {} until {}",
                    player, instance, lock.holder, lock.expires_at_ms
                );
                AcquireOutcome::Denied(LockDenial::Held {
                    holder: lock.holder.clone(),
                })
            }
            Some(lock) => {
                lock.expires_at_ms = expires_at_ms;
                AcquireOutcome::Granted { expires_at_ms }
            }
            None => {
                info!("Lock on {} granted to {} for {}s", player, instance, timeout);
                self.locks.insert(
                    player.clone(),
                    Lock {
                        player: player.clone(),
                        holder: instance.clone(),
                        acquired_at_ms: now_ms,
                        expires_at_ms,
                    },
                );
                AcquireOutcome::Granted { expires_at_ms }
            }
        }
    }

    /// Drops the lock on `player` if `instance` holds it
    ///
    /// Releasing someone else's lock, or a lock that does not exist, changes
    /// nothing and is reported as informational.
    pub fn release(&mut self, player: &PlayerKey, instance: &InstanceId) -> ReleaseOutcome {
        match self.locks.get(player) {
            Some(lock) if lock.holder == *instance => {
                self.locks.remove(player);
                info!("Lock on {} released by {}", player, instance);
                ReleaseOutcome::Released
            }
            _ => ReleaseOutcome::NotReleased { reason: NOT_HOLDER },
        }
    }

    /// Removes and returns every lock whose deadline is at or before `now_ms`
    pub fn expiry_sweep(&mut self, now_ms: u64) -> Vec<Lock> {
        let expired: Vec<PlayerKey> = self
            .locks
            .values()
            .filter(|lock| !lock.is_live(now_ms))
            .map(|lock| lock.player.clone())
            .collect();

        expired
            .iter()
            .filter_map(|player| self.locks.remove(player))
            .inspect(|lock| {
                info!(
                    "Lock on {} held by {} expired",
                    lock.player, lock.holder
                )
            })
            .collect()
    }

    /// Drops every lock held by an instance that is known to be gone
    pub fn on_instance_disconnect(&mut self, instance: &InstanceId) -> Vec<Lock> {
        let held: Vec<PlayerKey> = self
            .locks
            .values()
            .filter(|lock| lock.holder == *instance)
            .map(|lock| lock.player.clone())
            .collect();

        let dropped: Vec<Lock> = held
            .iter()
            .filter_map(|player| self.locks.remove(player))
            .collect();

        if !dropped.is_empty() {
            info!(
                "Instance {} disconnected, dropped {} locks",
                instance,
                dropped.len()
            );
        }
        dropped
    }

    /// Holder of a lock on `player` that is still live at `now_ms`
    pub fn live_holder(&self, player: &PlayerKey, now_ms: u64) -> Option<&InstanceId> {
        self.locks
            .get(player)
            .filter(|lock| lock.is_live(now_ms))
            .map(|lock| &lock.holder)
    }

    pub fn get(&self, player: &PlayerKey) -> Option<&Lock> {
        self.locks.get(player)
    }

    /// Every lock currently on record, live or not yet swept
    pub fn locks(&self) -> impl Iterator<Item = &Lock> {
        self.locks.values()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn reclaim_if_expired(&mut self, player: &PlayerKey, now_ms: u64) {
        let expired = self
            .locks
            .get(player)
            .is_some_and(|lock| !lock.is_live(now_ms));

        if expired {
            if let Some(lock) = self.locks.remove(player) {
                info!(
                    "Lock on {} held by {} expired",
                    lock.player, lock.holder
                );
            }
        }
    }
}

/// Lock table tests
///
/// Time is passed explicitly in milliseconds so expiry boundaries can be
/// checked exactly.
#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SECOND: u64 = 1000;

    fn bob() -> PlayerKey {
        PlayerKey::new("Bob").unwrap()
    }

    fn a() -> InstanceId {
        InstanceId::from("instance-a")
    }

    fn b() -> InstanceId {
        InstanceId::from("instance-b")
    }

    fn registry() -> LockRegistry {
        LockRegistry::new(60, 3600)
    }

    #[test]
    fn test_acquire_free_player() {
        let mut registry = registry();
        let outcome = registry.acquire(&bob(), &a(), Some(60), 0);

        assert_eq!(
            outcome,
            AcquireOutcome::Granted {
                expires_at_ms: 60 * SECOND
            }
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.live_holder(&bob(), 0), Some(&a()));
    }

    #[test]
    fn test_second_instance_is_denied() {
        let mut registry = registry();
        registry.acquire(&bob(), &a(), Some(60), 0);

        let outcome = registry.acquire(&bob(), &b(), Some(60), SECOND);
        assert_eq!(
            outcome,
            AcquireOutcome::Denied(LockDenial::Held { holder: a() })
        );
        assert_eq!(registry.live_holder(&bob(), SECOND), Some(&a()));
    }

    #[test]
    fn test_reacquire_extends_expiry() {
        let mut registry = registry();
        registry.acquire(&bob(), &a(), Some(60), 0);

        let outcome = registry.acquire(&bob(), &a(), Some(60), 30 * SECOND);
        assert_eq!(
            outcome,
            AcquireOutcome::Granted {
                expires_at_ms: 90 * SECOND
            }
        );

        let lock = registry.get(&bob()).unwrap();
        assert_eq!(lock.acquired_at_ms, 0);
        assert_eq!(lock.expires_at_ms, 90 * SECOND);
    }

    #[test]
    fn test_default_timeout() {
        let mut registry = LockRegistry::new(45, 3600);
        let outcome = registry.acquire(&bob(), &a(), None, 1000);
        assert_eq!(
            outcome,
            AcquireOutcome::Granted {
                expires_at_ms: 46 * SECOND
            }
        );
    }

    #[test]
    fn test_invalid_timeouts() {
        let mut registry = registry();

        assert_eq!(
            registry.acquire(&bob(), &a(), Some(0), 0),
            AcquireOutcome::Denied(LockDenial::InvalidTimeout {
                requested: 0,
                max: 3600
            })
        );
        assert_eq!(
            registry.acquire(&bob(), &a(), Some(3601), 0),
            AcquireOutcome::Denied(LockDenial::InvalidTimeout {
                requested: 3601,
                max: 3600
            })
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_expiry_boundary() {
        let mut registry = registry();
        registry.acquire(&bob(), &a(), Some(60), 0);

        // One millisecond before the deadline the lock still counts
        assert!(matches!(
            registry.acquire(&bob(), &b(), Some(60), 60 * SECOND - 1),
            AcquireOutcome::Denied(_)
        ));

        // At the deadline it is reclaimable
        assert_eq!(
            registry.acquire(&bob(), &b(), Some(60), 60 * SECOND),
            AcquireOutcome::Granted {
                expires_at_ms: 120 * SECOND
            }
        );
        assert_eq!(registry.get(&bob()).unwrap().holder, b());
        assert_eq!(registry.get(&bob()).unwrap().acquired_at_ms, 60 * SECOND);
    }

    #[test]
    fn test_disconnect_without_release_recovers_by_expiry() {
        let mut registry = registry();
        registry.acquire(&bob(), &a(), Some(60), 0);

        let expired = registry.expiry_sweep(61 * SECOND);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].holder, a());

        assert_eq!(
            registry.acquire(&bob(), &b(), Some(60), 61 * SECOND),
            AcquireOutcome::Granted {
                expires_at_ms: 121 * SECOND
            }
        );
    }

    #[test]
    fn test_sweep_keeps_live_locks() {
        let mut registry = registry();
        let carol = PlayerKey::new("carol").unwrap();
        registry.acquire(&bob(), &a(), Some(10), 0);
        registry.acquire(&carol, &b(), Some(100), 0);

        let expired = registry.expiry_sweep(10 * SECOND);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].player, bob());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.live_holder(&carol, 10 * SECOND), Some(&b()));
    }

    #[test]
    fn test_release_by_holder() {
        let mut registry = registry();
        registry.acquire(&bob(), &a(), Some(60), 0);

        assert_eq!(registry.release(&bob(), &a()), ReleaseOutcome::Released);
        assert!(registry.is_empty());
        assert!(matches!(
            registry.acquire(&bob(), &b(), Some(60), SECOND),
            AcquireOutcome::Granted { .. }
        ));
    }

    #[test]
    fn test_release_by_non_holder_is_noop() {
        let mut registry = registry();
        registry.acquire(&bob(), &a(), Some(60), 0);

        assert_eq!(
            registry.release(&bob(), &b()),
            ReleaseOutcome::NotReleased { reason: "not-holder" }
        );
        assert_eq!(registry.live_holder(&bob(), 0), Some(&a()));

        let nobody = PlayerKey::new("nobody").unwrap();
        assert_eq!(
            registry.release(&nobody, &a()),
            ReleaseOutcome::NotReleased { reason: "not-holder" }
        );
    }

    #[test]
    fn test_instance_disconnect_drops_its_locks() {
        let mut registry = registry();
        let carol = PlayerKey::new("carol").unwrap();
        let dave = PlayerKey::new("dave").unwrap();
        registry.acquire(&bob(), &a(), Some(60), 0);
        registry.acquire(&carol, &a(), Some(60), 0);
        registry.acquire(&dave, &b(), Some(60), 0);

        let dropped = registry.on_instance_disconnect(&a());
        assert_eq!(dropped.len(), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.live_holder(&dave, 0), Some(&b()));
        assert!(matches!(
            registry.acquire(&bob(), &b(), Some(60), 0),
            AcquireOutcome::Granted { .. }
        ));
    }

    #[test]
    fn test_live_holder_ignores_expired_lock() {
        let mut registry = registry();
        registry.acquire(&bob(), &a(), Some(1), 0);
        assert_eq!(registry.live_holder(&bob(), 999), Some(&a()));
        assert_eq!(registry.live_holder(&bob(), SECOND), None);
    }

    /// Replays a pseudo random schedule of operations against a shadow
    /// model: a grant to one instance while another's grant is still live
    /// and unreleased would break exclusivity.
    #[test]
    fn test_mutual_exclusion_under_random_schedule() {
        let players: Vec<PlayerKey> = ["bob", "carol", "dave"]
            .iter()
            .map(|name| PlayerKey::new(name).unwrap())
            .collect();
        let instances: Vec<InstanceId> = ["a", "b", "c"]
            .iter()
            .map(|id| InstanceId::from(*id))
            .collect();

        let mut registry = LockRegistry::new(5, 10);
        let mut granted: HashMap<PlayerKey, (InstanceId, u64)> = HashMap::new();
        let mut now = 0u64;
        let mut rng = StdRng::seed_from_u64(0x2545_f491_4f6c_dd1d);

        for _ in 0..5_000 {
            let player = &players[rng.gen_range(0..players.len())];
            let instance = &instances[rng.gen_range(0..instances.len())];
            now += rng.gen_range(0..1500);

            match rng.gen_range(0..4) {
                0 | 1 => {
                    let timeout = rng.gen_range(1..=6);
                    if let AcquireOutcome::Granted { expires_at_ms } =
                        registry.acquire(player, instance, Some(timeout), now)
                    {
                        if let Some((holder, expires)) = granted.get(player) {
                            assert!(
                                holder == instance || *expires <= now,
                                "{} granted to {} while {} held it until {}",
                                player,
                                instance,
                                holder,
                                expires
                            );
                        }
                        granted.insert(player.clone(), (instance.clone(), expires_at_ms));
                    }
                }
                2 => {
                    if registry.release(player, instance) == ReleaseOutcome::Released {
                        granted.remove(player);
                    }
                }
                _ => {
                    for lock in registry.expiry_sweep(now) {
                        assert!(lock.expires_at_ms <= now);
                    }
                }
            }
        }
    }
}
