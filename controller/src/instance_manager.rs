//! Presence tracking for the instances talking to the controller
//!
//! This module remembers which instances have been heard from and where:
//! - Registration on `Hello` and on any other request
//! - Last-seen bookkeeping for logging and stats
//! - Removal on an explicit `Goodbye`
//!
//! Silence is only ever reported, never acted upon. An instance that stops
//! talking keeps its locks until they expire; only a `Goodbye` counts as a
//! positive disconnect.

use log::info;
use shared::InstanceId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One instance known to the controller
#[derive(Debug)]
pub struct InstanceInfo {
    pub id: InstanceId,
    /// Address responses are routed to
    pub addr: SocketAddr,
    /// Last time any request arrived from this instance
    pub last_seen: Instant,
}

impl InstanceInfo {
    pub fn new(id: InstanceId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    pub fn is_silent(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

#[derive(Default)]
pub struct InstanceManager {
    instances: HashMap<InstanceId, InstanceInfo>,
}

impl InstanceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records activity from `id` at `addr`
    ///
    /// Returns true when the instance was not known before. An instance that
    /// restarted on a new port simply has its address updated.
    pub fn touch(&mut self, id: &InstanceId, addr: SocketAddr) -> bool {
        match self.instances.get_mut(id) {
            Some(info) => {
                if info.addr != addr {
                    info!("Instance {} moved from {} to {}", id, info.addr, addr);
                    info.addr = addr;
                }
                info.last_seen = Instant::now();
                false
            }
            None => {
                info!("Instance {} connected from {}", id, addr);
                self.instances
                    .insert(id.clone(), InstanceInfo::new(id.clone(), addr));
                true
            }
        }
    }

    /// Forgets an instance, returning whether it was known
    pub fn remove(&mut self, id: &InstanceId) -> bool {
        if self.instances.remove(id).is_some() {
            info!("Instance {} disconnected", id);
            true
        } else {
            false
        }
    }

    /// Instances that have not been heard from within `timeout`
    pub fn silent(&self, timeout: Duration) -> Vec<InstanceId> {
        self.instances
            .values()
            .filter(|info| info.is_silent(timeout))
            .map(|info| info.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
