//! The worker pool: slave records keyed by id, growth policy, liveness
//! bookkeeping, and message fan-out over the bus.

pub mod cgroup;
pub mod slave;
pub mod spawner;

use std::collections::HashMap;
use std::time::Instant;

use uuid::Uuid;

use crate::config::Policy;
use crate::rpc::{BusHandle, RpcMessage};
use slave::Slave;

pub use spawner::{SpawnContext, SpawnedSlave, Spawner};

#[derive(Default)]
pub struct Pool {
    slaves: HashMap<Uuid, Slave>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slave: Slave) {
        self.slaves.insert(slave.id(), slave);
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Slave> {
        self.slaves.get_mut(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.slaves.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    pub fn busy_count(&self) -> usize {
        self.slaves.values().filter(|s| s.is_busy()).count()
    }

    /// Any idle slave; the choice among several is arbitrary.
    pub fn find_idle(&self) -> Option<Uuid> {
        self.slaves.values().find(|s| s.is_idle()).map(|s| s.id())
    }

    /// Growth predicate, evaluated after a dispatch found no idle slave.
    /// An empty pool always grows; otherwise growth requires headroom under
    /// `pool_limit` and sustained queue pressure (the `* 2` term keeps a
    /// single straggler job from spawning against a barely-busy pool).
    pub fn wants_growth(&self, queue_len: usize, policy: &Policy) -> bool {
        self.slaves.is_empty()
            || (self.slaves.len() < policy.pool_limit
                && self.slaves.len() * policy.grow_threshold < queue_len * 2)
    }

    /// Send a message to every slave matching the predicate.
    pub fn multicast<F>(&self, predicate: F, bus: &BusHandle, message: &RpcMessage)
    where
        F: Fn(&Slave) -> bool,
    {
        for slave in self.slaves.values().filter(|s| predicate(s)) {
            bus.send(&slave.id(), message);
        }
    }

    /// Send a message to one slave matching the predicate, returning its id.
    pub fn unicast<F>(&self, predicate: F, bus: &BusHandle, message: &RpcMessage) -> Option<Uuid>
    where
        F: Fn(&Slave) -> bool,
    {
        let id = self.slaves.values().find(|s| predicate(s)).map(|s| s.id())?;
        bus.send(&id, message);
        Some(id)
    }

    /// The GC timeout pass: declare every slave past its liveness deadline
    /// dead, failing in-flight jobs. Returns how many died.
    pub fn expire_liveness(&mut self, now: Instant) -> usize {
        let mut died = 0;
        for slave in self.slaves.values_mut() {
            if slave.expire(now) {
                died += 1;
            }
        }
        died
    }

    /// Remove dead slaves from the map. Returns how many were reaped.
    pub fn reap_dead(&mut self) -> usize {
        let before = self.slaves.len();
        self.slaves.retain(|_, slave| !slave.is_dead());
        before - self.slaves.len()
    }

    /// Mark every slave dead (failing in-flight jobs) and clear the map.
    /// Used by engine termination after the terminate multicast.
    pub fn clear(&mut self) {
        for slave in self.slaves.values_mut() {
            slave.on_terminate();
        }
        self.slaves.clear();
    }
}
