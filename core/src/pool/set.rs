//! The ordered pool collection and the strategy that picks from it.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use super::{Pool, PoolStatus, Strategy};
use crate::config::PoolProtocol;
use crate::error::{EngineError, Result};

/// Weight of the most recent window when decaying balance shares.
const UTILITY_WEIGHT: f64 = 0.63;

struct PoolEntry {
    pool: Arc<Pool>,
    /// 0 is the most preferred.
    priority: usize,
    status: PoolStatus,
    quota: u32,
    quota_used: u64,
    /// Balance counter, bumped per selection and decayed periodically.
    shares: f64,
    utility: f64,
}

impl PoolEntry {
    fn usable(&self) -> bool {
        self.status == PoolStatus::Enabled && !self.pool.is_idle()
    }
}

struct Donation {
    pool: Arc<Pool>,
    percent: f64,
    issued: u64,
    total: u64,
}

struct Inner {
    entries: Vec<PoolEntry>,
    current: usize,
    strategy: Strategy,
    fail_only: bool,
    quota_gcd: u32,
    quota_cursor: usize,
    donation: Option<Donation>,
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

impl Inner {
    fn index_of(&self, id: usize) -> Option<usize> {
        self.entries.iter().position(|e| e.pool.id == id)
    }

    fn usable(&self, idx: usize) -> bool {
        self.entries.get(idx).is_some_and(PoolEntry::usable)
    }

    fn priority_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by_key(|&i| self.entries[i].priority);
        order
    }

    fn first_usable_by_priority(&self) -> Option<usize> {
        self.priority_order().into_iter().find(|&i| self.usable(i))
    }

    /// Next usable pool in list order after `idx`, wrapping around to `idx`.
    fn next_usable_after(&self, idx: usize) -> Option<usize> {
        let n = self.entries.len();
        (1..=n).map(|step| (idx + step) % n).find(|&i| self.usable(i))
    }

    /// Move `idx` to priority 0, shifting the pools it overtakes down one.
    fn promote(&mut self, idx: usize) {
        let old = self.entries[idx].priority;
        for entry in &mut self.entries {
            if entry.priority < old {
                entry.priority += 1;
            }
        }
        self.entries[idx].priority = 0;
    }

    fn quota_share(&self, idx: usize) -> u64 {
        (self.entries[idx].quota / self.quota_gcd.max(1)) as u64
    }

    fn adjust_quota_gcd(&mut self) {
        let new = self
            .entries
            .iter()
            .map(|e| e.quota)
            .filter(|q| *q > 0)
            .fold(0, gcd)
            .max(1);
        let old = self.quota_gcd.max(1);
        if new != old {
            for entry in &mut self.entries {
                entry.quota_used = entry.quota_used * old as u64 / new as u64;
            }
        }
        self.quota_gcd = new;
        debug!("Quota gcd is now {}", new);
    }

    fn take_donation(&mut self) -> Option<Arc<Pool>> {
        let donation = self.donation.as_mut()?;
        donation.total += 1;
        if donation.pool.is_idle() {
            return None;
        }
        let allowed = donation.total as f64 * donation.percent / 100.0;
        if (donation.issued + 1) as f64 <= allowed {
            donation.issued += 1;
            return Some(Arc::clone(&donation.pool));
        }
        None
    }

    fn select_balance(&mut self) -> usize {
        let mut best: Option<usize> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if !entry.usable() {
                continue;
            }
            if best.map_or(true, |b| entry.shares < self.entries[b].shares) {
                best = Some(i);
            }
        }
        let idx = best.unwrap_or(self.current);
        self.entries[idx].shares += 1.0;
        idx
    }

    fn select_quota(&mut self) -> usize {
        let n = self.entries.len();
        for _ in 0..2 {
            let mut quota_left = false;
            for _ in 0..n {
                let idx = self.quota_cursor % n;
                self.quota_cursor = (idx + 1) % n;
                if self.entries[idx].quota_used >= self.quota_share(idx) {
                    continue;
                }
                quota_left = true;
                self.entries[idx].quota_used += 1;
                if self.usable(idx) {
                    return idx;
                }
                if self.fail_only {
                    // the skipped slot goes to the preferred pool instead
                    if let Some(first) = self.first_usable_by_priority() {
                        return first;
                    }
                }
            }
            if quota_left {
                break;
            }
            for entry in &mut self.entries {
                entry.quota_used = 0;
            }
            self.quota_cursor = (self.quota_cursor + 1) % n;
        }
        self.first_usable_by_priority().unwrap_or(self.current)
    }
}

/// Read-only view of one pool for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub id: usize,
    pub url: String,
    pub user: String,
    pub protocol: PoolProtocol,
    pub priority: usize,
    pub status: PoolStatus,
    pub idle: bool,
    pub lagging: bool,
    pub current: bool,
    pub quota: u32,
    pub quota_used: u64,
    pub staged: usize,
    pub seq_rejects: u32,
    pub seq_getfails: u32,
    pub fetch_latency_ms: u64,
    pub session_active: bool,
    pub share_difficulty: f64,
}

/// Pools plus the active strategy and the current-pool pointer, all behind
/// one read-write lock.
pub struct PoolSet {
    inner: RwLock<Inner>,
    changed: watch::Sender<u64>,
}

impl PoolSet {
    /// `pools` are `(pool, quota, enabled)` in priority order.
    pub fn new(pools: Vec<(Arc<Pool>, u32, bool)>, strategy: Strategy, fail_only: bool) -> Result<Self> {
        if pools.is_empty() {
            return Err(EngineError::NoUsablePools);
        }
        let entries = pools
            .into_iter()
            .enumerate()
            .map(|(priority, (pool, quota, enabled))| PoolEntry {
                pool,
                priority,
                status: if enabled { PoolStatus::Enabled } else { PoolStatus::Disabled },
                quota,
                quota_used: 0,
                shares: 0.0,
                utility: 0.0,
            })
            .collect();
        let mut inner = Inner {
            entries,
            current: 0,
            strategy,
            fail_only,
            quota_gcd: 1,
            quota_cursor: 0,
            donation: None,
        };
        inner.adjust_quota_gcd();
        if let Some(first) = inner.first_usable_by_priority() {
            inner.current = first;
        }
        let (changed, _) = watch::channel(0);
        Ok(Self {
            inner: RwLock::new(inner),
            changed,
        })
    }

    /// Append a pool in the next priority slot.
    pub fn add_pool(&self, pool: Arc<Pool>, quota: u32) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.index_of(pool.id).is_some() {
            return Err(EngineError::Config(format!("pool id {} already exists", pool.id)));
        }
        let priority = inner.entries.len();
        info!("Added pool {}: {}", pool.id, pool.url);
        inner.entries.push(PoolEntry {
            pool,
            priority,
            status: PoolStatus::Enabled,
            quota,
            quota_used: 0,
            shares: 0.0,
            utility: 0.0,
        });
        inner.adjust_quota_gcd();
        Ok(())
    }

    pub fn set_donation(&self, pool: Arc<Pool>, percent: f64) {
        self.inner.write().donation = Some(Donation {
            pool,
            percent: percent.clamp(0.0, 100.0),
            issued: 0,
            total: 0,
        });
    }

    pub fn donation_pool(&self) -> Option<Arc<Pool>> {
        self.inner.read().donation.as_ref().map(|d| Arc::clone(&d.pool))
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: usize) -> Option<Arc<Pool>> {
        let inner = self.inner.read();
        inner.index_of(id).map(|i| Arc::clone(&inner.entries[i].pool))
    }

    /// Pools in list order.
    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.inner.read().entries.iter().map(|e| Arc::clone(&e.pool)).collect()
    }

    pub fn by_priority(&self) -> Vec<Arc<Pool>> {
        let inner = self.inner.read();
        inner
            .priority_order()
            .into_iter()
            .map(|i| Arc::clone(&inner.entries[i].pool))
            .collect()
    }

    pub fn current(&self) -> Arc<Pool> {
        let inner = self.inner.read();
        Arc::clone(&inner.entries[inner.current].pool)
    }

    pub fn current_id(&self) -> usize {
        let inner = self.inner.read();
        inner.entries[inner.current].pool.id
    }

    pub fn is_current(&self, id: usize) -> bool {
        self.current_id() == id
    }

    pub fn strategy(&self) -> Strategy {
        self.inner.read().strategy
    }

    pub fn fail_only(&self) -> bool {
        self.inner.read().fail_only
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        {
            let mut inner = self.inner.write();
            if inner.strategy == strategy {
                return;
            }
            inner.strategy = strategy;
        }
        info!("Switched pool strategy to {}", strategy);
        self.switch_pools(None);
    }

    pub fn status(&self, id: usize) -> Option<PoolStatus> {
        let inner = self.inner.read();
        inner.index_of(id).map(|i| inner.entries[i].status)
    }

    pub fn priority(&self, id: usize) -> Option<usize> {
        let inner = self.inner.read();
        inner.index_of(id).map(|i| inner.entries[i].priority)
    }

    pub fn quota(&self, id: usize) -> Option<u32> {
        let inner = self.inner.read();
        inner.index_of(id).map(|i| inner.entries[i].quota)
    }

    pub fn quota_used(&self, id: usize) -> Option<u64> {
        let inner = self.inner.read();
        inner.index_of(id).map(|i| inner.entries[i].quota_used)
    }

    pub fn quota_gcd(&self) -> u32 {
        self.inner.read().quota_gcd
    }

    pub fn set_quota(&self, id: usize, quota: u32) -> Result<()> {
        let mut inner = self.inner.write();
        let idx = inner
            .index_of(id)
            .ok_or_else(|| EngineError::Config(format!("no pool with id {}", id)))?;
        inner.entries[idx].quota = quota;
        inner.adjust_quota_gcd();
        info!("Pool {} quota set to {}", id, quota);
        Ok(())
    }

    pub fn adjust_quota_gcd(&self) {
        self.inner.write().adjust_quota_gcd();
    }

    pub fn enabled_count(&self) -> usize {
        self.inner
            .read()
            .entries
            .iter()
            .filter(|e| e.status == PoolStatus::Enabled)
            .count()
    }

    pub fn any_usable(&self) -> bool {
        self.inner.read().entries.iter().any(PoolEntry::usable)
    }

    /// Receiver that ticks every time pools are switched.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// Pick the pool for the next job request. Never blocks; when nothing
    /// is usable it falls back to the current pool.
    pub fn select_pool(&self, lagging: bool) -> Arc<Pool> {
        let mut inner = self.inner.write();
        if let Some(pool) = inner.take_donation() {
            return pool;
        }
        let single = !lagging || inner.fail_only;
        let strategy = inner.strategy;
        let idx = match strategy {
            Strategy::Balance => inner.select_balance(),
            Strategy::Quota => inner.select_quota(),
            Strategy::Failover if single => inner.first_usable_by_priority().unwrap_or(inner.current),
            _ if single && inner.usable(inner.current) => inner.current,
            _ => inner.next_usable_after(inner.current).unwrap_or(inner.current),
        };
        Arc::clone(&inner.entries[idx].pool)
    }

    /// Recompute the current pool, optionally promoting `selected` to the
    /// top priority first, then wake anyone watching for pool changes.
    pub fn switch_pools(&self, selected: Option<usize>) -> Arc<Pool> {
        let (pool, changed, fail_only) = {
            let mut inner = self.inner.write();
            let old = inner.current;
            let selected = selected.and_then(|id| inner.index_of(id));
            if let Some(idx) = selected {
                inner.promote(idx);
            }
            let strategy = inner.strategy;
            let next = match strategy {
                Strategy::Failover | Strategy::Balance | Strategy::Quota => {
                    inner.first_usable_by_priority()
                }
                Strategy::RoundRobin | Strategy::Rotate => match selected {
                    Some(idx) if inner.usable(idx) => Some(idx),
                    _ => inner.next_usable_after(old),
                },
            };
            if let Some(next) = next {
                inner.current = next;
            }
            (
                Arc::clone(&inner.entries[inner.current].pool),
                inner.current != old,
                inner.fail_only,
            )
        };

        if fail_only {
            pool.set_lagging(true);
        }
        if changed {
            info!("Switching to pool {}: {}", pool.id, pool.url);
        }
        self.changed.send_modify(|epoch| *epoch += 1);
        pool
    }

    /// The pool stopped answering. Returns false if it was already idle.
    pub fn mark_dead(&self, id: usize) -> bool {
        let Some(pool) = self.get(id) else {
            return false;
        };
        if pool.set_idle(true) {
            return false;
        }
        warn!("Pool {} {} not responding!", pool.id, pool.url);
        if self.is_current(id) {
            self.switch_pools(None);
        }
        true
    }

    pub fn mark_recovered(&self, id: usize) {
        let Some(pool) = self.get(id) else {
            return;
        };
        if pool.set_idle(false) {
            info!("Pool {} {} alive", pool.id, pool.url);
        }
        let failback = {
            let inner = self.inner.read();
            let better = match inner.index_of(id) {
                Some(idx) => inner.entries[idx].priority < inner.entries[inner.current].priority,
                None => false,
            };
            (inner.strategy == Strategy::Failover && better) || !inner.usable(inner.current)
        };
        if failback {
            self.switch_pools(None);
        }
    }

    /// Auto-disable after too many rejects.
    pub fn mark_rejecting(&self, id: usize) {
        let was_current = {
            let mut inner = self.inner.write();
            let Some(idx) = inner.index_of(id) else {
                return;
            };
            if inner.entries[idx].status != PoolStatus::Enabled {
                return;
            }
            inner.entries[idx].status = PoolStatus::Rejecting;
            inner.current == idx
        };
        warn!("Pool {} rejecting too many shares, disabling", id);
        if was_current {
            self.switch_pools(None);
        }
    }

    pub fn enable_pool(&self, id: usize) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let idx = inner
                .index_of(id)
                .ok_or_else(|| EngineError::Config(format!("no pool with id {}", id)))?;
            inner.entries[idx].status = PoolStatus::Enabled;
        }
        info!("Enabled pool {}", id);
        self.switch_pools(None);
        Ok(())
    }

    pub fn disable_pool(&self, id: usize) -> Result<()> {
        let was_current = {
            let mut inner = self.inner.write();
            let idx = inner
                .index_of(id)
                .ok_or_else(|| EngineError::Config(format!("no pool with id {}", id)))?;
            inner.entries[idx].status = PoolStatus::Disabled;
            inner.current == idx
        };
        info!("Disabled pool {}", id);
        if was_current {
            self.switch_pools(None);
        }
        Ok(())
    }

    /// Fold recent balance selections into a decaying utility.
    pub fn decay_shares(&self) {
        let mut inner = self.inner.write();
        for entry in &mut inner.entries {
            entry.utility = (entry.utility + entry.shares * UTILITY_WEIGHT) / (1.0 + UTILITY_WEIGHT);
            entry.shares = entry.utility;
        }
    }

    pub fn snapshot(&self) -> Vec<PoolSnapshot> {
        let inner = self.inner.read();
        inner
            .priority_order()
            .into_iter()
            .map(|i| {
                let entry = &inner.entries[i];
                let pool = &entry.pool;
                let state = pool.state();
                PoolSnapshot {
                    id: pool.id,
                    url: pool.url.clone(),
                    user: pool.user.clone(),
                    protocol: pool.protocol,
                    priority: entry.priority,
                    status: entry.status,
                    idle: pool.is_idle(),
                    lagging: pool.is_lagging(),
                    current: i == inner.current,
                    quota: entry.quota,
                    quota_used: entry.quota_used,
                    staged: pool.staged(),
                    seq_rejects: state.seq_rejects,
                    seq_getfails: state.seq_getfails,
                    fetch_latency_ms: state.fetch_latency.as_millis() as u64,
                    session_active: state.session.active,
                    share_difficulty: state.share_difficulty,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_pool;

    fn set_of(quotas: &[u32], strategy: Strategy) -> PoolSet {
        let pools = quotas
            .iter()
            .enumerate()
            .map(|(i, q)| (test_pool(i), *q, true))
            .collect();
        PoolSet::new(pools, strategy, false).unwrap()
    }

    #[test]
    fn test_empty_set_rejected() {
        assert!(PoolSet::new(Vec::new(), Strategy::Failover, false).is_err());
    }

    #[test]
    fn test_failover_prefers_priority() {
        let set = set_of(&[1, 1, 1], Strategy::Failover);
        assert_eq!(set.select_pool(false).id, 0);
        set.mark_dead(0);
        assert_eq!(set.current_id(), 1);
        assert_eq!(set.select_pool(false).id, 1);
        set.mark_recovered(0);
        assert_eq!(set.current_id(), 0);
    }

    #[test]
    fn test_quota_fairness() {
        let set = set_of(&[1, 2, 3], Strategy::Quota);
        let mut counts = [0usize; 3];
        for _ in 0..600 {
            counts[set.select_pool(false).id] += 1;
        }
        assert_eq!(counts, [100, 200, 300]);
    }

    #[test]
    fn test_quota_fairness_with_common_factor() {
        let set = set_of(&[4, 2, 6], Strategy::Quota);
        assert_eq!(set.quota_gcd(), 2);
        let mut counts = [0usize; 3];
        for _ in 0..60 {
            counts[set.select_pool(false).id] += 1;
        }
        assert_eq!(counts, [20, 10, 30]);
    }

    #[test]
    fn test_quota_gcd_rescales_progress() {
        let set = set_of(&[4, 8], Strategy::Quota);
        assert_eq!(set.quota_gcd(), 4);
        set.select_pool(false);
        assert_eq!(set.quota_used(0), Some(1));
        set.set_quota(1, 6).unwrap();
        assert_eq!(set.quota_gcd(), 2);
        assert_eq!(set.quota_used(0), Some(2));
    }

    #[test]
    fn test_quota_gcd_never_zero() {
        let set = set_of(&[0, 0], Strategy::Quota);
        assert_eq!(set.quota_gcd(), 1);
        // nothing has quota, so selection falls back on priority
        assert_eq!(set.select_pool(false).id, 0);
    }

    #[test]
    fn test_quota_skips_dead_pool() {
        let set = set_of(&[1, 1], Strategy::Quota);
        set.mark_dead(1);
        for _ in 0..10 {
            assert_eq!(set.select_pool(false).id, 0);
        }
    }

    #[test]
    fn test_balance_picks_fewest_shares() {
        let set = set_of(&[1, 1, 1], Strategy::Balance);
        let picks: Vec<usize> = (0..6).map(|_| set.select_pool(false).id).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
        set.decay_shares();
        assert_eq!(set.select_pool(false).id, 0);
    }

    #[test]
    fn test_round_robin_advances_on_switch() {
        let set = set_of(&[1, 1, 1], Strategy::RoundRobin);
        assert_eq!(set.current_id(), 0);
        assert_eq!(set.switch_pools(None).id, 1);
        assert_eq!(set.switch_pools(None).id, 2);
        assert_eq!(set.switch_pools(None).id, 0);
        assert_eq!(set.select_pool(false).id, 0);
        // lagging spills over onto the next pool
        assert_eq!(set.select_pool(true).id, 1);
    }

    #[test]
    fn test_switch_promotes_selected() {
        let set = set_of(&[1, 1, 1], Strategy::Failover);
        set.switch_pools(Some(2));
        assert_eq!(set.current_id(), 2);
        assert_eq!(set.priority(2), Some(0));
        assert_eq!(set.priority(0), Some(1));
        assert_eq!(set.priority(1), Some(2));
    }

    #[test]
    fn test_switch_broadcasts() {
        let set = set_of(&[1, 1], Strategy::Failover);
        let rx = set.subscribe();
        let before = *rx.borrow();
        set.switch_pools(None);
        assert_eq!(*rx.borrow(), before + 1);
    }

    #[test]
    fn test_rejecting_pool_switches_away() {
        let set = set_of(&[1, 1, 1], Strategy::Failover);
        set.mark_rejecting(0);
        assert_eq!(set.status(0), Some(PoolStatus::Rejecting));
        assert_eq!(set.current_id(), 1);
        assert_eq!(set.enabled_count(), 2);
        set.enable_pool(0).unwrap();
        assert_eq!(set.current_id(), 0);
    }

    #[test]
    fn test_all_disabled_falls_back_to_current() {
        let set = set_of(&[1, 1], Strategy::Failover);
        set.disable_pool(0).unwrap();
        set.disable_pool(1).unwrap();
        assert!(!set.any_usable());
        let pool = set.select_pool(false);
        assert_eq!(pool.id, set.current_id());
    }

    #[test]
    fn test_donation_share() {
        let set = set_of(&[1], Strategy::Failover);
        set.set_donation(test_pool(99), 10.0);
        let donated = (0..1000).filter(|_| set.select_pool(false).id == 99).count();
        assert_eq!(donated, 100);
    }
}
