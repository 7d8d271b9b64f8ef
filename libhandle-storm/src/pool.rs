use crate::{proxy::Proxy, types::PoolConfig};
use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHealth {
    pub total: usize,
    pub under_threshold: usize,
    pub percentage: u8,
}

/// Point-in-time copy of one pool entry.
#[derive(Debug, Clone)]
pub struct PoolMember {
    pub proxy: Proxy,
    pub usage: u64,
    pub failures: u32,
    pub validated_at: Instant,
}

struct Entry {
    proxy: Proxy,
    usage: u64,
    failures: u32,
    validated_at: Instant,
    // Ticket of the most recent acquire, 0 if never acquired.
    last_acquired: u64,
}

impl Entry {
    fn admitted(proxy: Proxy, validated_at: Instant) -> Self {
        Self {
            proxy,
            usage: 0,
            failures: 0,
            validated_at,
            last_acquired: 0,
        }
    }
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    ticket: u64,
}

/// Registry of validated proxies with least-used selection.
///
/// All reads and writes go through one mutex that is only ever held for the
/// in-memory update, so `acquire` and `evict` never interleave.
pub struct ProxyPool {
    state: Mutex<State>,
    replaced: Notify,
    config: PoolConfig,
}

impl ProxyPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            replaced: Notify::new(),
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the proxy with the lowest usage count and bumps that count.
    ///
    /// Ties go to the proxy acquired least recently, then to the earliest
    /// admitted one.
    pub fn acquire(&self) -> Option<Proxy> {
        let mut state = self.state();
        state.ticket += 1;
        let ticket = state.ticket;

        let entry = state
            .entries
            .iter_mut()
            .min_by_key(|e| (e.usage, e.last_acquired))?;
        entry.usage += 1;
        entry.last_acquired = ticket;
        Some(entry.proxy.clone())
    }

    /// Removes `proxy` for good. Returns whether it was a member.
    pub fn evict(&self, proxy: &Proxy) -> bool {
        let mut state = self.state();
        let before = state.entries.len();
        state.entries.retain(|e| &e.proxy != proxy);
        state.entries.len() != before
    }

    /// Counts a failed lookup against `proxy`, evicting it once `threshold`
    /// consecutive failures have been seen. Returns whether it was evicted.
    pub fn record_failure(&self, proxy: &Proxy, threshold: u32) -> bool {
        let mut state = self.state();
        let Some(pos) = state.entries.iter().position(|e| &e.proxy == proxy) else {
            return false;
        };
        state.entries[pos].failures += 1;
        if state.entries[pos].failures >= threshold.max(1) {
            state.entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn record_success(&self, proxy: &Proxy) {
        if let Some(entry) = self.state().entries.iter_mut().find(|e| &e.proxy == proxy) {
            entry.failures = 0;
        }
    }

    /// Swaps in a freshly validated set. Duplicates are dropped, the set is
    /// truncated to the configured maximum, and every counter starts at zero.
    pub fn replace_all<I>(&self, proxies: I) -> usize
    where
        I: IntoIterator<Item = Proxy>,
    {
        let now = Instant::now();
        let mut seen = HashSet::new();
        let limit = match self.config.max_size {
            0 => usize::MAX,
            n => n,
        };

        let fresh: Vec<Entry> = proxies
            .into_iter()
            .filter(|p| seen.insert(p.clone()))
            .take(limit)
            .map(|proxy| Entry::admitted(proxy, now))
            .collect();
        let count = fresh.len();

        *self.state() = State {
            entries: fresh,
            ticket: 0,
        };
        self.replaced.notify_waiters();
        count
    }

    pub fn health_snapshot(&self) -> PoolHealth {
        let state = self.state();
        let total = state.entries.len();
        let under_threshold = state
            .entries
            .iter()
            .filter(|e| e.usage < self.config.reuse_ceiling)
            .count();
        let percentage = if total > 0 {
            (under_threshold * 100 / total) as u8
        } else {
            0
        };

        PoolHealth {
            total,
            under_threshold,
            percentage,
        }
    }

    pub fn members(&self) -> Vec<PoolMember> {
        self.state()
            .entries
            .iter()
            .map(|e| PoolMember {
                proxy: e.proxy.clone(),
                usage: e.usage,
                failures: e.failures,
                validated_at: e.validated_at,
            })
            .collect()
    }

    pub fn contains(&self, proxy: &Proxy) -> bool {
        self.state().entries.iter().any(|e| &e.proxy == proxy)
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// Like [`acquire`](Self::acquire), but waits up to `max_wait` for a
    /// `replace_all` to bring members in when the pool is empty.
    pub async fn wait_for_proxy(&self, max_wait: Duration) -> Option<Proxy> {
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let notified = self.replaced.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(proxy) = self.acquire() {
                return Some(proxy);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn proxy(n: u8) -> Proxy {
        Proxy::new(format!("10.0.0.{}", n), 8080)
    }

    fn pool_with(n: u8) -> ProxyPool {
        let pool = ProxyPool::default();
        pool.replace_all((1..=n).map(proxy));
        pool
    }

    /// Builds a pool whose members carry the given usage counts, acquired in
    /// member order.
    fn pool_with_usage(usage: &[u64]) -> ProxyPool {
        let pool = ProxyPool::default();
        let now = Instant::now();
        let mut state = pool.state();
        for (i, count) in usage.iter().enumerate() {
            let mut entry = Entry::admitted(proxy(i as u8 + 1), now);
            entry.usage = *count;
            if *count > 0 {
                state.ticket += 1;
                entry.last_acquired = state.ticket;
            }
            state.entries.push(entry);
        }
        drop(state);
        pool
    }

    fn usage(pool: &ProxyPool) -> Vec<u64> {
        pool.members().iter().map(|m| m.usage).collect()
    }

    #[test]
    fn acquire_on_empty_pool_returns_none() {
        assert!(ProxyPool::default().acquire().is_none());
    }

    #[test]
    fn acquire_spreads_usage_evenly_in_insertion_order() {
        let pool = pool_with(3);
        let picks: Vec<Proxy> = (0..6).filter_map(|_| pool.acquire()).collect();
        assert_eq!(picks, vec![proxy(1), proxy(2), proxy(3), proxy(1), proxy(2), proxy(3)]);
        assert_eq!(usage(&pool), vec![2, 2, 2]);
    }

    #[test]
    fn acquire_always_returns_global_minimum() {
        let pool = pool_with_usage(&[3, 0, 7, 1, 0]);
        for _ in 0..40 {
            let min = *usage(&pool).iter().min().unwrap();
            let picked = pool.acquire().unwrap();
            let member = pool.members().into_iter().find(|m| m.proxy == picked).unwrap();
            assert_eq!(member.usage, min + 1);
        }
    }

    #[test]
    fn least_recently_acquired_wins_ties() {
        let pool = pool_with_usage(&[0, 1, 2]);
        assert_eq!(pool.acquire(), Some(proxy(1)));
        assert_eq!(usage(&pool), vec![1, 1, 2]);
        // proxy(1) and proxy(2) now tie; proxy(2) was acquired longer ago.
        assert_eq!(pool.acquire(), Some(proxy(2)));
        assert_eq!(usage(&pool), vec![1, 2, 2]);
    }

    #[test]
    fn evict_is_idempotent() {
        let pool = pool_with(2);
        assert!(pool.evict(&proxy(1)));
        assert!(!pool.evict(&proxy(1)));
        assert!(!pool.evict(&proxy(42)));
        assert_eq!(pool.len(), 1);
        for _ in 0..5 {
            assert_eq!(pool.acquire(), Some(proxy(2)));
        }
    }

    #[test]
    fn replace_all_resets_counters_and_drops_stale_members() {
        let pool = pool_with(3);
        for _ in 0..9 {
            pool.acquire();
        }
        let count = pool.replace_all(vec![proxy(3), proxy(4), proxy(4)]);
        assert_eq!(count, 2);
        let members = pool.members();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].proxy, proxy(3));
        assert_eq!(members[1].proxy, proxy(4));
        assert!(members.iter().all(|m| m.usage == 0 && m.failures == 0));
        assert!(!pool.contains(&proxy(1)));
    }

    #[test]
    fn replace_all_respects_max_size() {
        let pool = ProxyPool::new(PoolConfig {
            max_size: 2,
            reuse_ceiling: 5,
        });
        assert_eq!(pool.replace_all((1..=5).map(proxy)), 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn health_snapshot_rounds_down() {
        let pool = pool_with(3);
        for _ in 0..15 {
            pool.acquire();
        }
        assert_eq!(
            pool.health_snapshot(),
            PoolHealth {
                total: 3,
                under_threshold: 0,
                percentage: 0
            }
        );

        assert_eq!(pool_with_usage(&[5, 4, 4]).health_snapshot().percentage, 66);
        assert_eq!(pool_with_usage(&[0, 0, 0, 9]).health_snapshot().percentage, 75);
        assert_eq!(pool_with_usage(&[0, 1]).health_snapshot().percentage, 100);
    }

    #[test]
    fn health_snapshot_of_empty_pool_is_zero() {
        assert_eq!(
            ProxyPool::default().health_snapshot(),
            PoolHealth {
                total: 0,
                under_threshold: 0,
                percentage: 0
            }
        );
    }

    #[test]
    fn record_failure_honours_threshold() {
        let pool = pool_with(1);
        assert!(!pool.record_failure(&proxy(1), 3));
        assert!(!pool.record_failure(&proxy(1), 3));
        pool.record_success(&proxy(1));
        assert!(!pool.record_failure(&proxy(1), 3));
        assert!(!pool.record_failure(&proxy(1), 3));
        assert!(pool.record_failure(&proxy(1), 3));
        assert!(pool.is_empty());
        assert!(!pool.record_failure(&proxy(1), 3));
    }

    #[tokio::test]
    async fn wait_for_proxy_wakes_on_replace() {
        let pool = Arc::new(ProxyPool::default());
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.wait_for_proxy(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.replace_all(vec![proxy(7)]);
        assert_eq!(waiter.await.unwrap(), Some(proxy(7)));
    }

    #[tokio::test]
    async fn wait_for_proxy_gives_up_after_max_wait() {
        let pool = ProxyPool::default();
        assert_eq!(pool.wait_for_proxy(Duration::from_millis(30)).await, None);
    }
}
