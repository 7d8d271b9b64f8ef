use crate::proxy::Proxy;
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// One token bucket per egress proxy, so no single proxy is driven faster
/// than the configured rate no matter how many workers pick it.
pub struct ProxyRateLimiters {
    limiters: DashMap<Proxy, Arc<Limiter>>,
    quota: Quota,
}

impl ProxyRateLimiters {
    pub fn new(rate_per_second: u32) -> Self {
        let rate = NonZeroU32::new(rate_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiters: DashMap::new(),
            quota: Quota::per_second(rate),
        }
    }

    pub async fn acquire(&self, proxy: &Proxy) {
        let limiter = self.get_or_create(proxy);
        limiter.until_ready().await;
    }

    pub fn forget(&self, proxy: &Proxy) {
        self.limiters.remove(proxy);
    }

    /// Keeps only the limiters whose proxy satisfies `keep`.
    pub fn retain(&self, keep: impl Fn(&Proxy) -> bool) {
        self.limiters.retain(|proxy, _| keep(proxy));
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    fn get_or_create(&self, proxy: &Proxy) -> Arc<Limiter> {
        self.limiters
            .entry(proxy.clone())
            .or_insert_with(|| Arc::new(RateLimiter::direct(self.quota)))
            .clone()
    }
}
