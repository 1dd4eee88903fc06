use std::sync::atomic::{AtomicU64, Ordering};

/// one bounded gauge
#[derive(Debug)]
pub struct ResourceLimit {
    current: AtomicU64,
    max: u64,
}

impl ResourceLimit {
    pub fn new(max: u64) -> Self {
        ResourceLimit {
            current: AtomicU64::new(0),
            max,
        }
    }

    /// take a unit if the budget allows
    pub fn try_inc(&self) -> bool {
        let mut current = self.current.load(Ordering::Relaxed);
        loop {
            if current >= self.max {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    pub fn dec(&self) {
        let previous = self.current.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "resource gauge underflow");
    }

    pub fn count(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn can_create(&self) -> bool {
        self.count() < self.max
    }
}

/// per-cluster budgets
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_connections: u64,
    pub max_pending_requests: u64,
    pub max_requests: u64,
    pub max_retries: u64,
    pub max_connection_pools: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            max_connections: 1024,
            max_pending_requests: 1024,
            max_requests: 1024,
            max_retries: 3,
            max_connection_pools: 1024,
        }
    }
}

/// tracks every countable thing a cluster may exhaust
#[derive(Debug)]
pub struct ResourceManager {
    pub connections: ResourceLimit,
    pub pending_requests: ResourceLimit,
    pub requests: ResourceLimit,
    pub retries: ResourceLimit,
    pub connection_pools: ResourceLimit,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        ResourceManager {
            connections: ResourceLimit::new(limits.max_connections),
            pending_requests: ResourceLimit::new(limits.max_pending_requests),
            requests: ResourceLimit::new(limits.max_requests),
            retries: ResourceLimit::new(limits.max_retries),
            connection_pools: ResourceLimit::new(limits.max_connection_pools),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_enforced() {
        let limit = ResourceLimit::new(2);
        assert!(limit.try_inc());
        assert!(limit.try_inc());
        assert!(!limit.try_inc());
        limit.dec();
        assert!(limit.try_inc());
        assert_eq!(limit.count(), 2);
    }
}
