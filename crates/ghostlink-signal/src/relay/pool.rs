//! Ordered pool of relay endpoints with failover.
//!
//! Endpoints keep their configured order for the lifetime of the pool.
//! A failed endpoint is skipped until [`EndpointPool::reset`].

/// Relay endpoint entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    /// Endpoint address (URL)
    pub address: String,
    /// Whether a connect attempt failed in the current pass
    pub failed: bool,
}

/// Pool status snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of endpoints
    pub total: usize,
    /// Endpoints not marked failed
    pub active: usize,
    /// Endpoints marked failed
    pub failed: usize,
    /// Cursor position
    pub current_index: usize,
}

/// Relay endpoint pool
#[derive(Debug, Clone)]
pub struct EndpointPool {
    endpoints: Vec<RelayEndpoint>,
    current: usize,
}

impl EndpointPool {
    /// Create a pool from addresses in preference order
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: addresses
                .into_iter()
                .map(|a| RelayEndpoint {
                    address: a.into(),
                    failed: false,
                })
                .collect(),
            current: 0,
        }
    }

    /// First non-failed endpoint at or after the cursor
    ///
    /// Returns `None` once every endpoint has failed in the current pass.
    #[must_use]
    pub fn get_current(&self) -> Option<&str> {
        self.find_from(0).map(|i| self.endpoints[i].address.as_str())
    }

    /// Move the cursor to the next non-failed endpoint
    ///
    /// Wraps around at most once; returns `None` if no endpoint remains.
    pub fn advance(&mut self) -> Option<&str> {
        let idx = self.find_from(1)?;
        self.current = idx;
        Some(self.endpoints[idx].address.as_str())
    }

    /// Mark an endpoint as failed
    ///
    /// Returns `false` if the address is not in the pool.
    pub fn mark_failed(&mut self, address: &str) -> bool {
        match self.endpoints.iter_mut().find(|e| e.address == address) {
            Some(endpoint) => {
                endpoint.failed = true;
                true
            }
            None => false,
        }
    }

    /// Clear failures and rewind to the first endpoint
    pub fn reset(&mut self) {
        for endpoint in &mut self.endpoints {
            endpoint.failed = false;
        }
        self.current = 0;
    }

    /// Number of endpoints not marked failed
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.endpoints.iter().filter(|e| !e.failed).count()
    }

    /// Status snapshot
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let active = self.active_count();
        PoolStatus {
            total: self.endpoints.len(),
            active,
            failed: self.endpoints.len() - active,
            current_index: self.current,
        }
    }

    /// Endpoints in configured order
    #[must_use]
    pub fn endpoints(&self) -> &[RelayEndpoint] {
        &self.endpoints
    }

    /// Number of endpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether the pool has no endpoints
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Scan `len` slots starting `offset` past the cursor
    fn find_from(&self, offset: usize) -> Option<usize> {
        let n = self.endpoints.len();
        (0..n)
            .map(|step| (self.current + offset + step) % n)
            .find(|&i| !self.endpoints[i].failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> EndpointPool {
        EndpointPool::new(["wss://a", "wss://b", "wss://c"])
    }

    #[test]
    fn test_pool_creation() {
        let pool = pool();
        assert_eq!(pool.len(), 3);
        assert!(!pool.is_empty());
        assert_eq!(pool.get_current(), Some("wss://a"));
    }

    #[test]
    fn test_empty_pool() {
        let mut pool = EndpointPool::new(Vec::<String>::new());
        assert!(pool.is_empty());
        assert_eq!(pool.get_current(), None);
        assert_eq!(pool.advance(), None);
    }

    #[test]
    fn test_get_current_skips_failed() {
        let mut pool = pool();
        pool.mark_failed("wss://a");
        assert_eq!(pool.get_current(), Some("wss://b"));
    }

    #[test]
    fn test_advance_rotates_and_wraps() {
        let mut pool = pool();
        assert_eq!(pool.advance(), Some("wss://b"));
        assert_eq!(pool.advance(), Some("wss://c"));
        assert_eq!(pool.advance(), Some("wss://a"));
    }

    #[test]
    fn test_advance_skips_failed() {
        let mut pool = pool();
        pool.mark_failed("wss://b");
        assert_eq!(pool.advance(), Some("wss://c"));
        assert_eq!(pool.status().current_index, 2);
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = pool();
        for addr in ["wss://a", "wss://b", "wss://c"] {
            assert!(pool.mark_failed(addr));
        }
        assert_eq!(pool.get_current(), None);
        assert_eq!(pool.advance(), None);
    }

    #[test]
    fn test_mark_unknown() {
        let mut pool = pool();
        assert!(!pool.mark_failed("wss://zzz"));
        assert_eq!(pool.active_count(), 3);
    }

    #[test]
    fn test_reset_restores_order() {
        let mut pool = pool();
        pool.mark_failed("wss://a");
        pool.advance();
        pool.mark_failed("wss://b");
        pool.reset();

        assert_eq!(pool.get_current(), Some("wss://a"));
        let addrs: Vec<_> = pool.endpoints().iter().map(|e| e.address.as_str()).collect();
        assert_eq!(addrs, ["wss://a", "wss://b", "wss://c"]);
        assert_eq!(pool.active_count(), 3);
    }

    #[test]
    fn test_status() {
        let mut pool = pool();
        pool.mark_failed("wss://a");
        pool.advance();

        assert_eq!(
            pool.status(),
            PoolStatus {
                total: 3,
                active: 2,
                failed: 1,
                current_index: 1,
            }
        );
    }
}
