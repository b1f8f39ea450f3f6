//! Process-wide counting semaphores keyed by `concurrency_key`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;

use crate::compiler::ResourceSettings;

/// Registry of shared transfer budgets.
///
/// Every asset naming the same key draws from the same semaphore, so the
/// budget caps open connections across assets and concurrent runs.
#[derive(Debug)]
pub struct ConcurrencyPools {
    budgets: BTreeMap<String, usize>,
    default_budget: usize,
    pools: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConcurrencyPools {
    /// Budgets per key; keys not listed get `default_budget`. Budgets are
    /// at least 1.
    #[must_use]
    pub fn new(budgets: BTreeMap<String, usize>, default_budget: usize) -> Self {
        Self {
            budgets,
            default_budget: default_budget.max(1),
            pools: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn from_settings(resources: &ResourceSettings) -> Self {
        Self::new(resources.pools.clone(), resources.default_pool_budget)
    }

    /// Configured budget for `key`.
    #[must_use]
    pub fn budget(&self, key: &str) -> usize {
        self.budgets
            .get(key)
            .copied()
            .unwrap_or(self.default_budget)
            .max(1)
    }

    /// The semaphore for `key`, created on first use.
    #[must_use]
    pub fn pool(&self, key: &str) -> Arc<Semaphore> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let pool = pools
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.budget(key))));
        Arc::clone(pool)
    }

    /// Free slots for `key` right now.
    #[must_use]
    pub fn available(&self, key: &str) -> usize {
        self.pool(key).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools() -> ConcurrencyPools {
        ConcurrencyPools::new(BTreeMap::from([("sftp".to_string(), 2)]), 5)
    }

    #[test]
    fn configured_and_default_budgets() {
        let pools = pools();
        assert_eq!(pools.budget("sftp"), 2);
        assert_eq!(pools.budget("s3"), 5);
        assert_eq!(pools.available("sftp"), 2);
    }

    #[test]
    fn zero_budget_still_admits_one() {
        let pools = ConcurrencyPools::new(BTreeMap::from([("x".to_string(), 0)]), 0);
        assert_eq!(pools.budget("x"), 1);
        assert_eq!(pools.budget("y"), 1);
    }

    #[tokio::test]
    async fn same_key_shares_one_semaphore() {
        let pools = pools();
        let first = pools.pool("sftp").acquire_owned().await.unwrap();
        assert_eq!(pools.available("sftp"), 1);
        let _second = pools.pool("sftp").acquire_owned().await.unwrap();
        assert_eq!(pools.available("sftp"), 0);
        drop(first);
        assert_eq!(pools.available("sftp"), 1);
        assert_eq!(pools.available("s3"), 5);
    }
}
