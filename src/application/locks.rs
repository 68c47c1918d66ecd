use dashmap::DashSet;

/// In-process single-flight set keyed by idempotency key.
///
/// Only guards against races inside one executor. Exclusion across replicas
/// comes from the store's status compare-and-set.
#[derive(Debug, Default)]
pub struct ExecutionLocks {
    held: DashSet<String>,
}

impl ExecutionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` if the key is already held.
    pub fn try_acquire(&self, key: &str) -> Option<ExecutionGuard<'_>> {
        if self.held.insert(key.to_string()) {
            Some(ExecutionGuard {
                locks: self,
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Releases its key on drop, whatever path the execution took.
#[derive(Debug)]
pub struct ExecutionGuard<'a> {
    locks: &'a ExecutionLocks,
    key: String,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight_per_key() {
        let locks = ExecutionLocks::new();
        let guard = locks.try_acquire("a").unwrap();
        assert!(locks.try_acquire("a").is_none());
        assert!(locks.try_acquire("b").is_some());
        assert!(locks.is_held("a"));

        drop(guard);
        assert!(!locks.is_held("a"));
        assert!(locks.try_acquire("a").is_some());
    }

    #[test]
    fn test_released_on_unwind_path() {
        let locks = ExecutionLocks::new();
        let run = || -> Result<(), &'static str> {
            let _guard = locks.try_acquire("k").ok_or("held")?;
            Err("transfer failed")
        };
        assert!(run().is_err());
        assert!(locks.is_empty());
    }
}
