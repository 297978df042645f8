use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use common::SagaId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes flows touching the same saga instance within this process.
///
/// Entries are dropped once no flow holds or waits for the lock.
#[derive(Debug, Default)]
pub(crate) struct SagaLocks {
    locks: StdMutex<HashMap<SagaId, Weak<Mutex<()>>>>,
}

impl SagaLocks {
    pub(crate) async fn acquire(&self, saga_id: &SagaId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| lock.strong_count() > 0);
            match locks.get(saga_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(saga_id.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| lock.strong_count() > 0);
        locks.len()
    }
}
