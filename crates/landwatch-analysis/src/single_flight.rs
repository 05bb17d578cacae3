use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;

use crate::AnalysisError;

type Slot<V> = Arc<OnceCell<Result<V, Arc<AnalysisError>>>>;

/// Collapses concurrent computations for the same key into one.
///
/// Callers that arrive while a computation is in flight await its result
/// instead of starting their own. The slot is dropped once the computation
/// settles, so a later call computes afresh.
pub struct SingleFlight<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: K, compute: F) -> Result<V, AnalysisError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, AnalysisError>>,
    {
        let slot = self
            .slots()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let outcome = slot
            .get_or_init(|| async move { compute().await.map_err(Arc::new) })
            .await
            .clone();

        let mut slots = self.slots();
        if slots
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
        {
            slots.remove(&key);
        }
        drop(slots);

        outcome.map_err(AnalysisError::Shared)
    }

    pub fn in_flight(&self) -> usize {
        self.slots().len()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.slots.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("single-flight map lock poisoned; recovering");
            poisoned.into_inner()
        })
    }
}
