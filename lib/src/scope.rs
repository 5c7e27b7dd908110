use std::{
  collections::HashMap,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
  },
};

use itertools::Itertools;

use crate::tensor::RuntimeTensor;

/// Storage for the intermediate values of one execution.
#[derive(Debug, Default)]
pub struct Scope {
  id: u64,
  vars: Mutex<HashMap<String, RuntimeTensor>>,
}

impl Scope {
  pub fn new(id: u64) -> Self {
    Scope {
      id,
      vars: Mutex::new(HashMap::new()),
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, RuntimeTensor>> {
    self.vars.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Binds `tensor` under its own name.
  pub fn set(&self, tensor: RuntimeTensor) {
    self.lock().insert(tensor.name.clone(), tensor);
  }

  pub fn get(&self, name: &str) -> Option<RuntimeTensor> {
    self.lock().get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.lock().contains_key(name)
  }

  pub fn var_names(&self) -> Vec<String> {
    self.lock().keys().cloned().sorted().collect()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Hands out one fresh scope per call. Scopes are never pooled; with
/// `keep_last` the most recent one stays reachable for inspection.
#[derive(Debug)]
pub struct ScopeManager {
  next_id: AtomicU64,
  keep_last: bool,
  last: Mutex<Option<Arc<Scope>>>,
}

impl ScopeManager {
  pub fn new(keep_last: bool) -> Self {
    ScopeManager {
      next_id: AtomicU64::new(0),
      keep_last,
      last: Mutex::new(None),
    }
  }

  pub fn acquire(&self) -> Arc<Scope> {
    Arc::new(Scope::new(self.next_id.fetch_add(1, Ordering::Relaxed)))
  }

  /// Called once outputs were extracted from `scope`.
  pub fn release(&self, scope: Arc<Scope>) {
    if self.keep_last {
      *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(scope);
    }
  }

  pub fn last(&self) -> Option<Arc<Scope>> {
    self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_each_acquire_is_fresh() {
    let manager = ScopeManager::new(false);
    let a = manager.acquire();
    a.set(RuntimeTensor::new("t", vec![1], vec![1.0]));
    let b = manager.acquire();
    assert_ne!(a.id(), b.id());
    assert!(b.is_empty());
    assert!(a.contains("t"));
  }

  #[test]
  fn test_release_keeps_last_only_when_asked() {
    let dropping = ScopeManager::new(false);
    dropping.release(dropping.acquire());
    assert!(dropping.last().is_none());

    let keeping = ScopeManager::new(true);
    let s = keeping.acquire();
    s.set(RuntimeTensor::new("y@GRAD", vec![1], vec![1.0]));
    keeping.release(s);
    let second = keeping.acquire();
    let second_id = second.id();
    keeping.release(second);
    let last = keeping.last().unwrap();
    assert_eq!(last.id(), second_id);
    assert!(last.var_names().is_empty());
  }
}
