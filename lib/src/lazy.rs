use std::{
  convert::Infallible,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex, OnceLock, PoisonError,
  },
};

/// A value derived on first access and kept for the owner's lifetime.
///
/// The initializer runs under a guard, so concurrent first accesses still
/// build the value once. A failed build leaves the cell empty and the next
/// access tries again.
#[derive(Debug)]
pub struct Lazy<T> {
  cell: OnceLock<T>,
  guard: Mutex<()>,
  builds: AtomicUsize,
}

impl<T> Default for Lazy<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Lazy<T> {
  pub const fn new() -> Self {
    Lazy {
      cell: OnceLock::new(),
      guard: Mutex::new(()),
      builds: AtomicUsize::new(0),
    }
  }

  pub fn get(&self) -> Option<&T> {
    self.cell.get()
  }

  pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
    if let Some(value) = self.cell.get() {
      return Ok(value);
    }
    let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(value) = self.cell.get() {
      return Ok(value);
    }
    let value = init()?;
    self.builds.fetch_add(1, Ordering::Relaxed);
    Ok(self.cell.get_or_init(|| value))
  }

  pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
    match self.get_or_try_init(|| Ok::<T, Infallible>(init())) {
      Ok(value) => value,
      Err(never) => match never {},
    }
  }

  pub fn is_initialized(&self) -> bool {
    self.cell.get().is_some()
  }

  /// How many times the initializer completed. Never more than one.
  pub fn builds(&self) -> usize {
    self.builds.load(Ordering::Relaxed)
  }
}

#[cfg(test)]
mod tests {
  use std::{cell::Cell, sync::Arc, thread};

  use super::*;

  #[test]
  fn test_initializer_runs_once() {
    let lazy: Lazy<String> = Lazy::new();
    let calls = Cell::new(0);
    for _ in 0..3 {
      let v = lazy
        .get_or_try_init(|| {
          calls.set(calls.get() + 1);
          Ok::<_, ()>("built".to_string())
        })
        .unwrap();
      assert_eq!(v, "built");
    }
    assert_eq!(calls.get(), 1);
    assert_eq!(lazy.builds(), 1);
  }

  #[test]
  fn test_independent_cells() {
    struct Owner {
      a: Lazy<u32>,
      b: Lazy<u32>,
    }
    let owner = Owner {
      a: Lazy::new(),
      b: Lazy::new(),
    };
    owner.a.get_or_try_init(|| Ok::<_, ()>(1)).unwrap();
    assert!(owner.a.is_initialized());
    assert!(!owner.b.is_initialized());
    assert_eq!(*owner.b.get_or_try_init(|| Ok::<_, ()>(2)).unwrap(), 2);
    assert_eq!(owner.a.get(), Some(&1));
  }

  #[test]
  fn test_failed_build_is_retried() {
    let lazy: Lazy<u8> = Lazy::new();
    assert_eq!(lazy.get_or_try_init(|| Err("boom")), Err("boom"));
    assert!(!lazy.is_initialized());
    assert_eq!(lazy.get_or_try_init(|| Ok::<_, &str>(7)), Ok(&7));
    assert_eq!(lazy.builds(), 1);
  }

  #[test]
  fn test_concurrent_first_access_builds_once() {
    let lazy = Arc::new(Lazy::<usize>::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let lazy = lazy.clone();
        let counter = counter.clone();
        thread::spawn(move || {
          *lazy
            .get_or_try_init(|| Ok::<_, ()>(counter.fetch_add(1, Ordering::SeqCst)))
            .unwrap()
        })
      })
      .collect();
    for h in handles {
      assert_eq!(h.join().unwrap(), 0);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }
}
