//! A registry handing out mutexes by name.

use crate::{EmptyNameSnafu, Result};
use parking_lot::Mutex;
use snafu::ensure;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Hands out the same mutex for the same name for as long as any handle to
/// that name is alive. Entries whose handles were all dropped are pruned
/// lazily on the next access.
///
/// The intended idiom is `registry.named_mutex(name)?.lock().await` around
/// one operation; handles are not meant to be cached across unrelated
/// operations.
#[derive(Debug, Default)]
pub struct NamedMutexRegistry {
    entries: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl NamedMutexRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the mutex registered under `name`, creating it if needed.
    pub fn named_mutex(&self, name: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        ensure!(!name.is_empty(), EmptyNameSnafu);

        let mut entries = self.entries.lock();
        entries.retain(|_, weak| weak.strong_count() > 0);

        if let Some(mutex) = entries.get(name).and_then(Weak::upgrade) {
            return Ok(mutex);
        }
        let mutex = Arc::new(tokio::sync::Mutex::new(()));
        entries.insert(name.to_string(), Arc::downgrade(&mutex));
        Ok(mutex)
    }

    /// Number of live entries, for tests and introspection.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.len()
    }

    /// Whether no live entries exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn same_name_resolves_to_the_same_mutex() {
        let registry = NamedMutexRegistry::new();
        let a = registry.named_mutex("sky:Object:123").unwrap();
        let b = registry.named_mutex("sky:Object:123").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = registry.named_mutex("sky:Object:124").unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn dropped_entries_are_pruned() {
        let registry = NamedMutexRegistry::new();
        let handle = registry.named_mutex("transient").unwrap();
        assert_eq!(registry.len(), 1);

        drop(handle);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn empty_name_is_invalid() {
        let registry = NamedMutexRegistry::new();
        assert!(matches!(registry.named_mutex(""), Err(Error::EmptyName)));
    }

    #[tokio::test]
    async fn serializes_critical_sections() {
        let registry = Arc::new(NamedMutexRegistry::new());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let mutex = registry.named_mutex("target").unwrap();
                    let _guard = mutex.lock().await;
                    // No other task is inside the critical section.
                    assert_eq!(counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst), 0);
                    tokio::task::yield_now().await;
                    counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
