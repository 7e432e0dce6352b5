//! Thread-local service registry: per-thread instance factories with
//! ordered teardown on thread exit and on factory unregister.
//!
//! Modeled as a registry returning an abstract handle to a per-thread
//! value obtained via a factory, rather than a naive translation of raw
//! `next_`-linked per-thread records.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type BoxedAny = Box<dyn Any + Send>;
type Factory = Arc<dyn Fn() -> BoxedAny + Send + Sync>;

struct FactoryEntry {
    id: u64,
    factory: Factory,
}

/// One thread's services, disposed in reverse-registration order on
/// thread exit (so a later service — which may reference an earlier one
/// — always dies first).
struct ThreadRecord {
    thread: std::thread::ThreadId,
    services: Vec<(u64, BoxedAny)>,
}

struct Inner {
    factories: Vec<FactoryEntry>,
    threads: Vec<ThreadRecord>,
}

/// Central manager. One process-wide instance is expected (constructed by
/// the caller, typically behind a `once_cell::sync::Lazy`).
pub struct ServiceRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        ServiceRegistry::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry {
            inner: Mutex::new(Inner {
                factories: Vec::new(),
                threads: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a factory, returning a [`Handle`] used both to fetch the
    /// per-thread value and to dispose every outstanding instance across
    /// all threads.
    pub fn register_factory<T, F>(&self, factory: F) -> Handle<T>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let boxed: Factory = Arc::new(move || Box::new(factory()) as BoxedAny);
        self.inner.lock().factories.push(FactoryEntry {
            id,
            factory: boxed.clone(),
        });
        Handle {
            id,
            factory: boxed,
            _marker: std::marker::PhantomData,
        }
    }

    /// Called by the platform's TLS thread-exit callback. Disposes every
    /// service owned by the current thread, in reverse-registration order.
    pub fn thread_end(&self) {
        let me = std::thread::current().id();
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.threads.iter().position(|t| t.thread == me) {
            let mut record = inner.threads.remove(pos);
            tracing::trace!(services = record.services.len(), "tearing down thread-local services");
            while record.services.pop().is_some() {
                // Boxed value dropped here, in LIFO (reverse-registration) order.
            }
        }
    }

    /// Removes every instance of one factory's service across all known
    /// threads (called when a [`Handle`] is disposed).
    fn dispose_factory(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.factories.retain(|f| f.id != id);
        for thread in &mut inner.threads {
            thread.services.retain(|(sid, _)| *sid != id);
        }
    }

    fn get_or_create(&self, id: u64, factory: &Factory) -> *const () {
        let me = std::thread::current().id();
        let mut inner = self.inner.lock();
        let record_idx = match inner.threads.iter().position(|t| t.thread == me) {
            Some(idx) => idx,
            None => {
                inner.threads.push(ThreadRecord {
                    thread: me,
                    services: Vec::new(),
                });
                inner.threads.len() - 1
            }
        };
        if let Some(pos) = inner.threads[record_idx].services.iter().position(|(sid, _)| *sid == id) {
            return inner.threads[record_idx].services[pos].1.as_ref() as *const dyn Any as *const ();
        }
        let value = factory();
        inner.threads[record_idx].services.push((id, value));
        let last = inner.threads[record_idx].services.last().unwrap();
        last.1.as_ref() as *const dyn Any as *const ()
    }
}

/// A handle returned by [`ServiceRegistry::register_factory`]. `get` on
/// any thread lazily creates (and caches) that thread's instance; dropping
/// or explicitly disposing the handle removes every outstanding instance.
pub struct Handle<T> {
    id: u64,
    factory: Factory,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: 'static> Handle<T> {
    /// Returns this thread's instance, creating it via the factory on
    /// first access.
    ///
    /// # Safety contract
    /// Callers must only call this against the same `ServiceRegistry`
    /// that produced the handle.
    pub fn get<'a>(&self, registry: &'a ServiceRegistry) -> &'a T {
        let ptr = registry.get_or_create(self.id, &self.factory);
        // Safety: the registry only ever stores `Box<dyn Any>` built by
        // this handle's own factory under this id, and the boxed value's
        // address is stable for the life of the thread record (it's never
        // moved, only removed — which callers must not race with use).
        unsafe { &*(ptr as *const T) }
    }

    pub fn dispose(self, registry: &ServiceRegistry) {
        registry.dispose_factory(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn get_creates_once_per_thread() {
        let registry = ServiceRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let handle = registry.register_factory(move || {
            c.fetch_add(1, Ordering::SeqCst);
            42u32
        });
        assert_eq!(*handle.get(&registry), 42);
        assert_eq!(*handle.get(&registry), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_end_disposes_services() {
        let registry = Arc::new(ServiceRegistry::new());
        let handle = registry.register_factory(|| 7i32);
        let r = registry.clone();
        std::thread::spawn(move || {
            assert_eq!(*handle.get(&r), 7);
            r.thread_end();
        })
        .join()
        .unwrap();
        assert!(registry.inner.lock().threads.is_empty());
    }
}
