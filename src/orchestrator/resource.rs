//! Scoped power/performance resource held while a test is being polled.

use std::sync::Arc;

use tracing::debug;

/// A grantable resource such as a wake lock or a CPU boost.
pub trait PerformanceResource: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Default resource: grants nothing, only traces acquire/release.
#[derive(Debug, Default)]
pub struct NoopResource;

impl PerformanceResource for NoopResource {
    fn acquire(&self) {
        debug!("Performance grant acquired");
    }

    fn release(&self) {
        debug!("Performance grant released");
    }
}

/// Holds an acquired resource; releases it exactly once when dropped.
pub struct ResourceGrant {
    resource: Arc<dyn PerformanceResource>,
}

impl ResourceGrant {
    pub fn acquire(resource: Arc<dyn PerformanceResource>) -> Self {
        resource.acquire();
        Self { resource }
    }
}

impl Drop for ResourceGrant {
    fn drop(&mut self) {
        self.resource.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl PerformanceResource for Counting {
        fn acquire(&self) {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_grant_released_once_on_drop() {
        let resource = Arc::new(Counting::default());
        {
            let _grant = ResourceGrant::acquire(resource.clone());
            assert_eq!(resource.acquired.load(Ordering::SeqCst), 1);
            assert_eq!(resource.released.load(Ordering::SeqCst), 0);
        }
        assert_eq!(resource.released.load(Ordering::SeqCst), 1);
    }
}
