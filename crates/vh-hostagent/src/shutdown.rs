//! Ordered cleanup of everything acquired during startup

use std::future::Future;
use std::sync::Mutex;

use anyhow::Context;
use futures::future::BoxFuture;
use futures::FutureExt;
use vh_core::MultiError;

type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Entry {
    owner: String,
    cleanup: Cleanup,
}

/// Last-in-first-out registry of cleanup actions
///
/// Subsystems push a cleanup right after acquiring a resource. [`drain`]
/// runs them newest first, exactly once; pushes after that are refused.
///
/// [`drain`]: ShutdownStack::drain
pub struct ShutdownStack {
    entries: Mutex<Option<Vec<Entry>>>,
}

impl Default for ShutdownStack {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Some(Vec::new())),
        }
    }
}

impl ShutdownStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `cleanup` on behalf of `owner`
    ///
    /// Returns false, without running `cleanup`, if the stack was already
    /// drained.
    pub fn push<F, Fut>(&self, owner: impl Into<String>, cleanup: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let owner = owner.into();
        let mut guard = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_mut() {
            Some(entries) => {
                tracing::debug!("Registered cleanup for {}", owner);
                entries.push(Entry {
                    owner,
                    cleanup: Box::new(move || cleanup().boxed()),
                });
                true
            }
            None => {
                tracing::warn!("Cleanup for {} registered after teardown, ignoring", owner);
                false
            }
        }
    }

    /// Number of pending cleanups
    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.as_ref().map_or(0, Vec::len),
            Err(poisoned) => poisoned.into_inner().as_ref().map_or(0, Vec::len),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every cleanup, newest first
    ///
    /// A failing cleanup does not stop the ones registered before it. The
    /// second and later calls do nothing.
    pub async fn drain(&self) -> Result<(), MultiError> {
        let entries = {
            let mut guard = match self.entries.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        let Some(entries) = entries else {
            tracing::debug!("Shutdown stack already drained");
            return Ok(());
        };

        tracing::info!("Running {} cleanup(s)", entries.len());
        let mut errors = MultiError::new();
        for entry in entries.into_iter().rev() {
            tracing::debug!("Cleaning up {}", entry.owner);
            let owner = entry.owner;
            errors.check((entry.cleanup)().await.with_context(|| owner));
        }
        errors.into_result()
    }
}
