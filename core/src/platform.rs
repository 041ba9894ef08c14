//! Application collaborator
//!
//! The host application supplies a keep-awake resource for the radio (a
//! partial wake lock on Android) and its data directory. Everything else in
//! the platform layer stays outside this crate.

use std::fmt;
use std::path::PathBuf;

/// Scoped keep-awake resource. Released exactly once, on `release()` or drop.
pub struct KeepAwakeGuard {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl KeepAwakeGuard {
    /// Guard that runs `release` when it goes away
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Guard for platforms without a keep-awake mechanism
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Release the resource now
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for KeepAwakeGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for KeepAwakeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepAwakeGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Functions the host application provides to the core
pub trait ApplicationFunctions: Send + Sync {
    /// Keep the radio awake until the returned guard is released
    fn acquire_radio_keep_awake(&self) -> KeepAwakeGuard;

    /// Directory for persistent state
    fn data_directory(&self) -> PathBuf;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_guard_releases_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let guard = KeepAwakeGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        guard.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        {
            let _guard = KeepAwakeGuard::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
