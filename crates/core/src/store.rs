//! Observable state holders.
//!
//! A `StateHolder` owns one value (for example the signed-in user) and lets
//! any number of subscribers watch it. Holders are passed around explicitly
//! inside a context object; there is no global instance.

use anyhow::Result;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::warn;

/// Clears the in-flight flag when a refresh finishes or is dropped midway.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct StateHolder<T> {
    tx: watch::Sender<Option<T>>,
    loading: AtomicBool,
}

impl<T: Clone + Send + Sync> Default for StateHolder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> StateHolder<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            loading: AtomicBool::new(false),
        }
    }

    /// A receiver that starts out holding the current value and wakes on
    /// every change after that.
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn set(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// Replaces the value with whatever `fetch` produces.
    ///
    /// Concurrent refreshes collapse into the first one: a call made while
    /// another is in flight returns the current value without fetching. On
    /// failure the old value is kept and `None` is returned.
    pub async fn refresh<F, Fut>(&self, fetch: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.loading.swap(true, Ordering::AcqRel) {
            return self.current();
        }
        let guard = LoadingGuard(&self.loading);
        let fetched = fetch().await;
        drop(guard);

        match fetched {
            Ok(value) => {
                self.set(value.clone());
                Some(value)
            }
            Err(e) => {
                warn!(error = ?e, "State refresh failed, keeping previous value");
                None
            }
        }
    }
}
