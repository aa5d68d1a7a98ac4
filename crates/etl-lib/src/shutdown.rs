//! Process-wide cooperative shutdown
//!
//! A single flag is polled before network calls and batch sends. Long-running
//! loops subscribe to a broadcast channel. Components that own external
//! resources register a hook which runs when the sequence is triggered, in
//! reverse registration order.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::info;

/// Teardown step run once when the process shuts down
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    fn name(&self) -> &str;

    async fn shutdown(&self);
}

/// Cloneable handle to the shutdown flag and hook list
#[derive(Clone)]
pub struct ShutdownSequence {
    flag: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
    hooks: Arc<Mutex<Vec<Arc<dyn ShutdownHook>>>>,
}

impl Default for ShutdownSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSequence {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(4);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify,
            hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// True once shutdown has been triggered
    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Receiver that fires when shutdown is triggered
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    /// Wait until shutdown is triggered
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Register a teardown hook
    pub fn register(&self, hook: Arc<dyn ShutdownHook>) {
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        hooks.push(hook);
    }

    /// Raise the flag and notify subscribers without running hooks
    pub fn signal(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            let _ = self.notify.send(());
        }
    }

    /// Raise the flag, notify subscribers and run every hook once
    pub async fn trigger(&self, reason: &str) {
        self.signal();

        let hooks: Vec<Arc<dyn ShutdownHook>> = {
            let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
            hooks.drain(..).collect()
        };

        info!(reason = %reason, hooks = hooks.len(), "Running shutdown sequence");
        for hook in hooks.into_iter().rev() {
            info!(hook = %hook.name(), "Running shutdown hook");
            hook.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingHook {
        name: String,
        order: Arc<Mutex<Vec<String>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ShutdownHook for RecordingHook {
        fn name(&self) -> &str {
            &self.name
        }

        async fn shutdown(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.name.clone());
        }
    }

    #[tokio::test]
    async fn test_trigger_sets_flag_and_notifies() {
        let shutdown = ShutdownSequence::new();
        let mut rx = shutdown.subscribe();

        assert!(!shutdown.is_shutting_down());
        shutdown.trigger("test").await;

        assert!(shutdown.is_shutting_down());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_hooks_run_once_in_reverse_order() {
        let shutdown = ShutdownSequence::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::new(RecordingHook {
            name: "first".into(),
            order: order.clone(),
            calls: AtomicUsize::new(0),
        });
        let second = Arc::new(RecordingHook {
            name: "second".into(),
            order: order.clone(),
            calls: AtomicUsize::new(0),
        });
        shutdown.register(first.clone());
        shutdown.register(second.clone());

        shutdown.trigger("test").await;
        shutdown.trigger("again").await;

        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_returns_after_signal() {
        let shutdown = ShutdownSequence::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };

        tokio::task::yield_now().await;
        shutdown.signal();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait should finish")
            .unwrap();
    }
}
