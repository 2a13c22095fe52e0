//! Per-invocation scratch space handed to the remote callback.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Per-invocation key-value scratch space.
///
/// Created by the engine for each submission, seeded with the descriptor's
/// initial attributes, and visible to the callback on whichever task runs
/// the attempt. Writes made before the attempt starts happen-before reads
/// inside the attempt.
///
/// The context also carries the cancellation signal: when the outer future
/// is cancelled the engine trips the flag, and in-flight callbacks that
/// want best-effort cancellation should poll [`CommandContext::is_cancelled`].
#[derive(Debug)]
pub struct CommandContext {
    command_name: String,
    attributes: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl CommandContext {
    pub fn new(command_name: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            attributes: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    /// Logical command name this invocation runs under.
    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    /// Store an attribute, replacing any previous value under the key.
    pub fn put<V: Any + Send + Sync>(&self, key: impl Into<String>, value: V) {
        self.attributes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.into(), Arc::new(value));
    }

    /// Seed an attribute in its type-erased form (descriptor attributes).
    pub(crate) fn put_raw(&self, key: String, value: Arc<dyn Any + Send + Sync>) {
        self.attributes.lock().unwrap_or_else(|p| p.into_inner()).insert(key, value);
    }

    /// Fetch an attribute downcast to `V`. Returns None when the key is
    /// absent or holds a different type.
    pub fn get<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>> {
        self.attributes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
            .and_then(|v| v.downcast::<V>().ok())
    }

    /// Remove an attribute. Returns whether the key was present.
    pub fn remove(&self, key: &str) -> bool {
        self.attributes.lock().unwrap_or_else(|p| p.into_inner()).remove(key).is_some()
    }

    /// Whether an attribute exists under the key.
    pub fn contains(&self, key: &str) -> bool {
        self.attributes.lock().unwrap_or_else(|p| p.into_inner()).contains_key(key)
    }

    /// Number of stored attributes.
    pub fn len(&self) -> usize {
        self.attributes.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Trip the cancellation flag and wake any waiter.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_notify.notify_waiters();
    }

    /// Whether the invocation was cancelled from the outside.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolve when the invocation is cancelled.
    pub(crate) async fn cancelled_wait(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.cancel_notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a cancel between the check
            // and the await cannot be missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
