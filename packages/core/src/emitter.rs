//! A channel-keyed listener registry.
//!
//! [`EventEmitter`] is the shared event-emitting object behind streaming
//! requests. Listeners are attached to a named channel and identified by the
//! [`ListenerHandle`] returned on attach; removal is always scoped to one
//! handle, so independent consumers of the same emitter never disturb each
//! other's listeners.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::EmitterError;

/// A listener callback.
pub type Listener<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// Identifies one attached listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    channel: Arc<str>,
    id: u64,
}

impl ListenerHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Entry<V> {
    id: u64,
    once: bool,
    listener: Listener<V>,
}

/// Named channels of listeners for events of type `V`.
pub struct EventEmitter<V> {
    channels: Mutex<HashMap<String, Vec<Entry<V>>>>,
    next_id: AtomicU64,
}

impl<V> Default for EventEmitter<V> {
    fn default() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<V> fmt::Debug for EventEmitter<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels = self.channels.lock();
        let mut counts: Vec<_> = channels
            .iter()
            .map(|(name, entries)| (name.clone(), entries.len()))
            .collect();
        counts.sort();
        f.debug_struct("EventEmitter")
            .field("channels", &counts)
            .finish()
    }
}

impl<V> EventEmitter<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener called for every emission on `channel`.
    pub fn add_listener<F>(&self, channel: &str, listener: F) -> ListenerHandle
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        self.attach(channel, false, Arc::new(listener))
    }

    /// Attach a listener called for the next emission on `channel` only.
    pub fn once<F>(&self, channel: &str, listener: F) -> ListenerHandle
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        self.attach(channel, true, Arc::new(listener))
    }

    fn attach(&self, channel: &str, once: bool, listener: Listener<V>) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(Entry { id, once, listener });
        ListenerHandle {
            channel: Arc::from(channel),
            id,
        }
    }

    /// Detach exactly the listener behind `handle`.
    ///
    /// Fails if the listener is not attached, for example because it was a
    /// `once` listener that already fired or its channel was cleared.
    pub fn remove_listener(&self, handle: &ListenerHandle) -> Result<(), EmitterError> {
        let unknown = || EmitterError::UnknownListener {
            channel: handle.channel().to_string(),
            id: handle.id,
        };

        let mut channels = self.channels.lock();
        let entries = channels.get_mut(handle.channel()).ok_or_else(unknown)?;
        let index = entries
            .iter()
            .position(|entry| entry.id == handle.id)
            .ok_or_else(unknown)?;
        entries.remove(index);
        if entries.is_empty() {
            channels.remove(handle.channel());
        }
        Ok(())
    }

    /// Detach every listener on `channel`. Returns how many were removed.
    pub fn remove_all_listeners(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .remove(channel)
            .map_or(0, |entries| entries.len())
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |entries| entries.len())
    }

    /// Call every listener on `channel` with `event`, in attach order.
    ///
    /// `once` listeners are detached before any listener runs. Listeners run
    /// outside the registry lock, so they may attach or detach listeners.
    /// Returns the number of listeners called.
    pub fn emit(&self, channel: &str, event: &V) -> usize {
        let listeners: Vec<Listener<V>> = {
            let mut channels = self.channels.lock();
            let Some(entries) = channels.get_mut(channel) else {
                return 0;
            };
            let listeners = entries
                .iter()
                .map(|entry| Arc::clone(&entry.listener))
                .collect();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                channels.remove(channel);
            }
            listeners
        };

        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }
}
