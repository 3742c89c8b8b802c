//! Change-notification bus.
//!
//! A process-wide registry mapping watched paths to subscribers. The VFS
//! emits an event after every successful mutation; a subscriber receives
//! the events whose path falls under its watched prefix.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
#[cfg(feature = "serializable")]
use serde::Deserialize;
#[cfg(feature = "serializable")]
use serde::Serialize;
use tokio::sync::mpsc;

use crate::path;

/// The kind of change a watch event reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum WatchEventType {
    /// A name appeared or disappeared (create, delete, rename).
    Rename,
    /// File content or metadata changed.
    Change,
}

/// A single change notification.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct WatchEvent {
    /// What happened.
    pub event_type: WatchEventType,
    /// Path of the changed node, relative to the watched path.
    pub filename: String,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

/// Registry of watchers, keyed by watched path.
#[derive(Default)]
pub struct WatcherBus {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: Mutex<u64>,
}

impl WatcherBus {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to changes at or below `watched` (normalized).
    pub fn subscribe(self: &Arc<Self>, watched: &str) -> Watcher {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.subscribers
            .lock()
            .entry(watched.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        Watcher {
            bus: self.clone(),
            watched: watched.to_string(),
            id,
            rx,
        }
    }

    /// Deliver an event for `changed` to every subscriber whose watched
    /// prefix covers it.
    pub fn emit(&self, event_type: WatchEventType, changed: &str) {
        let mut dead: Vec<(String, u64)> = Vec::new();
        {
            let subscribers = self.subscribers.lock();
            for (watched, subs) in subscribers.iter() {
                if !path::is_within(watched, changed) {
                    continue;
                }
                let filename = relative_name(watched, changed);
                for sub in subs {
                    let event = WatchEvent {
                        event_type,
                        filename: filename.clone(),
                    };
                    if sub.tx.send(event).is_err() {
                        dead.push((watched.clone(), sub.id));
                    }
                }
            }
        }
        for (watched, id) in dead {
            debug!("dropping closed watcher {id} on {watched}");
            self.unsubscribe(&watched, id);
        }
    }

    fn unsubscribe(&self, watched: &str, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(subs) = subscribers.get_mut(watched) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                subscribers.remove(watched);
            }
        }
    }

    /// Number of live subscriptions, for diagnostics.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().values().map(Vec::len).sum()
    }
}

impl fmt::Debug for WatcherBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn relative_name(watched: &str, changed: &str) -> String {
    if watched == changed {
        return path::basename(changed).to_string();
    }
    let suffix = if watched == "/" {
        &changed[1..]
    } else {
        changed[watched.len()..].trim_start_matches('/')
    };
    suffix.to_string()
}

/// A subscription to change events.
///
/// Events can be awaited with [`next`](Watcher::next) or drained from a
/// blocking context with [`recv`](Watcher::recv). Dropping the watcher (or
/// calling [`close`](Watcher::close)) ends the subscription; pending
/// `next()` callers observe the end of the stream as `None`.
pub struct Watcher {
    bus: Arc<WatcherBus>,
    watched: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Watcher {
    /// The path this watcher observes.
    pub fn path(&self) -> &str {
        &self.watched
    }

    /// Await the next event; `None` once the subscription is closed and
    /// drained.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Blocking receive for the sync surface. Must not be called from
    /// within an async runtime.
    pub fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.blocking_recv()
    }

    /// Non-blocking poll; `None` when no event is queued.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }

    /// End the subscription.
    pub fn close(&mut self) {
        self.bus.unsubscribe(&self.watched, self.id);
        self.rx.close();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.watched, self.id);
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("watched", &self.watched)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_delivery() {
        let bus = Arc::new(WatcherBus::new());
        let mut on_dir = bus.subscribe("/a");
        let mut on_root = bus.subscribe("/");
        let mut elsewhere = bus.subscribe("/b");

        bus.emit(WatchEventType::Change, "/a/x");

        assert_eq!(
            on_dir.try_next(),
            Some(WatchEvent {
                event_type: WatchEventType::Change,
                filename: "x".to_string()
            })
        );
        assert_eq!(
            on_root.try_next(),
            Some(WatchEvent {
                event_type: WatchEventType::Change,
                filename: "a/x".to_string()
            })
        );
        assert_eq!(elsewhere.try_next(), None);
    }

    #[test]
    fn watching_a_file_reports_its_basename() {
        let bus = Arc::new(WatcherBus::new());
        let mut w = bus.subscribe("/a/f");
        bus.emit(WatchEventType::Rename, "/a/f");
        assert_eq!(w.try_next().unwrap().filename, "f");
    }

    #[test]
    fn close_ends_subscription() {
        let bus = Arc::new(WatcherBus::new());
        let mut w = bus.subscribe("/");
        assert_eq!(bus.subscriber_count(), 1);
        w.close();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(WatchEventType::Change, "/x");
        assert_eq!(w.try_next(), None);
    }

    #[test]
    fn drop_unsubscribes() {
        let bus = Arc::new(WatcherBus::new());
        {
            let _w = bus.subscribe("/");
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn async_next_resolves_on_emit() {
        let bus = Arc::new(WatcherBus::new());
        let mut w = bus.subscribe("/");
        let emitter = bus.clone();
        let task = tokio::spawn(async move {
            emitter.emit(WatchEventType::Change, "/f");
        });
        let event = w.next().await.unwrap();
        assert_eq!(event.filename, "f");
        task.await.unwrap();
    }
}
