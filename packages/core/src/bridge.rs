//! Observables over the named channels of a shared [`EventEmitter`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::emitter::{EventEmitter, ListenerHandle};
use crate::observable::{Observable, Subscriber};

/// The channel whose emissions terminate every bridged subscription.
pub const ERROR_CHANNEL: &str = "error";

/// Exposes each channel of one shared emitter as an independent observable.
///
/// A subscription forwards every emission on its channel as `next` and never
/// completes on its own; the emitter's owner decides when events stop. Each
/// subscription also holds a one-shot listener on [`ERROR_CHANNEL`], so an
/// error emission terminates every open subscription of the emitter with
/// that error.
#[derive(Debug)]
pub struct EventStreamBridge<V> {
    emitter: Arc<EventEmitter<V>>,
}

impl<V> Clone for EventStreamBridge<V> {
    fn clone(&self) -> Self {
        Self {
            emitter: Arc::clone(&self.emitter),
        }
    }
}

impl<V> EventStreamBridge<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(emitter: Arc<EventEmitter<V>>) -> Self {
        Self { emitter }
    }

    pub fn emitter(&self) -> &Arc<EventEmitter<V>> {
        &self.emitter
    }

    /// Observe `channel`. Listeners are attached on subscribe and detached
    /// when the subscription ends.
    pub fn on(&self, channel: &str) -> Observable<V, V> {
        let emitter = Arc::clone(&self.emitter);
        let channel = channel.to_string();

        Observable::new(move |subscriber: Subscriber<V, V>| {
            let forward = subscriber.clone();
            let events = emitter.add_listener(&channel, move |event: &V| {
                forward.next(event.clone());
            });

            let fired = Arc::new(AtomicBool::new(false));
            let fail = subscriber.clone();
            let failure_fired = Arc::clone(&fired);
            let failure = emitter.once(ERROR_CHANNEL, move |event: &V| {
                failure_fired.store(true, Ordering::SeqCst);
                fail.error(event.clone());
            });

            subscriber.add_teardown(move || {
                detach(&emitter, &events);
                // A fired once-listener is already gone.
                if !fired.load(Ordering::SeqCst) {
                    detach(&emitter, &failure);
                }
            });
        })
    }
}

fn detach<V>(emitter: &EventEmitter<V>, handle: &ListenerHandle) {
    if let Err(error) = emitter.remove_listener(handle) {
        warn!(%error, "failed to detach listener");
    }
}
