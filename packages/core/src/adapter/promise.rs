use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use tracing::trace;

use super::{install_teardown, Pending, Unsubscriber};
use crate::observable::{Observable, Subscriber};
use crate::scheduler::SharedScheduler;

/// Adapt a future into an observable of exactly one value or one error.
///
/// On subscribe, a task awaiting `future` is scheduled. Success emits
/// `next(value)` then `complete`; failure emits `error(reason)`. If the
/// subscription closes first, the settlement is dropped. `unsubscriber`
/// runs once whenever the subscription ends, including after settlement.
pub fn adapt_promise<T, E, F>(
    future: F,
    scheduler: SharedScheduler,
    unsubscriber: Option<Unsubscriber>,
) -> Observable<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
    F: Future<Output = Result<T, E>> + Send + 'static,
{
    Observable::new(move |subscriber: Subscriber<T, E>| {
        let pending = Arc::new(Pending::default());
        install_teardown(&subscriber, unsubscriber, &pending);

        let settle = subscriber.clone();
        let cancellation = scheduler.schedule(
            async move {
                if settle.is_closed() {
                    return;
                }
                match future.await {
                    Ok(value) => {
                        if settle.next(value) {
                            settle.complete();
                        } else {
                            trace!("future resolved after unsubscribe");
                        }
                    }
                    Err(error) => settle.error(error),
                }
            }
            .boxed(),
        );
        pending.set(cancellation);
    })
}
