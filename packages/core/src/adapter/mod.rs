//! Adapters from async sources to [`Observable`]s.
//!
//! A [`Source`] is either promise-like (a future that settles once) or a
//! pull sequence (a stream of results). [`adapt`] classifies it once and
//! routes it to the matching adapter:
//!
//! ```rust
//! use std::sync::Arc;
//! use rxhttp_core::{adapt, ImmediateScheduler, Notification, Source};
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let source = Source::<i32, String>::sequence(futures::stream::iter(vec![Ok(1), Ok(2)]));
//! adapt(source, Some(Arc::new(ImmediateScheduler)), None).subscribe(tx);
//!
//! assert_eq!(rx.try_recv().unwrap(), Notification::Next(1));
//! assert_eq!(rx.try_recv().unwrap(), Notification::Next(2));
//! assert_eq!(rx.try_recv().unwrap(), Notification::Complete);
//! ```

mod promise;
mod sequence;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;

use crate::observable::{Observable, Subscriber};
use crate::scheduler::{default_scheduler, Cancellation, SharedScheduler};

pub use promise::adapt_promise;
pub use sequence::adapt_sequence;

/// Caller-supplied teardown, invoked once when a subscription ends.
pub type Unsubscriber = Box<dyn FnOnce() + Send>;

/// An async source that can be turned into an [`Observable`].
pub enum Source<T, E> {
    /// Settles once with a value or an error.
    Promise(BoxFuture<'static, Result<T, E>>),
    /// Yields values on demand until it ends or fails.
    Sequence(BoxStream<'static, Result<T, E>>),
}

impl<T, E> Source<T, E> {
    pub fn promise<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Source::Promise(future.boxed())
    }

    pub fn sequence<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        Source::Sequence(stream.boxed())
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, Source::Promise(_))
    }
}

impl<T, E> fmt::Debug for Source<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Promise(_) => f.write_str("Source::Promise"),
            Source::Sequence(_) => f.write_str("Source::Sequence"),
        }
    }
}

/// Adapt `source`, using the default scheduler when none is given.
pub fn adapt<T, E>(
    source: Source<T, E>,
    scheduler: Option<SharedScheduler>,
    unsubscriber: Option<Unsubscriber>,
) -> Observable<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    dispatch(
        source,
        scheduler.unwrap_or_else(default_scheduler),
        unsubscriber,
    )
}

/// Route `source` to the promise or the sequence adapter.
pub fn dispatch<T, E>(
    source: Source<T, E>,
    scheduler: SharedScheduler,
    unsubscriber: Option<Unsubscriber>,
) -> Observable<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    match source {
        Source::Promise(future) => adapt_promise(future, scheduler, unsubscriber),
        Source::Sequence(stream) => adapt_sequence(stream, scheduler, unsubscriber),
    }
}

/// The most recently scheduled, possibly not yet started, task of a
/// subscription.
#[derive(Default)]
struct Pending {
    slot: Mutex<Option<Cancellation>>,
}

impl Pending {
    fn set(&self, cancellation: Cancellation) {
        *self.slot.lock() = Some(cancellation);
    }

    fn cancel(&self) {
        if let Some(cancellation) = self.slot.lock().take() {
            cancellation.cancel();
        }
    }
}

/// Register the adapter teardown: the unsubscriber first, then cancellation
/// of the pending task. The closed flag is already set when these run.
fn install_teardown<T: 'static, E: 'static>(
    subscriber: &Subscriber<T, E>,
    unsubscriber: Option<Unsubscriber>,
    pending: &Arc<Pending>,
) {
    if let Some(unsubscriber) = unsubscriber {
        subscriber.add_teardown(unsubscriber);
    }
    let pending = Arc::clone(pending);
    subscriber.add_teardown(move || pending.cancel());
}
