use std::sync::Arc;

use futures::lock::Mutex as AsyncMutex;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use tracing::{debug, error};

use super::{install_teardown, Pending, Unsubscriber};
use crate::observable::{Observable, Subscriber};
use crate::scheduler::{SharedScheduler, Task};

/// Adapt a pull sequence into an observable.
///
/// Every pull is its own scheduled step: the step awaits one element,
/// delivers it, and schedules the next step through the same scheduler, so
/// other work can interleave between elements and no element is requested
/// before the previous one settled. The sequence ending completes the
/// observable; a failing element errors it.
pub fn adapt_sequence<T, E, S>(
    stream: S,
    scheduler: SharedScheduler,
    unsubscriber: Option<Unsubscriber>,
) -> Observable<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
    S: Stream<Item = Result<T, E>> + Send + 'static,
{
    Observable::new(move |subscriber: Subscriber<T, E>| {
        let pending = Arc::new(Pending::default());
        install_teardown(&subscriber, unsubscriber, &pending);

        let pull = Arc::new(Pull {
            stream: AsyncMutex::new(stream.boxed()),
            subscriber,
            scheduler,
            pending,
        });
        let cancellation = pull.scheduler.schedule(pull_step(Arc::clone(&pull)));
        pull.pending.set(cancellation);
    })
}

struct Pull<T, E> {
    stream: AsyncMutex<BoxStream<'static, Result<T, E>>>,
    subscriber: Subscriber<T, E>,
    scheduler: SharedScheduler,
    pending: Arc<Pending>,
}

fn pull_step<T, E>(pull: Arc<Pull<T, E>>) -> Task
where
    T: Send + 'static,
    E: Send + 'static,
{
    async move {
        if pull.subscriber.is_closed() {
            return;
        }

        let item = pull.stream.lock().await.next().await;
        match item {
            None => pull.subscriber.complete(),
            Some(Ok(value)) => {
                if pull.subscriber.next(value) && !pull.subscriber.is_closed() {
                    let cancellation = pull.scheduler.schedule(pull_step(Arc::clone(&pull)));
                    pull.pending.set(cancellation);
                }
            }
            Some(Err(failure)) => {
                if pull.subscriber.is_closed() {
                    debug!("sequence failed after unsubscribe, error suppressed");
                } else {
                    error!("sequence failed");
                    pull.subscriber.error(failure);
                }
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::Notification;
    use crate::scheduler::{AsapScheduler, AsyncScheduler, ImmediateScheduler};
    use crate::test_support::Recorder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn immediate() -> SharedScheduler {
        Arc::new(ImmediateScheduler)
    }

    #[test]
    fn finite_sequence_emits_in_order_then_completes() {
        let recorder = Recorder::new();
        let values = futures::stream::iter(vec![Ok::<_, &str>(1), Ok(2), Ok(3)]);
        adapt_sequence(values, immediate(), None).subscribe(recorder.clone());

        assert_eq!(
            recorder.notifications(),
            vec![
                Notification::Next(1),
                Notification::Next(2),
                Notification::Next(3),
                Notification::Complete,
            ]
        );
    }

    #[test]
    fn empty_sequence_completes_without_values() {
        let recorder = Recorder::new();
        adapt_sequence(
            futures::stream::empty::<Result<i32, ()>>(),
            immediate(),
            None,
        )
        .subscribe(recorder.clone());

        assert_eq!(recorder.notifications(), vec![Notification::Complete]);
    }

    #[test]
    fn failure_after_values_emits_single_error() {
        let recorder = Recorder::new();
        let values = futures::stream::iter(vec![Ok(1), Ok(2), Err("broken"), Ok(4)]);
        adapt_sequence(values, immediate(), None).subscribe(recorder.clone());

        assert_eq!(
            recorder.notifications(),
            vec![
                Notification::Next(1),
                Notification::Next(2),
                Notification::Error("broken"),
            ]
        );
    }

    #[test]
    fn unsubscriber_runs_once_on_natural_completion() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let subscription = adapt_sequence(
            futures::stream::iter(vec![Ok::<_, ()>(1)]),
            immediate(),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .subscribe(Recorder::new());

        subscription.unsubscribe();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_pulling() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<i32, ()>>();
        let values = tokio_stream_from(rx);
        let recorder = Recorder::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let subscription = adapt_sequence(
            values,
            Arc::new(AsapScheduler::new()),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .subscribe(recorder.clone());

        tx.send(Ok(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        subscription.unsubscribe();
        subscription.unsubscribe();
        let _ = tx.send(Ok(2));
        let _ = tx.send(Err(()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(recorder.notifications(), vec![Notification::Next(1)]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_of_in_flight_pull_after_unsubscribe_is_suppressed() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<i32, &str>>();
        let recorder = Recorder::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let subscription = adapt_sequence(
            tokio_stream_from(rx),
            Arc::new(AsapScheduler::new()),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .subscribe(recorder.clone());

        // The first pull is parked on the empty channel.
        tokio::time::sleep(Duration::from_millis(10)).await;
        subscription.unsubscribe();
        tx.send(Err("disconnected")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(tx.is_closed());
        assert_eq!(recorder.notifications(), vec![]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_pulls_concurrently() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let gauge = Arc::clone(&in_flight);
        let overlaps = Arc::clone(&overlap);
        let values = futures::stream::iter(0..20).then(move |value| {
            let gauge = Arc::clone(&gauge);
            let overlaps = Arc::clone(&overlaps);
            async move {
                if gauge.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                gauge.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ()>(value)
            }
        });

        let received: Vec<_> = adapt_sequence(values, Arc::new(AsyncScheduler::new()), None)
            .into_stream()
            .collect()
            .await;

        assert_eq!(received, (0..20).map(Ok).collect::<Vec<_>>());
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    fn tokio_stream_from<T: Send + 'static>(
        mut rx: tokio::sync::mpsc::UnboundedReceiver<T>,
    ) -> impl Stream<Item = T> + Send {
        futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
    }
}
