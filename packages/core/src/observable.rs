//! Push-based streams.
//!
//! An [`Observable`] is cold: nothing happens until [`Observable::subscribe`]
//! hands it an [`Observer`]. From then on the observer receives zero or more
//! `next` signals followed by at most one terminal signal (`error` or
//! `complete`). The returned [`Subscription`] stops delivery.
//!
//! Every subscription owns a closed flag and a list of teardowns. The flag is
//! set exactly once, either by the first terminal signal or by
//! [`Subscription::unsubscribe`]; teardowns run once, right after the flag is
//! set and before the terminal signal (if any) reaches the observer. Signals
//! that arrive after the flag is set are dropped.
//!
//! Signals raised on the delivering thread from inside one of the observer's
//! own handlers are queued and delivered, in order, once that handler returns.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Receives the signals of one subscription.
pub trait Observer<T, E>: Send + 'static {
    fn next(&mut self, value: T);
    fn error(&mut self, error: E);
    fn complete(&mut self);
}

/// A recorded signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification<T, E> {
    Next(T),
    Error(E),
    Complete,
}

/// Forwards every signal as a [`Notification`]. A dropped receiver is ignored.
impl<T, E> Observer<T, E> for mpsc::UnboundedSender<Notification<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn next(&mut self, value: T) {
        let _ = self.send(Notification::Next(value));
    }

    fn error(&mut self, error: E) {
        let _ = self.send(Notification::Error(error));
    }

    fn complete(&mut self) {
        let _ = self.send(Notification::Complete);
    }
}

/// An observer built from three closures.
pub struct FnObserver<N, Er, C> {
    on_next: N,
    on_error: Er,
    on_complete: C,
}

impl<N, Er, C> FnObserver<N, Er, C> {
    pub fn new(on_next: N, on_error: Er, on_complete: C) -> Self {
        Self {
            on_next,
            on_error,
            on_complete,
        }
    }
}

impl<T, E, N, Er, C> Observer<T, E> for FnObserver<N, Er, C>
where
    N: FnMut(T) + Send + 'static,
    Er: FnMut(E) + Send + 'static,
    C: FnMut() + Send + 'static,
{
    fn next(&mut self, value: T) {
        (self.on_next)(value)
    }

    fn error(&mut self, error: E) {
        (self.on_error)(error)
    }

    fn complete(&mut self) {
        (self.on_complete)()
    }
}

type Teardown = Box<dyn FnOnce() + Send>;

struct SubscriptionState {
    closed: AtomicBool,
    /// `None` once the teardowns have run.
    teardowns: Mutex<Option<Vec<Teardown>>>,
}

impl SubscriptionState {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            teardowns: Mutex::new(Some(Vec::new())),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Set the closed flag. Returns `true` for the caller that flipped it.
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn add(&self, teardown: Teardown) {
        let rejected = {
            let mut slot = self.teardowns.lock();
            match slot.as_mut() {
                Some(teardowns) => {
                    teardowns.push(teardown);
                    None
                }
                None => Some(teardown),
            }
        };

        // Already torn down: run it now so nothing leaks.
        if let Some(teardown) = rejected {
            run_teardown(teardown);
        }
    }

    fn tear_down(&self) {
        let teardowns = self.teardowns.lock().take();
        for teardown in teardowns.into_iter().flatten() {
            run_teardown(teardown);
        }
    }
}

fn run_teardown(teardown: Teardown) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(teardown)) {
        warn!(reason = panic_message(panic.as_ref()), "teardown failed");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Handle returned by [`Observable::subscribe`].
#[derive(Clone)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
}

impl Subscription {
    /// Stop delivery and run the teardowns. Idempotent.
    pub fn unsubscribe(&self) {
        if self.state.close() {
            debug!("unsubscribed");
        }
        self.state.tear_down();
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Delivery<T, E> {
    observer: RefCell<Box<dyn Observer<T, E>>>,
    /// Signals raised from inside one of the observer's handlers.
    queued: RefCell<VecDeque<Notification<T, E>>>,
}

/// The producer side of a subscription.
///
/// Cloned freely into callbacks and scheduled tasks. All clones share the
/// subscription's closed flag.
pub struct Subscriber<T, E> {
    delivery: Arc<ReentrantMutex<Delivery<T, E>>>,
    state: Arc<SubscriptionState>,
}

impl<T, E> Clone for Subscriber<T, E> {
    fn clone(&self) -> Self {
        Self {
            delivery: Arc::clone(&self.delivery),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: 'static, E: 'static> Subscriber<T, E> {
    fn new(observer: Box<dyn Observer<T, E>>, state: Arc<SubscriptionState>) -> Self {
        Self {
            delivery: Arc::new(ReentrantMutex::new(Delivery {
                observer: RefCell::new(observer),
                queued: RefCell::new(VecDeque::new()),
            })),
            state,
        }
    }

    /// Deliver a value. Returns `false` if the subscription is closed and the
    /// value was dropped.
    pub fn next(&self, value: T) -> bool {
        self.deliver(Notification::Next(value))
    }

    /// Terminate with an error. Ignored if the subscription is closed.
    pub fn error(&self, error: E) {
        if !self.state.close() {
            trace!("dropping error signal after close");
            return;
        }
        self.state.tear_down();
        self.deliver(Notification::Error(error));
    }

    /// Terminate successfully. Ignored if the subscription is closed.
    pub fn complete(&self) {
        if !self.state.close() {
            trace!("dropping complete signal after close");
            return;
        }
        self.state.tear_down();
        self.deliver(Notification::Complete);
    }

    fn deliver(&self, notification: Notification<T, E>) -> bool {
        let delivery = self.delivery.lock();
        if matches!(notification, Notification::Next(_)) && self.state.is_closed() {
            trace!("dropping next signal after close");
            return false;
        }

        // Held by this thread further up the stack: a handler is signalling
        // its own subscription.
        let Ok(mut observer) = delivery.observer.try_borrow_mut() else {
            trace!("queueing signal raised during delivery");
            delivery.queued.borrow_mut().push_back(notification);
            return true;
        };

        let mut pending = Some(notification);
        while let Some(notification) = pending {
            match notification {
                Notification::Next(value) => observer.next(value),
                Notification::Error(error) => observer.error(error),
                Notification::Complete => observer.complete(),
            }
            pending = delivery.queued.borrow_mut().pop_front();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Register work to run when the subscription closes.
    ///
    /// Runs immediately if the subscription already closed. A panicking
    /// teardown is logged and does not stop the others.
    pub fn add_teardown<F>(&self, teardown: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.add(Box::new(teardown));
    }

    pub fn subscription(&self) -> Subscription {
        Subscription {
            state: Arc::clone(&self.state),
        }
    }
}

/// A cold push stream of `T` values that may fail with `E`.
pub struct Observable<T, E> {
    producer: Box<dyn FnOnce(Subscriber<T, E>) + Send>,
}

impl<T, E> fmt::Debug for Observable<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable").finish_non_exhaustive()
    }
}

impl<T, E> Observable<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create an observable from a producer that runs on subscribe.
    pub fn new<F>(producer: F) -> Self
    where
        F: FnOnce(Subscriber<T, E>) + Send + 'static,
    {
        Self {
            producer: Box::new(producer),
        }
    }

    /// Start delivery to `observer`.
    pub fn subscribe<O>(self, observer: O) -> Subscription
    where
        O: Observer<T, E>,
    {
        let state = Arc::new(SubscriptionState::new());
        let subscriber = Subscriber::new(Box::new(observer), Arc::clone(&state));
        (self.producer)(subscriber);
        Subscription { state }
    }

    pub fn map<U, F>(self, f: F) -> Observable<U, E>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let mut f = f;
        self.filter_map(move |value| Some(f(value)))
    }

    /// Transform values, dropping those mapped to `None`.
    pub fn filter_map<U, F>(self, f: F) -> Observable<U, E>
    where
        U: Send + 'static,
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        Observable::new(move |downstream: Subscriber<U, E>| {
            let upstream = self.subscribe(FilterMap {
                downstream: downstream.clone(),
                f,
            });
            downstream.add_teardown(move || upstream.unsubscribe());
        })
    }

    pub fn map_err<F2, F>(self, f: F) -> Observable<T, F2>
    where
        F2: Send + 'static,
        F: FnMut(E) -> F2 + Send + 'static,
    {
        Observable::new(move |downstream: Subscriber<T, F2>| {
            let upstream = self.subscribe(MapErr {
                downstream: downstream.clone(),
                f,
            });
            downstream.add_teardown(move || upstream.unsubscribe());
        })
    }

    /// Subscribe and expose the signals as a pull stream.
    ///
    /// The stream yields `Ok` for every value, a final `Err` if the
    /// observable fails, and ends after the terminal signal. Dropping it
    /// unsubscribes.
    pub fn into_stream(self) -> ObservableStream<T, E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(tx);
        ObservableStream {
            rx,
            subscription,
            done: false,
        }
    }
}

struct FilterMap<U, E, F> {
    downstream: Subscriber<U, E>,
    f: F,
}

impl<T, U, E, F> Observer<T, E> for FilterMap<U, E, F>
where
    U: Send + 'static,
    E: Send + 'static,
    F: FnMut(T) -> Option<U> + Send + 'static,
{
    fn next(&mut self, value: T) {
        if let Some(mapped) = (self.f)(value) {
            self.downstream.next(mapped);
        }
    }

    fn error(&mut self, error: E) {
        self.downstream.error(error);
    }

    fn complete(&mut self) {
        self.downstream.complete();
    }
}

struct MapErr<T, F2, F> {
    downstream: Subscriber<T, F2>,
    f: F,
}

impl<T, E, F2, F> Observer<T, E> for MapErr<T, F2, F>
where
    T: Send + 'static,
    F2: Send + 'static,
    F: FnMut(E) -> F2 + Send + 'static,
{
    fn next(&mut self, value: T) {
        self.downstream.next(value);
    }

    fn error(&mut self, error: E) {
        self.downstream.error((self.f)(error));
    }

    fn complete(&mut self) {
        self.downstream.complete();
    }
}

/// Pull view of a subscribed [`Observable`].
pub struct ObservableStream<T, E> {
    rx: mpsc::UnboundedReceiver<Notification<T, E>>,
    subscription: Subscription,
    done: bool,
}

impl<T, E> ObservableStream<T, E> {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl<T, E> Unpin for ObservableStream<T, E> {}

impl<T, E> Stream for ObservableStream<T, E> {
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Notification::Next(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(Notification::Error(error))) => {
                self.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(Some(Notification::Complete)) | Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl<T, E> Drop for ObservableStream<T, E> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}
