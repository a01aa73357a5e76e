//! Push-stream adapters for async sources.
//!
//! This crate turns the async shapes an HTTP client produces into
//! [`Observable`]s with uniform cancellation:
//!
//! - [`adapt`] converts a future or a pull sequence, driving every step
//!   through a caller-chosen [`Scheduler`].
//! - [`EventStreamBridge`] exposes the named channels of a shared
//!   [`EventEmitter`] as independent observables that all fail together when
//!   the emitter reports an error.
//! - [`pipe_body`] connects a byte source to a streaming request body.
//!
//! Unsubscribing always runs the caller's teardown exactly once and stops
//! all further signals.

pub mod adapter;
pub mod body;
pub mod bridge;
pub mod emitter;
pub mod error;
pub mod observable;
pub mod scheduler;

pub use adapter::{adapt, adapt_promise, adapt_sequence, dispatch, Source, Unsubscriber};
pub use body::{pipe_body, BodySink, ByteSource};
pub use bridge::{EventStreamBridge, ERROR_CHANNEL};
pub use emitter::{EventEmitter, Listener, ListenerHandle};
pub use error::{BodyError, EmitterError};
pub use observable::{
    FnObserver, Notification, Observable, ObservableStream, Observer, Subscriber, Subscription,
};
pub use scheduler::{
    default_scheduler, AsapScheduler, AsyncScheduler, Cancellation, ImmediateScheduler,
    Scheduler, SharedScheduler, Task,
};

pub use bytes::Bytes;
