//! Execution scheduling for stream adapters.
//!
//! A [`Scheduler`] decides when a unit of work runs relative to the host's
//! I/O loop. Adapters never pick a scheduler on their own: callers pass one
//! per subscription, and every step an adapter schedules goes through it.
//!
//! Three schedulers are provided:
//!
//! - [`AsapScheduler`] spawns onto the tokio runtime and runs at the earliest
//!   opportunity.
//! - [`AsyncScheduler`] spawns onto the tokio runtime and yields one turn to
//!   the I/O driver first. This is the default.
//! - [`ImmediateScheduler`] runs the task on the calling thread. Tasks
//!   scheduled while another immediate task is running are queued and
//!   drained in order, so nested scheduling never recurses.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{trace, warn};

/// A unit of scheduled work.
pub type Task = BoxFuture<'static, ()>;

/// A scheduler handed to adapters and to the steps they schedule.
pub type SharedScheduler = Arc<dyn Scheduler>;

/// Strategy for deferring work.
pub trait Scheduler: Send + Sync + 'static {
    /// Queue `task` for execution.
    ///
    /// The returned [`Cancellation`] prevents the task from running if it has
    /// not started yet. Cancelling a task that already started has no effect.
    fn schedule(&self, task: Task) -> Cancellation;
}

/// The scheduler used when a caller does not pick one.
pub fn default_scheduler() -> SharedScheduler {
    Arc::new(AsyncScheduler::new())
}

/// Handle to a scheduled task.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent the task from running. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wrap `task` so it checks this token before doing any work.
    fn guard(&self, task: Task) -> Task {
        let token = self.clone();
        async move {
            if token.is_cancelled() {
                trace!("skipping cancelled task");
                return;
            }
            task.await;
        }
        .boxed()
    }
}

/// Runs tasks on the tokio runtime as soon as a worker picks them up.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsapScheduler;

impl AsapScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for AsapScheduler {
    fn schedule(&self, task: Task) -> Cancellation {
        let cancellation = Cancellation::new();
        spawn_or_run(cancellation.guard(task), false);
        cancellation
    }
}

/// Runs tasks on the tokio runtime after yielding once to the I/O driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncScheduler;

impl AsyncScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for AsyncScheduler {
    fn schedule(&self, task: Task) -> Cancellation {
        let cancellation = Cancellation::new();
        spawn_or_run(cancellation.guard(task), true);
        cancellation
    }
}

/// Runs tasks on the calling thread.
///
/// Each task is driven to completion with a local executor before
/// `schedule` returns, unless another immediate task is already running on
/// this thread, in which case it is queued behind it. Only use this with
/// sources that make progress without the calling thread's help (in-memory
/// sequences, already-resolved futures, work driven by other threads).
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateScheduler;

impl ImmediateScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, task: Task) -> Cancellation {
        let cancellation = Cancellation::new();
        trampoline(cancellation.guard(task));
        cancellation
    }
}

fn spawn_or_run(task: Task, defer: bool) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if defer {
                    tokio::task::yield_now().await;
                }
                task.await;
            });
        }
        Err(_) => {
            warn!("no tokio runtime available, running task on the calling thread");
            trampoline(task);
        }
    }
}

thread_local! {
    static TRAMPOLINE: RefCell<Option<VecDeque<Task>>> = const { RefCell::new(None) };
}

/// Clears the trampoline queue when the draining task finishes or panics.
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        TRAMPOLINE.with(|slot| slot.borrow_mut().take());
    }
}

fn trampoline(task: Task) {
    let first = TRAMPOLINE.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_mut() {
            Some(queue) => {
                queue.push_back(task);
                None
            }
            None => {
                *slot = Some(VecDeque::new());
                Some(task)
            }
        }
    });

    // Someone further up the stack is draining.
    let Some(first) = first else { return };

    let _drain = DrainGuard;
    let mut next = Some(first);
    while let Some(task) = next {
        futures::executor::block_on(task);
        next = TRAMPOLINE.with(|slot| slot.borrow_mut().as_mut().and_then(VecDeque::pop_front));
    }
}
