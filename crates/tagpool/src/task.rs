//! Task records, handles, and routing callbacks.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::error::TaskError;
use crate::tag::Tag;

// TaskId - unique identifier for submitted tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(uuid::Uuid);

impl TaskId {
    /// Generate a new unique task ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback receiving a successful task value.
pub type DataCallback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Callback receiving a task failure.
pub type ErrorCallback = Arc<dyn Fn(TaskError) + Send + Sync>;

/// Per-task routing overrides for [`Pool::put_with`](crate::Pool::put_with).
///
/// A per-task callback wins over the pool default for its half of the
/// outcome; a task with neither lands on the result queue.
pub struct TaskOptions<T> {
    pub(crate) on_data: Option<DataCallback<T>>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl<T> Default for TaskOptions<T> {
    fn default() -> Self {
        Self {
            on_data: None,
            on_error: None,
        }
    }
}

impl<T> TaskOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_data(mut self, callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(TaskError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// Completion flag shared between a task record and its handle.
#[derive(Default, Debug)]
pub(crate) struct DoneSignal {
    done: AtomicBool,
    notify: Notify,
}

impl DoneSignal {
    pub(crate) fn set(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

/// Everything the pump needs to route one completed task.
pub(crate) struct TaskRecord<T> {
    pub(crate) id: TaskId,
    pub(crate) tag: Tag,
    pub(crate) borrowed: bool,
    pub(crate) on_data: Option<DataCallback<T>>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) done: Arc<DoneSignal>,
}

impl<T> TaskRecord<T> {
    pub(crate) fn new(tag: Tag, borrowed: bool, options: TaskOptions<T>) -> (Self, TaskHandle) {
        let id = TaskId::new();
        let done = Arc::new(DoneSignal::default());
        let record = Self {
            id,
            tag: tag.clone(),
            borrowed,
            on_data: options.on_data,
            on_error: options.on_error,
            done: Arc::clone(&done),
        };
        let handle = TaskHandle {
            id,
            tag,
            borrowed,
            done,
        };
        (record, handle)
    }
}

/// Handle to a submitted task.
///
/// Results are not delivered through the handle (they follow the callback or
/// queue path); the handle answers identity questions and lets a caller wait
/// for the task's result to have been routed.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    tag: Tag,
    borrowed: bool,
    done: Arc<DoneSignal>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// Whether the task was admitted against the generic pool.
    pub fn is_borrowed(&self) -> bool {
        self.borrowed
    }

    pub fn is_done(&self) -> bool {
        self.done.is_set()
    }

    /// Resolves once the task's outcome has been routed.
    pub async fn wait(&self) {
        self.done.wait().await;
    }
}
