//! Result pump - serialises outcome delivery and slot release.
//!
//! One pump task per pool drains completions and, for each, runs the same
//! sequence: route the outcome, release the slot, decrement pending, signal
//! waiters. The release must not precede routing; a callback reading
//! `pending` still counts the task being delivered.

use std::panic::AssertUnwindSafe;
use std::sync::Weak;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use crate::error::TaskError;
use crate::pool::PoolShared;
use crate::task::{DataCallback, ErrorCallback, TaskRecord};

pub(crate) struct Delivery<T> {
    pub(crate) record: TaskRecord<T>,
    pub(crate) outcome: Result<T, TaskError>,
}

/// Drain completions for the pool's lifetime. Holds only a weak reference so
/// an abandoned pool lets the pump exit.
pub(crate) async fn pump_loop<T: Send + 'static>(
    shared: Weak<PoolShared<T>>,
    mut rx: mpsc::UnboundedReceiver<Delivery<T>>,
) {
    while let Some(delivery) = rx.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        route(&shared, delivery);
    }
    tracing::debug!("result pump exiting");
}

fn route<T: Send + 'static>(shared: &PoolShared<T>, delivery: Delivery<T>) {
    let Delivery { record, outcome } = delivery;

    match outcome {
        Ok(value) => {
            if let Some(cb) = record.on_data.as_ref() {
                invoke_data(cb, value, &record);
            } else if let Some(cb) = shared.on_data.as_ref() {
                invoke_data(cb, value, &record);
            } else {
                let _ = shared.results_tx.send(Ok(value));
            }
        }
        Err(err) => {
            tracing::debug!(task = %record.id, tag = %record.tag, error = %err, "task failed");
            if let Some(cb) = record.on_error.as_ref() {
                invoke_error(cb, err, &record);
            } else if let Some(cb) = shared.on_error.as_ref() {
                invoke_error(cb, err, &record);
            } else if shared.on_data.is_some() {
                // Data-callback mode makes the result queue unreachable;
                // queueing here would lose the failure and grow unbounded.
                tracing::error!(
                    task = %record.id,
                    tag = %record.tag,
                    error = %err,
                    "unhandled task failure"
                );
            } else {
                let _ = shared.results_tx.send(Err(err));
            }
        }
    }

    shared.ledger.release(&record.tag, record.borrowed);
    shared.pending.fetch_sub(1, Ordering::AcqRel);
    record.done.set();
    shared.progress.notify_waiters();
}

// Callback panics are caught here so the release in `route` still runs.
fn invoke_data<T>(cb: &DataCallback<T>, value: T, record: &TaskRecord<T>) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| cb(value))).is_err() {
        tracing::error!(task = %record.id, tag = %record.tag, "data callback panicked");
    }
}

fn invoke_error<T>(cb: &ErrorCallback, err: TaskError, record: &TaskRecord<T>) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| cb(err))).is_err() {
        tracing::error!(task = %record.id, tag = %record.tag, "error callback panicked");
    }
}
