//! Continuations: what happens when an outstanding exchange resolves.
//!
//! A continuation is invoked exactly once, either with the successful
//! response payload or with a timeout, never both — the service table
//! guarantees this by owning each continuation until its slot releases.
//! Invocation never runs inline on the frame-processing path: a
//! continuation returns a deferred [`Task`] which the node hands to the
//! worker pool, so a slow or reentrant callback cannot stall ingestion.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::{ModlinkError, Result};
use crate::pool::{SlotHandle, SlotPool};

/// Deferred work produced by a resolving continuation.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Outcome delivered to a request callback.
#[derive(Debug, Clone)]
pub enum Response {
    /// The response payload, copied out of the receive buffer.
    Payload(Bytes),
    /// The exchange expired before a response arrived.
    Timeout,
}

impl Response {
    /// Whether this outcome is the timeout path.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// A deferred callback for one or more outstanding exchanges.
///
/// Either method may return a task to run on the worker pool, or `None`
/// when nothing further happens (for example a countdown that has not yet
/// reached zero).
pub trait Continuation: Send + Sync + 'static {
    /// A response arrived; `payload` is only valid for the duration of
    /// the call and must be copied if kept.
    fn next(&self, payload: &[u8]) -> Option<Task>;
    /// The exchange expired.
    fn timeout(&self) -> Option<Task>;
}

/// Continuation that discards its outcome.
pub struct NullContinuation;

impl Continuation for NullContinuation {
    fn next(&self, _payload: &[u8]) -> Option<Task> {
        None
    }

    fn timeout(&self) -> Option<Task> {
        None
    }
}

/// Continuation delivering a [`Response`] to a callback.
///
/// The response payload is copied into owned bytes before the task is
/// scheduled, since the receive buffer is reused immediately.
pub struct CallbackContinuation<F> {
    callback: Arc<F>,
}

impl<F> CallbackContinuation<F>
where
    F: Fn(Response) + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl<F> Continuation for CallbackContinuation<F>
where
    F: Fn(Response) + Send + Sync + 'static,
{
    fn next(&self, payload: &[u8]) -> Option<Task> {
        let data = Bytes::copy_from_slice(payload);
        let callback = self.callback.clone();
        Some(Box::new(move || callback(Response::Payload(data))))
    }

    fn timeout(&self) -> Option<Task> {
        let callback = self.callback.clone();
        Some(Box::new(move || callback(Response::Timeout)))
    }
}

/// Pooled continuation satisfied only once all of its associated
/// exchanges have resolved.
///
/// Used for multi-frame requests: the countdown is set to the number of
/// frames, each response decrements it, and the completion task fires on
/// the final decrement. A timeout fires the timeout task instead, once,
/// regardless of how many responses were still pending. The pool slot is
/// released when whichever task runs finishes.
pub struct CountdownContinuation {
    handle: SlotHandle,
    countdown: AtomicI32,
    tasks: Mutex<PendingTasks>,
}

#[derive(Default)]
struct PendingTasks {
    complete: Option<Task>,
    expire: Option<Task>,
}

impl CountdownContinuation {
    fn new(handle: SlotHandle) -> Self {
        Self {
            handle,
            countdown: AtomicI32::new(0),
            tasks: Mutex::new(PendingTasks::default()),
        }
    }

    fn reset(&self) {
        self.countdown.store(0, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.complete = None;
        tasks.expire = None;
    }

    /// Arm the continuation for `countdown` exchanges.
    pub fn set(&self, countdown: i32, complete: Task, expire: Task) {
        let previous = self.countdown.swap(countdown, Ordering::SeqCst);
        if previous != 0 {
            tracing::warn!(previous, "armed continuation with non-zero countdown");
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.complete = Some(complete);
        tasks.expire = Some(expire);
    }

    /// Wrap a pending task so the pool slot releases once it has run.
    fn releasing(&self, task: Option<Task>) -> Task {
        let handle = self.handle.clone();
        Box::new(move || {
            if let Some(task) = task {
                task();
            }
            handle.release();
        })
    }
}

impl Continuation for CountdownContinuation {
    fn next(&self, _payload: &[u8]) -> Option<Task> {
        let value = self.countdown.fetch_sub(1, Ordering::SeqCst) - 1;
        if value == 0 {
            let task = {
                let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
                tasks.expire = None;
                tasks.complete.take()
            };
            Some(self.releasing(task)) // The ultimate invocation.
        } else {
            None
        }
    }

    fn timeout(&self) -> Option<Task> {
        let value = self.countdown.swap(0, Ordering::SeqCst);
        if value > 0 {
            let task = {
                let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
                tasks.complete = None;
                tasks.expire.take()
            };
            Some(self.releasing(task))
        } else {
            None
        }
    }
}

/// Fixed pool of countdown continuations, claimed per multi-frame
/// request and released when the final task runs.
pub struct ContinuationPool {
    pool: SlotPool<CountdownContinuation>,
}

impl ContinuationPool {
    /// Build a pool of `size` continuations (multiple of 32).
    pub fn new(size: usize) -> Self {
        Self {
            pool: SlotPool::new(size, CountdownContinuation::new),
        }
    }

    /// Claim a continuation, surfacing exhaustion as the backoff signal.
    pub fn claim(&self) -> Result<Arc<CountdownContinuation>> {
        let continuation = self.pool.claim().ok_or(ModlinkError::Backoff)?;
        continuation.reset();
        Ok(continuation)
    }

    /// Number of currently claimed continuations.
    pub fn occupied(&self) -> usize {
        self.pool.occupied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callback_continuation_copies_payload() {
        let delivered: Arc<Mutex<Option<Response>>> = Arc::new(Mutex::new(None));
        let sink = delivered.clone();
        let continuation = CallbackContinuation::new(move |response| {
            *sink.lock().unwrap() = Some(response);
        });

        let mut buffer = vec![1u8, 2, 3];
        let task = continuation.next(&buffer).unwrap();
        // The receive buffer is reused before the task runs.
        buffer.fill(0xFF);
        task();

        let Some(Response::Payload(data)) = delivered.lock().unwrap().take() else {
            panic!("expected payload");
        };
        assert_eq!(&data[..], &[1, 2, 3]);
    }

    #[test]
    fn test_callback_continuation_timeout_path() {
        let timed_out = Arc::new(AtomicUsize::new(0));
        let sink = timed_out.clone();
        let continuation = CallbackContinuation::new(move |response| {
            if response.is_timeout() {
                sink.fetch_add(1, Ordering::SeqCst);
            }
        });
        continuation.timeout().unwrap()();
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_null_continuation_is_inert() {
        assert!(NullContinuation.next(&[1, 2]).is_none());
        assert!(NullContinuation.timeout().is_none());
    }

    #[test]
    fn test_countdown_fires_on_final_response() {
        let pool = ContinuationPool::new(32);
        let continuation = pool.claim().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let sink = fired.clone();
        continuation.set(
            3,
            Box::new(move || {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(|| panic!("timeout must not fire")),
        );

        assert!(continuation.next(&[]).is_none());
        assert!(continuation.next(&[]).is_none());
        let task = continuation.next(&[]).expect("final response fires");
        task();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // The slot released once the task ran.
        assert_eq!(pool.occupied(), 0);
    }

    #[test]
    fn test_countdown_timeout_fires_once() {
        let pool = ContinuationPool::new(32);
        let continuation = pool.claim().unwrap();
        let expired = Arc::new(AtomicUsize::new(0));
        let sink = expired.clone();
        continuation.set(
            2,
            Box::new(|| panic!("completion must not fire")),
            Box::new(move || {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(continuation.next(&[]).is_none()); // One response arrives.
        let task = continuation.timeout().expect("first timeout fires");
        task();
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        // Further timeouts are inert: the countdown is already zero.
        assert!(continuation.timeout().is_none());
        assert_eq!(pool.occupied(), 0);
    }

    #[test]
    fn test_pool_exhaustion_backs_off() {
        let pool = ContinuationPool::new(32);
        let claimed: Vec<_> = (0..32).map(|_| pool.claim().unwrap()).collect();
        assert!(matches!(pool.claim(), Err(ModlinkError::Backoff)));
        // Resolving one continuation frees its slot for reuse.
        claimed[0].set(1, Box::new(|| {}), Box::new(|| {}));
        claimed[0].next(&[]).unwrap()();
        assert!(pool.claim().is_ok());
    }
}
