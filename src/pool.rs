//! Fixed-size worker pool for phase tasks.

use crate::error::{EngineError, RecvError, TaskError};
use crate::io::base::{BaseRx, BaseTx};
use crate::io::mpmc::{MpmcChannel, MpmcReceiver, MpmcSender};
use crate::utils::CancelToken;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pending result of a submitted task.
pub struct TaskHandle<T> {
    name: String,
    rx: MpmcReceiver<Result<T, TaskError>>,
    cancel: CancelToken,
}

impl<T: Send + 'static> TaskHandle<T> {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the task. `None` waits as long as the pool is alive.
    pub fn join(mut self, timeout: Option<Duration>) -> Result<T, TaskError> {
        match self.rx.recv(&self.cancel, timeout) {
            Ok(result) => result,
            Err(RecvError::Timeout) => Err(TaskError::Timeout),
            Err(RecvError::Disconnected) => Err(TaskError::Dropped),
            Err(RecvError::Cancelled) => Err(TaskError::Cancelled),
        }
    }
}

/// N named threads pulling boxed jobs from a shared queue. Panics inside a
/// job are caught and reported through its [`TaskHandle`].
pub struct WorkerPool {
    tx: Mutex<Option<MpmcSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancelToken,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize, cancel: CancelToken) -> Result<Self, EngineError> {
        let size = size.max(1);
        let (tx, rx) = MpmcChannel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let mut rx = rx.clone();
            let cancel = cancel.clone();
            let join = thread::Builder::new()
                .name(format!("tidewatch-worker-{i}"))
                .spawn(move || {
                    loop {
                        match rx.recv(&cancel, None) {
                            Ok(job) => job(),
                            Err(RecvError::Timeout) => continue,
                            Err(RecvError::Disconnected) | Err(RecvError::Cancelled) => break,
                        }
                    }
                })?;
            workers.push(join);
        }
        tracing::debug!("[Pool] started {size} workers");
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            cancel,
            size,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none() || self.cancel.is_cancelled()
    }

    pub fn submit<F, T>(&self, name: impl Into<String>, f: F) -> Result<TaskHandle<T>, EngineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (mut result_tx, result_rx) = MpmcChannel::bounded::<Result<T, TaskError>>(1);
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| TaskError::Panicked(panic_message(&*payload)));
            let _ = result_tx.try_send(result);
        });

        let mut guard = self.tx.lock();
        let tx = guard.as_mut().ok_or(EngineError::PoolClosed)?;
        tx.send(job, &self.cancel, None)
            .map_err(|_| EngineError::PoolClosed)?;

        Ok(TaskHandle {
            name: name.into(),
            rx: result_rx,
            cancel: self.cancel.clone(),
        })
    }

    /// Stops accepting work, lets queued jobs finish and joins the workers
    /// within `timeout`. Workers still busy after that are cancelled and
    /// detached. Returns whether every worker exited in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.tx.lock().take();
        let deadline = Instant::now() + timeout;
        let mut workers = std::mem::take(&mut *self.workers.lock());

        while !workers.iter().all(JoinHandle::is_finished) {
            if Instant::now() >= deadline {
                self.cancel.cancel();
                tracing::warn!(
                    busy = workers.iter().filter(|w| !w.is_finished()).count(),
                    "[Pool] workers did not finish within {timeout:?}, detaching"
                );
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        for w in workers.drain(..) {
            if w.join().is_err() {
                tracing::error!("[Pool] worker thread panicked");
            }
        }
        self.cancel.cancel();
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.lock().take();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_tasks_and_returns_results() {
        let pool = WorkerPool::new(3, CancelToken::new_root()).unwrap();
        let handles: Vec<_> = (0..10)
            .map(|i| pool.submit(format!("t{i}"), move || i * 2).unwrap())
            .collect();
        let sum: i32 = handles
            .into_iter()
            .map(|h| h.join(Some(Duration::from_secs(5))).unwrap())
            .sum();
        assert_eq!(sum, 90);
        assert!(pool.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn panics_are_reported_not_propagated() {
        let pool = WorkerPool::new(1, CancelToken::new_root()).unwrap();
        let bad = pool.submit("bad", || -> u8 { panic!("boom") }).unwrap();
        assert_eq!(
            bad.join(Some(Duration::from_secs(5))),
            Err(TaskError::Panicked("boom".into()))
        );
        // the worker survives
        let ok = pool.submit("ok", || 7u8).unwrap();
        assert_eq!(ok.join(Some(Duration::from_secs(5))), Ok(7));
    }

    #[test]
    fn shutdown_drains_queue_then_rejects() {
        let pool = WorkerPool::new(2, CancelToken::new_root()).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let done = done.clone();
            pool.submit("work", move || {
                thread::sleep(Duration::from_millis(2));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(pool.shutdown(Duration::from_secs(5)));
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(pool.is_closed());
        assert!(matches!(pool.submit("late", || ()), Err(EngineError::PoolClosed)));
    }

    #[test]
    fn join_times_out() {
        let pool = WorkerPool::new(1, CancelToken::new_root()).unwrap();
        let slow = pool
            .submit("slow", || thread::sleep(Duration::from_millis(200)))
            .unwrap();
        assert_eq!(slow.join(Some(Duration::from_millis(5))), Err(TaskError::Timeout));
    }
}
