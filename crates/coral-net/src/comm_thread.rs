//! Background communication threads.
//!
//! A [`CommThread`] owns a reactor and a state object on a dedicated
//! thread. Outside code never touches either directly: it posts closures
//! with [`CommThread::execute`], and each closure receives the reactor,
//! the state, and a [`Promise`] through which it (or a callback it
//! installs) eventually delivers a result to the caller's [`Ticket`].
//!
//! If the thread dies (a failed initialization, or an I/O error escaping
//! the event loop), the cause is recorded, and every later submission or
//! wait fails with [`CommError::ThreadDead`] carrying that cause.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use coral_types::CommError;
use mio::{Poll, Token, Waker};
use tracing::{debug, error};

use crate::error::{NetError, NetResult};
use crate::reactor::Reactor;

/// Token reserved for the cross-thread waker; ordinary allocation counts
/// up from zero and never reaches it.
const WAKER_TOKEN: Token = Token(usize::MAX);

type Task<S> = Box<dyn FnOnce(&mut Reactor, &mut S) + Send>;

/// The fulfilment end of a one-shot result hand-off.
///
/// Dropping a promise unfulfilled completes the matching ticket with
/// [`CommError::Aborted`].
pub struct Promise<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Promise<T> {
    /// Delivers the result. Any error means the caller gave up waiting,
    /// which is not the fulfiller's problem.
    pub fn fulfil(self, value: T) {
        let _ = self.tx.send(value);
    }
}

/// The waiting end of a one-shot result hand-off.
pub struct Ticket<T> {
    rx: mpsc::Receiver<T>,
    dead_cause: Arc<Mutex<Option<String>>>,
}

impl<T> Ticket<T> {
    /// Blocks until the promise is fulfilled.
    pub fn wait(self) -> Result<T, CommError> {
        match self.rx.recv() {
            Ok(value) => Ok(value),
            Err(_) => Err(self.disconnect_error()),
        }
    }

    /// Blocks until the promise is fulfilled or the timeout passes.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, CommError> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(CommError::TimedOut),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(self.disconnect_error()),
        }
    }

    fn disconnect_error(&self) -> CommError {
        match self.dead_cause.lock().expect("cause mutex poisoned").clone() {
            Some(cause) => CommError::ThreadDead(cause),
            // The thread is alive; the promise was dropped deliberately.
            None => CommError::Aborted,
        }
    }
}

/// A background thread running a reactor plus a thread-local state object.
///
/// The state is created on the thread itself by the `init` closure, so it
/// does not need to be `Send`.
pub struct CommThread<S: 'static> {
    task_tx: Option<mpsc::Sender<Task<S>>>,
    waker: Arc<Waker>,
    handle: Option<JoinHandle<()>>,
    dead_cause: Arc<Mutex<Option<String>>>,
}

impl<S: 'static> CommThread<S> {
    /// Spawns the thread. `init` runs first on the new thread and builds
    /// the state; if it fails the thread dies immediately and the failure
    /// becomes the recorded cause.
    pub fn spawn<F>(name: &str, init: F) -> NetResult<Self>
    where
        F: FnOnce(&mut Reactor) -> NetResult<S> + Send + 'static,
    {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let dead_cause = Arc::new(Mutex::new(None));
        let (task_tx, task_rx) = mpsc::channel::<Task<S>>();

        let thread_cause = Arc::clone(&dead_cause);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut reactor = Reactor::with_poll(poll);
                let state = match init(&mut reactor) {
                    Ok(state) => Rc::new(RefCell::new(state)),
                    Err(e) => {
                        error!(error = %e, "communication thread initialization failed");
                        *thread_cause.lock().expect("cause mutex poisoned") =
                            Some(e.to_string());
                        return;
                    }
                };

                let task_state = Rc::clone(&state);
                reactor.set_handler(WAKER_TOKEN, move |reactor| {
                    while let Ok(task) = task_rx.try_recv() {
                        task(reactor, &mut task_state.borrow_mut());
                    }
                });

                debug!("communication thread running");
                if let Err(e) = reactor.run() {
                    error!(error = %e, "communication thread event loop failed");
                    *thread_cause.lock().expect("cause mutex poisoned") = Some(e.to_string());
                }
            })?;

        Ok(Self {
            task_tx: Some(task_tx),
            waker,
            handle: Some(handle),
            dead_cause,
        })
    }

    /// Posts a unit of work to the thread. The returned ticket completes
    /// when the work (or a callback it installed) fulfils its promise.
    pub fn execute<R, F>(&self, f: F) -> Result<Ticket<R>, CommError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Reactor, &mut S, Promise<R>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let promise = Promise { tx };
        let task: Task<S> = Box::new(move |reactor, state| f(reactor, state, promise));

        let sender = self
            .task_tx
            .as_ref()
            .expect("task sender present until shutdown");
        sender
            .send(task)
            .map_err(|_| CommError::ThreadDead(self.cause()))?;
        // A failed wake means the thread is gone; the ticket will report it.
        let _ = self.waker.wake();
        Ok(Ticket {
            rx,
            dead_cause: Arc::clone(&self.dead_cause),
        })
    }

    /// Posts work and blocks for its result.
    pub fn execute_wait<R, F>(&self, f: F) -> Result<R, CommError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Reactor, &mut S, Promise<R>) + Send + 'static,
    {
        self.execute(f)?.wait()
    }

    /// True if the thread has died; [`CommThread::cause`] then explains
    /// why.
    pub fn is_dead(&self) -> bool {
        self.dead_cause
            .lock()
            .expect("cause mutex poisoned")
            .is_some()
            || self.handle.as_ref().is_some_and(JoinHandle::is_finished)
    }

    fn cause(&self) -> String {
        self.dead_cause
            .lock()
            .expect("cause mutex poisoned")
            .clone()
            .unwrap_or_else(|| "background thread terminated unexpectedly".to_string())
    }

    /// Stops the reactor and joins the thread.
    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        if let Some(sender) = self.task_tx.take() {
            let stop: Task<S> = Box::new(|reactor, _| reactor.stop());
            let _ = sender.send(stop);
            let _ = self.waker.wake();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<S: 'static> Drop for CommThread<S> {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executes_work_and_returns_result() {
        let thread = CommThread::spawn("test-comm", |_| Ok(41_i32)).unwrap();
        let result = thread
            .execute_wait(|_, state: &mut i32, promise| {
                *state += 1;
                promise.fulfil(*state);
            })
            .unwrap();
        assert_eq!(result, 42);
        thread.shutdown();
    }

    #[test]
    fn work_is_serialized_on_the_thread() {
        let thread = CommThread::spawn("test-comm", |_| Ok(Vec::<u32>::new())).unwrap();
        let mut tickets = Vec::new();
        for i in 0..10 {
            tickets.push(
                thread
                    .execute(move |_, state: &mut Vec<u32>, promise| {
                        state.push(i);
                        promise.fulfil(state.clone());
                    })
                    .unwrap(),
            );
        }
        let last = tickets.pop().unwrap().wait().unwrap();
        assert_eq!(last, (0..10).collect::<Vec<_>>());
        thread.shutdown();
    }

    #[test]
    fn failed_init_marks_thread_dead() {
        let thread: CommThread<()> = CommThread::spawn("test-comm", |_| {
            Err(NetError::ThreadDead("init exploded".into()))
        })
        .unwrap();
        // The ticket (or the send itself, depending on timing) must carry
        // the original cause.
        let outcome = thread
            .execute(|_, _, promise| promise.fulfil(()))
            .and_then(Ticket::wait);
        match outcome {
            Err(CommError::ThreadDead(cause)) => assert!(cause.contains("init exploded")),
            other => panic!("expected ThreadDead, got {other:?}"),
        }
        thread.shutdown();
    }

    #[test]
    fn dropped_promise_reports_aborted() {
        let thread = CommThread::spawn("test-comm", |_| Ok(())).unwrap();
        let ticket: Ticket<()> = thread
            .execute(|_, _, promise| {
                drop(promise);
            })
            .unwrap();
        assert_eq!(ticket.wait(), Err(CommError::Aborted));
        thread.shutdown();
    }

    #[test]
    fn callbacks_can_fulfil_later_via_timers() {
        let thread = CommThread::spawn("test-comm", |_| Ok(())).unwrap();
        let result = thread
            .execute_wait(|reactor, _, promise| {
                let mut promise = Some(promise);
                reactor.add_oneshot_timer(Duration::from_millis(5), move |_, _| {
                    if let Some(p) = promise.take() {
                        p.fulfil("late");
                    }
                });
            })
            .unwrap();
        assert_eq!(result, "late");
        thread.shutdown();
    }
}
