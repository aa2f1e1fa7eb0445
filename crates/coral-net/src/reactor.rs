//! A cooperative single-threaded event loop over sockets and timers.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::trace;

/// Identifier of a timer registered with a [`Reactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// Callback invoked when a registered event source becomes ready.
pub type SocketHandler = Box<dyn FnMut(&mut Reactor)>;

/// Callback invoked when a timer fires.
pub type TimerHandler = Box<dyn FnMut(&mut Reactor, TimerId)>;

struct SocketEntry {
    /// Taken out for the duration of a dispatch, so the handler itself can
    /// borrow the reactor mutably.
    handler: Option<SocketHandler>,
}

struct TimerEntry {
    deadline: Instant,
    /// `Some` for repeating timers, `None` for one-shot.
    interval: Option<Duration>,
    handler: Option<TimerHandler>,
}

/// A cooperative event loop over a set of sockets and a set of timers.
///
/// One tick polls all registered sockets with the earliest timer deadline
/// as the timeout, fires due timers, then fires ready-socket callbacks in
/// registration order. Handlers may add and remove sockets and timers
/// freely, including their own; changes take effect immediately, and
/// tokens/timer IDs are never reused.
///
/// The reactor is not thread-safe. Cross-thread wakeups go through a
/// [`mio::Waker`] created against [`Reactor::registry`] with a token from
/// [`Reactor::alloc_token`] (see `CommThread`).
pub struct Reactor {
    poll: Poll,
    sockets: HashMap<Token, SocketEntry>,
    timers: HashMap<TimerId, TimerEntry>,
    next_token: usize,
    next_timer: u64,
    stop_requested: bool,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_poll(Poll::new()?))
    }

    /// Builds a reactor around an existing poll instance.
    ///
    /// Used when a waker must be created against the poll's registry
    /// before the reactor exists (see `CommThread`).
    pub fn with_poll(poll: Poll) -> Self {
        Self {
            poll,
            sockets: HashMap::new(),
            timers: HashMap::new(),
            next_token: 0,
            next_timer: 0,
            stop_requested: false,
        }
    }

    /// The mio registry, for registering and reregistering event sources.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Allocates a fresh token. Tokens are never reused.
    pub fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Registers an event source for readable events and installs its
    /// readiness handler. Returns the token assigned to the source.
    pub fn add_socket<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        handler: impl FnMut(&mut Reactor) + 'static,
    ) -> io::Result<Token> {
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(source, token, Interest::READABLE)?;
        self.set_handler(token, handler);
        Ok(token)
    }

    /// Installs (or replaces) the readiness handler for a token whose
    /// source was registered directly through [`Reactor::registry`].
    pub fn set_handler(&mut self, token: Token, handler: impl FnMut(&mut Reactor) + 'static) {
        self.sockets.insert(
            token,
            SocketEntry {
                handler: Some(Box::new(handler)),
            },
        );
    }

    /// Removes a socket: deregisters the source and drops its handler.
    pub fn remove_socket<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> io::Result<()> {
        self.sockets.remove(&token);
        self.poll.registry().deregister(source)
    }

    /// Drops the handler for a token without touching the source.
    ///
    /// Used when the source is already gone (e.g. the stream was dropped).
    pub fn clear_handler(&mut self, token: Token) {
        self.sockets.remove(&token);
    }

    /// Schedules a one-shot timer.
    pub fn add_oneshot_timer(
        &mut self,
        delay: Duration,
        handler: impl FnMut(&mut Reactor, TimerId) + 'static,
    ) -> TimerId {
        self.add_timer_entry(delay, None, Box::new(handler))
    }

    /// Schedules a repeating timer with a fixed interval.
    pub fn add_repeating_timer(
        &mut self,
        interval: Duration,
        handler: impl FnMut(&mut Reactor, TimerId) + 'static,
    ) -> TimerId {
        self.add_timer_entry(interval, Some(interval), Box::new(handler))
    }

    fn add_timer_entry(
        &mut self,
        delay: Duration,
        interval: Option<Duration>,
        handler: TimerHandler,
    ) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.timers.insert(
            id,
            TimerEntry {
                deadline: Instant::now() + delay,
                interval,
                handler: Some(handler),
            },
        );
        id
    }

    /// Cancels a timer. Cancelling an already-fired one-shot timer is a
    /// no-op.
    pub fn remove_timer(&mut self, id: TimerId) {
        self.timers.remove(&id);
    }

    /// Postpones a timer's next deadline to `delay` from now, keeping its
    /// handler and repetition. No-op for unknown IDs.
    pub fn reset_timer(&mut self, id: TimerId, delay: Duration) {
        if let Some(entry) = self.timers.get_mut(&id) {
            entry.deadline = Instant::now() + delay;
        }
    }

    /// Requests that [`Reactor::run`] return at the next tick boundary.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Runs the event loop until [`Reactor::stop`] is called, or until
    /// there is nothing left to wait for (no sockets and no timers).
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(128);
        self.stop_requested = false;
        loop {
            if self.stop_requested {
                trace!("reactor stopped");
                return Ok(());
            }
            if self.sockets.is_empty() && self.timers.is_empty() {
                trace!("reactor idle with nothing registered; returning");
                return Ok(());
            }
            self.tick(&mut events)?;
        }
    }

    /// Runs a single tick with an optional extra timeout bound.
    ///
    /// Useful for callers that interleave the reactor with other work.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> io::Result<()> {
        let mut events = Events::with_capacity(128);
        self.tick_bounded(&mut events, max_wait)
    }

    fn tick(&mut self, events: &mut Events) -> io::Result<()> {
        self.tick_bounded(events, None)
    }

    fn tick_bounded(&mut self, events: &mut Events, max_wait: Option<Duration>) -> io::Result<()> {
        let now = Instant::now();
        let mut timeout = self
            .timers
            .values()
            .map(|t| t.deadline.saturating_duration_since(now))
            .min();
        if let Some(max) = max_wait {
            timeout = Some(timeout.map_or(max, |t| t.min(max)));
        }

        events.clear();
        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        self.fire_due_timers();

        // Ready-socket callbacks run in registration order, which token
        // allocation order preserves.
        let mut ready: Vec<Token> = events.iter().map(|e| e.token()).collect();
        ready.sort_unstable();
        ready.dedup();
        for token in ready {
            self.dispatch_socket(token);
        }
        Ok(())
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let mut due: Vec<(Instant, TimerId)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, t)| (t.deadline, *id))
            .collect();
        due.sort_unstable();

        for (_, id) in due {
            // The timer may have been removed or re-armed by an earlier
            // handler in this same tick.
            let Some(entry) = self.timers.get_mut(&id) else {
                continue;
            };
            if entry.deadline > now {
                continue;
            }
            let Some(mut handler) = entry.handler.take() else {
                continue;
            };
            let repeating = entry.interval.is_some();
            if let Some(interval) = entry.interval {
                entry.deadline += interval;
            } else {
                self.timers.remove(&id);
            }

            handler(self, id);

            if repeating {
                if let Some(entry) = self.timers.get_mut(&id) {
                    if entry.handler.is_none() {
                        entry.handler = Some(handler);
                    }
                }
            }
        }
    }

    fn dispatch_socket(&mut self, token: Token) {
        let Some(entry) = self.sockets.get_mut(&token) else {
            return;
        };
        let Some(mut handler) = entry.handler.take() else {
            return;
        };

        handler(self);

        // Put the handler back unless the callback removed (or replaced)
        // its own registration.
        if let Some(entry) = self.sockets.get_mut(&token) {
            if entry.handler.is_none() {
                entry.handler = Some(handler);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn oneshot_timer_fires_once() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(RefCell::new(0));
        let fired2 = Rc::clone(&fired);
        reactor.add_oneshot_timer(Duration::from_millis(1), move |r, _| {
            *fired2.borrow_mut() += 1;
            // Keep the reactor alive past the firing to prove one-shot-ness.
            r.add_oneshot_timer(Duration::from_millis(5), |r, _| r.stop());
        });
        reactor.run().unwrap();
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn repeating_timer_fires_until_removed() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(RefCell::new(0));
        let fired2 = Rc::clone(&fired);
        reactor.add_repeating_timer(Duration::from_millis(1), move |r, id| {
            let mut n = fired2.borrow_mut();
            *n += 1;
            if *n == 3 {
                r.remove_timer(id);
                r.stop();
            }
        });
        reactor.run().unwrap();
        assert_eq!(*fired.borrow(), 3);
    }

    #[test]
    fn timer_can_remove_another_timer() {
        let mut reactor = Reactor::new().unwrap();
        let late_fired = Rc::new(RefCell::new(false));
        let late_fired2 = Rc::clone(&late_fired);
        // The late timer would set the flag, but the early timer removes it.
        let late = reactor.add_oneshot_timer(Duration::from_millis(20), move |_, _| {
            *late_fired2.borrow_mut() = true;
        });
        reactor.add_oneshot_timer(Duration::from_millis(1), move |r, _| {
            r.remove_timer(late);
            r.add_oneshot_timer(Duration::from_millis(30), |r, _| r.stop());
        });
        reactor.run().unwrap();
        assert!(!*late_fired.borrow());
    }

    #[test]
    fn run_returns_when_nothing_is_registered() {
        let mut reactor = Reactor::new().unwrap();
        // No sockets, no timers: run() must not block forever.
        reactor.run().unwrap();
    }

    #[test]
    fn reset_timer_postpones_deadline() {
        let mut reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = Rc::clone(&order);
        let slow = reactor.add_oneshot_timer(Duration::from_millis(5), move |_, _| {
            o1.borrow_mut().push("slow");
        });
        let o2 = Rc::clone(&order);
        reactor.add_oneshot_timer(Duration::from_millis(1), move |r, _| {
            // Push "slow" well past "end".
            r.reset_timer(slow, Duration::from_millis(50));
            o2.borrow_mut().push("fast");
        });
        let o3 = Rc::clone(&order);
        reactor.add_oneshot_timer(Duration::from_millis(20), move |r, _| {
            o3.borrow_mut().push("end");
            r.stop();
        });

        reactor.run().unwrap();
        assert_eq!(*order.borrow(), vec!["fast", "end"]);
    }

    #[test]
    fn tokens_are_never_reused() {
        let mut reactor = Reactor::new().unwrap();
        let a = reactor.alloc_token();
        let b = reactor.alloc_token();
        assert_ne!(a, b);
    }
}
