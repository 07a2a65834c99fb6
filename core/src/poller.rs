//! Single-threaded reactor.
//!
//! One [`Reactor`] per thread drives every socket, timer and deferred
//! call in the process. File descriptors are watched level-triggered
//! through epoll; timers are one-shot and sorted by deadline; deferred
//! calls run between dispatch phases, which is the escape hatch for
//! callbacks that must destroy the object currently calling them.
//!
//! Each `wait()` turn proceeds in order: drain deferred calls, block on
//! epoll until the next timer deadline (or `max_wait`), dispatch fd
//! handlers, drain deferred calls, fire due timers in deadline order,
//! drain deferred calls once more.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::error::{Error, Result};

const MAX_EVENTS: usize = 10;
// Not forever, but a lot.
const IDLE_WAIT: Duration = Duration::from_secs(10_000);

type FdHandler = Rc<RefCell<dyn FnMut(RawFd)>>;

struct TimerEntry {
    deadline: Instant,
    id: u64,
    callback: Box<dyn FnOnce()>,
}

struct Inner {
    epoll_fd: Cell<RawFd>,
    fd_handlers: RefCell<HashMap<RawFd, FdHandler>>,
    timers: RefCell<Vec<TimerEntry>>,
    later: RefCell<Vec<Box<dyn FnOnce()>>>,
    next_timer_id: Cell<u64>,
}

thread_local! {
    static REACTOR_ALIVE: Cell<bool> = const { Cell::new(false) };
}

/// Handle to the thread's reactor. Clones share the same instance.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    /// Create the reactor for this thread. There can be only one;
    /// constructing a second while the first is alive panics.
    pub fn new() -> Result<Reactor> {
        REACTOR_ALIVE.with(|alive| {
            assert!(
                !alive.get(),
                "only one reactor may exist per thread; pass the handle around instead"
            );
            alive.set(true);
        });

        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            REACTOR_ALIVE.with(|alive| alive.set(false));
            return Err(Error::Network(std::io::Error::last_os_error()));
        }

        Ok(Reactor {
            inner: Rc::new(Inner {
                epoll_fd: Cell::new(epoll_fd),
                fd_handlers: RefCell::new(HashMap::new()),
                timers: RefCell::new(Vec::new()),
                later: RefCell::new(Vec::new()),
                next_timer_id: Cell::new(1),
            }),
        })
    }

    pub fn is_open(&self) -> bool {
        self.inner.epoll_fd.get() >= 0
    }

    /// Stop watching descriptors. `wait()` loops usually run while
    /// `is_open()`; closing is how signal handlers stop the daemon.
    pub fn close(&self) {
        let fd = self.inner.epoll_fd.get();
        if fd >= 0 {
            unsafe { libc::close(fd) };
            self.inner.epoll_fd.set(-1);
        }
    }

    pub fn add_fd_in(&self, fd: RawFd, f: impl FnMut(RawFd) + 'static) -> Result<Listener> {
        self.add_fd(fd, libc::EPOLLIN as u32, f)
    }

    pub fn add_fd_out(&self, fd: RawFd, f: impl FnMut(RawFd) + 'static) -> Result<Listener> {
        self.add_fd(fd, libc::EPOLLOUT as u32, f)
    }

    pub fn add_fd_inout(&self, fd: RawFd, f: impl FnMut(RawFd) + 'static) -> Result<Listener> {
        self.add_fd(fd, (libc::EPOLLIN | libc::EPOLLOUT) as u32, f)
    }

    fn add_fd(&self, fd: RawFd, events: u32, f: impl FnMut(RawFd) + 'static) -> Result<Listener> {
        let replaced = self
            .inner
            .fd_handlers
            .borrow_mut()
            .insert(fd, Rc::new(RefCell::new(f)))
            .is_some();
        if replaced {
            warn!("fd {fd} was already registered; keeping only the new handler");
        }

        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let op = if replaced {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let r = unsafe { libc::epoll_ctl(self.inner.epoll_fd.get(), op, fd, &mut ev) };
        if r == -1 {
            self.inner.fd_handlers.borrow_mut().remove(&fd);
            return Err(Error::Network(std::io::Error::last_os_error()));
        }
        Ok(Listener {
            inner: Rc::downgrade(&self.inner),
            fd,
        })
    }

    /// Schedule `f` once, `delay` from now. A zero delay goes through
    /// the deferred-call queue instead of the timer list.
    #[must_use = "dropping the timer handle cancels the timer"]
    pub fn add_timer(&self, delay: Duration, f: impl FnOnce() + 'static) -> Timer {
        if delay.is_zero() {
            self.call_later(f);
            return Timer::disabled();
        }

        let id = self.inner.next_timer_id.get();
        self.inner.next_timer_id.set(id + 1);
        // One extra millisecond absorbs the precision mismatch between
        // the deadline and the millisecond epoll timeout.
        let deadline = Instant::now() + delay + Duration::from_millis(1);

        let mut timers = self.inner.timers.borrow_mut();
        timers.push(TimerEntry {
            deadline,
            id,
            callback: Box::new(f),
        });
        timers.sort_by_key(|entry| (entry.deadline, entry.id));

        Timer {
            inner: Rc::downgrade(&self.inner),
            id,
        }
    }

    /// Run `f` after the current dispatch completes, before any timer.
    pub fn call_later(&self, f: impl FnOnce() + 'static) {
        self.inner.later.borrow_mut().push(Box::new(f));
    }

    /// One reactor turn. See the module docs for the phase order.
    pub fn wait(&self, max_wait: Option<Duration>) {
        let mut wait_for = max_wait.unwrap_or(IDLE_WAIT);
        if let Some(first_deadline) = self.inner.timers.borrow().first().map(|t| t.deadline) {
            let until_timer = first_deadline.saturating_duration_since(Instant::now());
            wait_for = wait_for.min(until_timer);
        }

        self.run_later_queue();

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut nfds = 0;
        if !wait_for.is_zero() && self.is_open() {
            let timeout_ms = wait_for.as_millis().min(i32::MAX as u128) as i32;
            nfds = unsafe {
                libc::epoll_wait(
                    self.inner.epoll_fd.get(),
                    events.as_mut_ptr(),
                    MAX_EVENTS as i32,
                    timeout_ms,
                )
            };
            if nfds < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    error!("epoll_wait failed: {err}");
                }
                nfds = 0;
            }
        }

        for event in events.iter().take(nfds as usize) {
            let fd = event.u64 as RawFd;
            // The handler table must not stay borrowed during dispatch;
            // handlers add and remove descriptors.
            let handler = self.inner.fd_handlers.borrow().get(&fd).cloned();
            if let Some(handler) = handler {
                (handler.borrow_mut())(fd);
            }
        }

        self.run_later_queue();
        self.run_due_timers();
        self.run_later_queue();
    }

    fn run_due_timers(&self) {
        loop {
            let entry = {
                let mut timers = self.inner.timers.borrow_mut();
                match timers.first() {
                    Some(first) if first.deadline <= Instant::now() => Some(timers.remove(0)),
                    _ => None,
                }
            };
            match entry {
                Some(entry) => (entry.callback)(),
                None => break,
            }
        }
    }

    fn run_later_queue(&self) {
        loop {
            let batch: Vec<Box<dyn FnOnce()>> = std::mem::take(&mut *self.inner.later.borrow_mut());
            if batch.is_empty() {
                break;
            }
            for f in batch {
                f();
            }
        }
    }
}

impl Inner {
    fn remove_fd(&self, fd: RawFd) {
        self.fd_handlers.borrow_mut().remove(&fd);
        if self.epoll_fd.get() >= 0 {
            let r = unsafe {
                libc::epoll_ctl(
                    self.epoll_fd.get(),
                    libc::EPOLL_CTL_DEL,
                    fd,
                    std::ptr::null_mut(),
                )
            };
            if r == -1 {
                warn!(
                    "could not remove fd {fd} from the poller: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    fn remove_timer(&self, id: u64) {
        self.timers.borrow_mut().retain(|entry| entry.id != id);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let fd = self.epoll_fd.get();
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        REACTOR_ALIVE.with(|alive| alive.set(false));
    }
}

/// Watches one descriptor; dropping it (or calling [`Listener::stop`])
/// deregisters the descriptor.
#[must_use = "dropping the listener deregisters the descriptor"]
pub struct Listener {
    inner: Weak<Inner>,
    fd: RawFd,
}

impl Listener {
    pub fn stop(&mut self) {
        if self.fd >= 0 {
            if let Some(inner) = self.inner.upgrade() {
                inner.remove_fd(self.fd);
            }
            self.fd = -1;
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pending one-shot timer; dropping it cancels the timer. A handle
/// released inside its own callback is a no-op.
#[must_use = "dropping the timer handle cancels the timer"]
#[derive(Default)]
pub struct Timer {
    inner: Weak<Inner>,
    id: u64,
}

impl Timer {
    /// A handle bound to nothing.
    pub fn disabled() -> Timer {
        Timer {
            inner: Weak::new(),
            id: 0,
        }
    }

    pub fn disable(&mut self) {
        if self.id != 0 {
            if let Some(inner) = self.inner.upgrade() {
                inner.remove_timer(self.id);
            }
            self.id = 0;
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn timers_fire_in_deadline_order() {
        let reactor = Reactor::new().unwrap();
        let order: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        let _t3 = reactor.add_timer(Duration::from_millis(30), move || o.borrow_mut().push(3));
        let o = Rc::clone(&order);
        let _t1 = reactor.add_timer(Duration::from_millis(5), move || o.borrow_mut().push(1));
        let o = Rc::clone(&order);
        let _t2 = reactor.add_timer(Duration::from_millis(15), move || o.borrow_mut().push(2));

        let deadline = Instant::now() + Duration::from_millis(300);
        while order.borrow().len() < 3 && Instant::now() < deadline {
            reactor.wait(Some(Duration::from_millis(50)));
        }
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn dropped_timer_never_fires() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let f = Rc::clone(&fired);
        let timer = reactor.add_timer(Duration::from_millis(5), move || f.set(true));
        drop(timer);

        let deadline = Instant::now() + Duration::from_millis(60);
        while Instant::now() < deadline {
            reactor.wait(Some(Duration::from_millis(10)));
        }
        assert!(!fired.get());
    }

    #[test]
    fn zero_delay_timer_runs_in_current_turn() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let f = Rc::clone(&fired);
        let _timer = reactor.add_timer(Duration::ZERO, move || f.set(true));
        reactor.wait(Some(Duration::ZERO));
        assert!(fired.get());
    }

    #[test]
    fn call_later_runs_before_timers() {
        let reactor = Reactor::new().unwrap();
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        let _t = reactor.add_timer(Duration::from_millis(1), move || o.borrow_mut().push("timer"));
        let o = Rc::clone(&order);
        reactor.call_later(move || o.borrow_mut().push("later"));

        let deadline = Instant::now() + Duration::from_millis(100);
        while order.borrow().len() < 2 && Instant::now() < deadline {
            reactor.wait(Some(Duration::from_millis(10)));
        }
        assert_eq!(*order.borrow(), vec!["later", "timer"]);
    }

    #[test]
    fn timer_handle_dropped_inside_own_callback_is_a_noop() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0u32));
        let slot: Rc<RefCell<Timer>> = Rc::new(RefCell::new(Timer::disabled()));

        let f = Rc::clone(&fired);
        let slot2 = Rc::clone(&slot);
        *slot.borrow_mut() = reactor.add_timer(Duration::from_millis(1), move || {
            f.set(f.get() + 1);
            // Releasing our own handle while running must not break
            // the dispatcher.
            *slot2.borrow_mut() = Timer::disabled();
        });

        let deadline = Instant::now() + Duration::from_millis(100);
        while fired.get() == 0 && Instant::now() < deadline {
            reactor.wait(Some(Duration::from_millis(10)));
        }
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn timer_callback_may_add_timers() {
        let reactor = Reactor::new().unwrap();
        let count = Rc::new(Cell::new(0u32));
        let keeper: Rc<RefCell<Timer>> = Rc::new(RefCell::new(Timer::disabled()));

        let reactor2 = reactor.clone();
        let count2 = Rc::clone(&count);
        let keeper2 = Rc::clone(&keeper);
        *keeper.borrow_mut() = reactor.add_timer(Duration::from_millis(1), move || {
            count2.set(count2.get() + 1);
            let count3 = Rc::clone(&count2);
            *keeper2.borrow_mut() =
                reactor2.add_timer(Duration::from_millis(1), move || count3.set(count3.get() + 1));
        });

        let deadline = Instant::now() + Duration::from_millis(200);
        while count.get() < 2 && Instant::now() < deadline {
            reactor.wait(Some(Duration::from_millis(10)));
        }
        assert_eq!(count.get(), 2);
    }

    #[test]
    #[should_panic(expected = "only one reactor")]
    fn second_reactor_on_same_thread_panics() {
        let _first = Reactor::new().unwrap();
        let _second = Reactor::new();
    }
}
