//! Lightweight observer primitive.
//!
//! A [`Signal`] keeps a table of slots keyed by an integer id.
//! [`Signal::connect`] hands back a [`Connection`] whose drop removes
//! the slot. Emission iterates over a snapshot of the table, so slots
//! may disconnect themselves, disconnect others or connect new slots
//! while an emission is in flight; slots added during an emission do
//! not see it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

type Slot<A> = Rc<dyn Fn(&A)>;

struct Inner<A: ?Sized> {
    slots: RefCell<BTreeMap<u32, Slot<A>>>,
    next_id: RefCell<u32>,
}

pub struct Signal<A: ?Sized + 'static> {
    inner: Rc<Inner<A>>,
}

impl<A: ?Sized + 'static> Default for Signal<A> {
    fn default() -> Self {
        Signal::new()
    }
}

impl<A: ?Sized + 'static> Clone for Signal<A> {
    fn clone(&self) -> Self {
        Signal {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A: ?Sized + 'static> Signal<A> {
    pub fn new() -> Self {
        Signal {
            inner: Rc::new(Inner {
                slots: RefCell::new(BTreeMap::new()),
                next_id: RefCell::new(1),
            }),
        }
    }

    /// Register a slot. The slot stays connected for as long as the
    /// returned [`Connection`] is alive. Slots are `Fn` because an
    /// emission may reach the same slot reentrantly (two peers wired
    /// back to back answer each other synchronously).
    #[must_use = "dropping the connection disconnects the slot"]
    pub fn connect(&self, f: impl Fn(&A) + 'static) -> Connection {
        let id = {
            let mut next = self.inner.next_id.borrow_mut();
            let id = *next;
            *next += 1;
            id
        };
        self.inner.slots.borrow_mut().insert(id, Rc::new(f));

        let weak: Weak<Inner<A>> = Rc::downgrade(&self.inner);
        Connection {
            disconnect: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.slots.borrow_mut().remove(&id);
                }
            })),
        }
    }

    /// Call every slot registered at the time of the call.
    ///
    /// The slot table is snapshotted first; slots removed while the
    /// emission runs are skipped, slots added do not take part.
    pub fn emit(&self, arg: &A) {
        let snapshot: Vec<(u32, Slot<A>)> = self
            .inner
            .slots
            .borrow()
            .iter()
            .map(|(id, slot)| (*id, Rc::clone(slot)))
            .collect();

        for (id, slot) in snapshot {
            let still_connected = self.inner.slots.borrow().contains_key(&id);
            if !still_connected {
                continue;
            }
            slot(arg);
        }
    }

    pub fn count(&self) -> usize {
        self.inner.slots.borrow().len()
    }
}

/// Scoped registration handle. Dropping it removes the slot.
#[must_use = "dropping the connection disconnects the slot"]
#[derive(Default)]
pub struct Connection {
    disconnect: Option<Box<dyn FnOnce()>>,
}

impl Connection {
    /// A connection bound to nothing; useful as a placeholder before
    /// the real connection is made.
    pub fn empty() -> Self {
        Connection { disconnect: None }
    }

    pub fn disconnect(&mut self) {
        if let Some(f) = self.disconnect.take() {
            f();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
