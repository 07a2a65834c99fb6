//! Turns mDNS discoveries into local waiter ports.
//!
//! Each discovered remote appears as a sequencer port named after it;
//! the session is only dialed when somebody subscribes. Discoveries
//! are filtered by the configured name regexes (the negative filter
//! wins) and deduplicated by name: a second announcement of a known
//! name just adds another endpoint to the existing waiter.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info, warn};
use regex::Regex;
use rtpmidi_core::poller::Reactor;
use rtpmidi_core::Connection;

use crate::mdns::{DiscoveryEvent, MdnsService};
use crate::peers::LocalWaiter;
use crate::router::{MidiRouter, PeerId};
use crate::sequencer::Sequencer;
use crate::settings::Settings;

struct KnownRemote {
    name: String,
    waiter_id: PeerId,
    waiter: Rc<LocalWaiter>,
}

pub struct RemoteHandler {
    inner: Rc<HandlerInner>,
}

struct HandlerInner {
    reactor: Reactor,
    router: Rc<MidiRouter>,
    seq: Rc<dyn Sequencer>,
    enabled: bool,
    positive: Option<Regex>,
    negative: Option<Regex>,
    remotes: RefCell<Vec<KnownRemote>>,
    _connections: RefCell<Vec<Connection>>,
}

impl RemoteHandler {
    pub fn new(
        reactor: &Reactor,
        router: &Rc<MidiRouter>,
        seq: &Rc<dyn Sequencer>,
        mdns: &MdnsService,
        settings: &Settings,
    ) -> anyhow::Result<RemoteHandler> {
        let (positive, negative) = settings.discover_filters()?;
        let inner = Rc::new(HandlerInner {
            reactor: reactor.clone(),
            router: Rc::clone(router),
            seq: Rc::clone(seq),
            enabled: settings.rtpmidi_discover.enabled,
            positive,
            negative,
            remotes: RefCell::new(Vec::new()),
            _connections: RefCell::new(Vec::new()),
        });

        let mut connections = Vec::new();
        let weak = Rc::downgrade(&inner);
        connections.push(mdns.discovered().connect(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.discover_peer(event);
            }
        }));
        let weak = Rc::downgrade(&inner);
        connections.push(mdns.removed().connect(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.remove_peer(event);
            }
        }));
        *inner._connections.borrow_mut() = connections;

        Ok(RemoteHandler { inner })
    }

    pub fn known_count(&self) -> usize {
        self.inner.remotes.borrow().len()
    }
}

impl HandlerInner {
    fn should_add(&self, event: &DiscoveryEvent) -> bool {
        if !self.enabled {
            return false;
        }
        let fullname = format!("{}:{} - {}", event.hostname, event.port, event.name);
        if let Some(negative) = &self.negative {
            if negative.is_match(&fullname) {
                return false;
            }
        }
        match &self.positive {
            Some(positive) => positive.is_match(&fullname),
            None => true,
        }
    }

    fn discover_peer(&self, event: &DiscoveryEvent) {
        if !self.should_add(event) {
            info!(
                "not adding discovered peer name={} hostname={} port={}, filtered by settings",
                event.name, event.hostname, event.port
            );
            return;
        }

        let port = event.port.to_string();
        {
            let remotes = self.remotes.borrow();
            if let Some(known) = remotes.iter().find(|r| r.name == event.name) {
                debug!("reusing waiter for '{}'", event.name);
                known.waiter.add_endpoint(&event.hostname, &port);
                return;
            }
        }

        info!(
            "discovered peer name={} address={}:{}",
            event.name, event.hostname, event.port
        );
        let waiter = match LocalWaiter::new(
            &self.reactor,
            Rc::clone(&self.seq),
            &event.name,
            &event.hostname,
            &port,
        ) {
            Ok(waiter) => waiter,
            Err(err) => {
                warn!("can not create waiter for '{}': {err}", event.name);
                return;
            }
        };
        let waiter_id = self.router.add_peer(waiter.clone());
        self.remotes.borrow_mut().push(KnownRemote {
            name: event.name.clone(),
            waiter_id,
            waiter,
        });
    }

    fn remove_peer(&self, event: &DiscoveryEvent) {
        let removed = {
            let mut remotes = self.remotes.borrow_mut();
            match remotes.iter().position(|r| r.name == event.name) {
                Some(index) => Some(remotes.remove(index)),
                None => None,
            }
        };
        if let Some(removed) = removed {
            info!("remote '{}' went away, removing its port", removed.name);
            self.router.remove_peer(removed.waiter_id);
        }
    }
}
