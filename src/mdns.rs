//! mDNS advertise/browse adapter for `_apple-midi._udp`.
//!
//! The mdns-sd daemon runs its own threads; the bridge drains its
//! event channel from a periodic reactor timer so every signal still
//! fires on the main thread. Announcements of our own listeners are
//! filtered out of the discovery stream.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use mdns_sd::{Receiver, ServiceDaemon, ServiceEvent, ServiceInfo};
use rtpmidi_core::poller::{Reactor, Timer};
use rtpmidi_core::Signal;

const SERVICE_TYPE: &str = "._apple-midi._udp.local.";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A remote RTP-MIDI service seen on (or gone from) the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub name: String,
    pub hostname: String,
    pub port: u16,
}

struct MdnsInner {
    daemon: ServiceDaemon,
    receiver: Receiver<ServiceEvent>,
    reactor: Reactor,
    /// Instance names we announced; skipped in discovery.
    announced: RefCell<HashSet<String>>,
    /// fullname → last resolved event, for removals.
    resolved: RefCell<HashMap<String, DiscoveryEvent>>,
    poll_timer: RefCell<Timer>,
    discovered: Signal<DiscoveryEvent>,
    removed: Signal<DiscoveryEvent>,
}

#[derive(Clone)]
pub struct MdnsService {
    inner: Rc<MdnsInner>,
}

impl MdnsService {
    pub fn new(reactor: &Reactor) -> Result<MdnsService> {
        let daemon = ServiceDaemon::new().context("starting the mDNS responder")?;
        let receiver = daemon
            .browse(&SERVICE_TYPE[1..])
            .context("browsing for RTP-MIDI services")?;

        let service = MdnsService {
            inner: Rc::new(MdnsInner {
                daemon,
                receiver,
                reactor: reactor.clone(),
                announced: RefCell::new(HashSet::new()),
                resolved: RefCell::new(HashMap::new()),
                poll_timer: RefCell::new(Timer::disabled()),
                discovered: Signal::new(),
                removed: Signal::new(),
            }),
        };
        MdnsInner::arm_poll_timer(&service.inner);
        Ok(service)
    }

    pub fn discovered(&self) -> &Signal<DiscoveryEvent> {
        &self.inner.discovered
    }

    pub fn removed(&self) -> &Signal<DiscoveryEvent> {
        &self.inner.removed
    }

    /// Advertise one of our listeners.
    pub fn announce(&self, name: &str, port: u16) {
        let host = format!("{name}.local.");
        let properties: Option<std::collections::HashMap<String, String>> = None;
        let info = match ServiceInfo::new(&SERVICE_TYPE[1..], name, &host, "", port, properties)
            .map(|info| info.enable_addr_auto())
        {
            Ok(info) => info,
            Err(err) => {
                warn!("can not build mDNS record for '{name}': {err}");
                return;
            }
        };
        self.inner.announced.borrow_mut().insert(name.to_string());
        if let Err(err) = self.inner.daemon.register(info) {
            warn!("can not announce '{name}' on port {port}: {err}");
            return;
        }
        info!("announced '{name}' at UDP port {port}");
    }

    pub fn unannounce(&self, name: &str, port: u16) {
        self.inner.announced.borrow_mut().remove(name);
        let fullname = format!("{name}{SERVICE_TYPE}");
        if let Err(err) = self.inner.daemon.unregister(&fullname) {
            debug!("could not withdraw '{name}' (port {port}): {err}");
        } else {
            info!("withdrew announcement of '{name}'");
        }
    }
}

impl MdnsInner {
    fn arm_poll_timer(self_rc: &Rc<MdnsInner>) {
        let weak = Rc::downgrade(self_rc);
        let timer = self_rc.reactor.add_timer(POLL_INTERVAL, move || {
            if let Some(inner) = weak.upgrade() {
                inner.drain_events();
                MdnsInner::arm_poll_timer(&inner);
            }
        });
        *self_rc.poll_timer.borrow_mut() = timer;
    }

    fn drain_events(&self) {
        while let Ok(event) = self.receiver.try_recv() {
            match event {
                ServiceEvent::ServiceResolved(info) => self.on_resolved(&info),
                ServiceEvent::ServiceRemoved(_ty, fullname) => self.on_removed(&fullname),
                _ => {}
            }
        }
    }

    fn on_resolved(&self, info: &ServiceInfo) {
        let fullname = info.get_fullname().to_string();
        let name = instance_name(&fullname);
        if self.announced.borrow().contains(&name) {
            debug!("skipping our own announcement '{name}'");
            return;
        }
        let event = DiscoveryEvent {
            name,
            hostname: info.get_hostname().trim_end_matches('.').to_string(),
            port: info.get_port(),
        };
        debug!(
            "discovered '{}' at {}:{}",
            event.name, event.hostname, event.port
        );
        self.resolved.borrow_mut().insert(fullname, event.clone());
        self.discovered.emit(&event);
    }

    fn on_removed(&self, fullname: &str) {
        let known = self.resolved.borrow_mut().remove(fullname);
        if let Some(event) = known {
            debug!("'{}' went away", event.name);
            self.removed.emit(&event);
        }
    }
}

/// `Synth._apple-midi._udp.local.` → `Synth`.
fn instance_name(fullname: &str) -> String {
    fullname
        .split_once("._apple-midi")
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| fullname.to_string())
}
