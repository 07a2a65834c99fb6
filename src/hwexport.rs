//! Auto-export of local device ports: when the sequencer announces a
//! new port of a kind the settings select, the bridge mirrors it as a
//! worker port with its own announced network listener.

use std::cell::RefCell;
use std::rc::Rc;

use log::{info, warn};
use rtpmidi_core::poller::Reactor;
use rtpmidi_core::Connection;

use crate::mdns::MdnsService;
use crate::peers::{LocalWorker, NetworkListener};
use crate::router::{MidiRouter, PeerId};
use crate::sequencer::{DeviceKind, PortAnnouncement, Sequencer};
use crate::settings::HwExportKind;

struct Export {
    name: String,
    worker_id: PeerId,
    listener_id: PeerId,
}

pub struct HwExport {
    inner: Rc<ExportInner>,
}

struct ExportInner {
    reactor: Reactor,
    router: Rc<MidiRouter>,
    seq: Rc<dyn Sequencer>,
    mdns: Option<MdnsService>,
    kind: HwExportKind,
    exports: RefCell<Vec<Export>>,
    _connection: RefCell<Option<Connection>>,
}

impl HwExport {
    pub fn new(
        reactor: &Reactor,
        router: &Rc<MidiRouter>,
        seq: &Rc<dyn Sequencer>,
        mdns: Option<MdnsService>,
        kind: HwExportKind,
    ) -> HwExport {
        let inner = Rc::new(ExportInner {
            reactor: reactor.clone(),
            router: Rc::clone(router),
            seq: Rc::clone(seq),
            mdns,
            kind,
            exports: RefCell::new(Vec::new()),
            _connection: RefCell::new(None),
        });

        if kind != HwExportKind::None {
            let weak = Rc::downgrade(&inner);
            let connection = seq.announcements().connect(move |announcement| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_announcement(announcement);
                }
            });
            *inner._connection.borrow_mut() = Some(connection);
        }

        HwExport { inner }
    }

    pub fn export_count(&self) -> usize {
        self.inner.exports.borrow().len()
    }
}

impl ExportInner {
    fn wants(&self, kind: DeviceKind) -> bool {
        match self.kind {
            HwExportKind::None => false,
            HwExportKind::All => true,
            HwExportKind::Hardware => kind == DeviceKind::Hardware,
            HwExportKind::Software => kind == DeviceKind::Software,
            HwExportKind::System => kind == DeviceKind::System,
        }
    }

    fn on_announcement(&self, announcement: &PortAnnouncement) {
        if !self.wants(announcement.kind) {
            return;
        }
        if announcement.added {
            self.add_export(&announcement.name);
        } else {
            self.remove_export(&announcement.name);
        }
    }

    fn add_export(&self, name: &str) {
        if self.exports.borrow().iter().any(|e| e.name == name) {
            return;
        }
        info!("auto-exporting local port '{name}'");

        let worker = match LocalWorker::new(Rc::clone(&self.seq), name) {
            Ok(worker) => worker,
            Err(err) => {
                warn!("can not mirror '{name}': {err}");
                return;
            }
        };
        let listener = match NetworkListener::new(&self.reactor, name, 0, self.mdns.clone()) {
            Ok(listener) => listener,
            Err(err) => {
                warn!("can not open a listener for '{name}': {err}");
                return;
            }
        };

        let worker_id = self.router.add_peer(worker);
        let listener_id = self.router.add_peer(listener);
        self.router.connect(worker_id, listener_id);
        self.router.connect(listener_id, worker_id);
        self.exports.borrow_mut().push(Export {
            name: name.to_string(),
            worker_id,
            listener_id,
        });
    }

    fn remove_export(&self, name: &str) {
        let export = {
            let mut exports = self.exports.borrow_mut();
            exports
                .iter()
                .position(|e| e.name == name)
                .map(|index| exports.remove(index))
        };
        if let Some(export) = export {
            info!("removing auto-export of '{}'", export.name);
            self.router.remove_peer(export.worker_id);
            self.router.remove_peer(export.listener_id);
        }
    }
}
