//! Daemon entry point: parse the command line, load settings, build
//! the router graph from them and run the reactor until a signal
//! closes it.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use rtpmidi_core::poller::Reactor;
use rtpmidi_core::rtpclient::{Endpoint, RtpClient};

use rtp_midi_bridge::control::ControlSocket;
use rtp_midi_bridge::hwexport::HwExport;
use rtp_midi_bridge::mdns::MdnsService;
use rtp_midi_bridge::peers::{
    LocalMultiListener, LocalWaiter, NetworkClientPeer, NetworkListener, NetworkMultiListener,
    RawMidiPeer,
};
use rtp_midi_bridge::remote_handler::RemoteHandler;
use rtp_midi_bridge::router::MidiRouter;
use rtp_midi_bridge::sequencer::{Sequencer, VirtualSequencer};
use rtp_midi_bridge::settings::{ConnectTo, RawMidiSettings, Settings};

static EXITING: AtomicBool = AtomicBool::new(false);

thread_local! {
    // The daemon is single-threaded, so the signal handler runs on the
    // same thread that owns the reactor and can close it directly.
    static ACTIVE_REACTOR: std::cell::RefCell<Option<Reactor>> =
        const { std::cell::RefCell::new(None) };
}

extern "C" fn on_terminate(_signum: libc::c_int) {
    if EXITING.swap(true, Ordering::SeqCst) {
        // Second signal: the polite way did not work.
        std::process::exit(1);
    }
    // Closing the reactor makes the wait loop fall through, so the
    // graph tears down and connected remotes get their goodbyes.
    ACTIVE_REACTOR.with(|slot| {
        if let Some(reactor) = slot.borrow().as_ref() {
            reactor.close();
        }
    });
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_terminate as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_terminate as libc::sighandler_t);
    }
}

struct Args {
    config: Option<PathBuf>,
    name: Option<String>,
    port: Option<u16>,
    control: Option<String>,
    connect: Vec<String>,
}

fn print_help() {
    println!(
        "rtp-midi-bridge {}, bridge between RTP-MIDI network sessions and local MIDI ports\n\
         \n\
         Usage: rtp-midi-bridge [options]\n\
         \n\
         Options:\n\
         \x20 --config <file>      settings file (TOML)\n\
         \x20 --name <name>        name announced on the network\n\
         \x20 --port <port>        control port to listen at (MIDI port is one above)\n\
         \x20 --control <path>     control socket path\n\
         \x20 --connect <host[:port]>  connect to a remote at startup (repeatable)\n\
         \x20 --version            print the version and exit\n\
         \x20 --help               this text",
        env!("CARGO_PKG_VERSION")
    );
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = Args {
        config: None,
        name: None,
        port: None,
        control: None,
        connect: Vec::new(),
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |what: &str| {
            it.next()
                .with_context(|| format!("missing value for {what}"))
        };
        match arg.as_str() {
            "--config" => args.config = Some(PathBuf::from(value("--config")?)),
            "--name" => args.name = Some(value("--name")?),
            "--port" => {
                args.port = Some(
                    value("--port")?
                        .parse()
                        .context("--port takes a number")?,
                )
            }
            "--control" => args.control = Some(value("--control")?),
            "--connect" => args.connect.push(value("--connect")?),
            "--version" => {
                println!("rtp-midi-bridge {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            other => bail!("unknown argument {other:?}, try --help"),
        }
    }
    Ok(Some(args))
}

fn apply_overrides(settings: &mut Settings, args: &Args) {
    if let Some(name) = &args.name {
        settings.alsa_name = name.clone();
        for announce in &mut settings.rtpmidi_announces {
            announce.name = name.clone();
        }
        for announce in &mut settings.alsa_announces {
            announce.name = name.clone();
        }
    }
    if let Some(port) = args.port {
        if let Some(announce) = settings.rtpmidi_announces.first_mut() {
            announce.port = port;
        }
    }
    if let Some(control) = &args.control {
        settings.control_filename = control.clone();
    }
    for target in &args.connect {
        let (hostname, port) = match target.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                (host.to_string(), port.to_string())
            }
            _ => (target.clone(), "5004".to_string()),
        };
        settings.connect_to.push(ConnectTo {
            name: hostname.clone(),
            hostname,
            port,
        });
    }
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    apply_overrides(&mut settings, &args);
    settings.validate()?;
    info!("starting with {settings}");

    install_signal_handlers();

    let reactor = Reactor::new()?;
    ACTIVE_REACTOR.with(|slot| *slot.borrow_mut() = Some(reactor.clone()));
    let seq: Rc<dyn Sequencer> = VirtualSequencer::new();
    let router = MidiRouter::new();

    let mdns = match MdnsService::new(&reactor) {
        Ok(mdns) => Some(mdns),
        Err(err) => {
            warn!("mDNS unavailable, no discovery or announcements: {err:#}");
            None
        }
    };

    let _control = match ControlSocket::new(
        &reactor,
        &router,
        std::path::Path::new(&settings.control_filename),
    ) {
        Ok(control) => Some(control),
        Err(err) => {
            warn!("running without a control socket: {err:#}");
            None
        }
    };

    let _remote_handler = mdns
        .as_ref()
        .map(|mdns| RemoteHandler::new(&reactor, &router, &seq, mdns, &settings))
        .transpose()?;

    // The shared local ports.
    for announce in &settings.alsa_announces {
        let listener = LocalMultiListener::new(&reactor, Rc::clone(&seq), &announce.name, mdns.clone())
            .with_context(|| format!("creating local port '{}'", announce.name))?;
        router.add_peer(listener);
    }

    // The announced network listeners.
    for announce in &settings.rtpmidi_announces {
        let listener = NetworkMultiListener::new(
            &reactor,
            Rc::clone(&seq),
            &announce.name,
            announce.port,
            mdns.clone(),
        )
        .with_context(|| {
            format!(
                "binding listener '{}' at port {}",
                announce.name, announce.port
            )
        })?;
        router.add_peer(listener);
    }

    // Static outbound connections.
    for connect in &settings.connect_to {
        let name = if connect.name.is_empty() {
            &connect.hostname
        } else {
            &connect.name
        };
        let waiter = LocalWaiter::new(
            &reactor,
            Rc::clone(&seq),
            name,
            &connect.hostname,
            &connect.port,
        )
        .with_context(|| format!("creating port for remote '{name}'"))?;
        router.add_peer(waiter);
    }

    // Raw device bridges.
    for rawmidi in &settings.rawmidi {
        add_rawmidi_bridge(&reactor, &router, rawmidi, mdns.clone())?;
    }

    let _hw_export = HwExport::new(
        &reactor,
        &router,
        &seq,
        mdns.clone(),
        settings.alsa_hw_auto_export.kind,
    );

    info!("waiting for connections");
    while reactor.is_open() && !EXITING.load(Ordering::SeqCst) {
        reactor.wait(Some(Duration::from_millis(500)));
    }

    info!("shutting down");
    ACTIVE_REACTOR.with(|slot| slot.borrow_mut().take());
    reactor.close();
    // The graph drops here; still-connected sessions send their BYs on
    // the way out.
    Ok(())
}

/// A raw device either dials out (hostname set) or listens locally.
fn add_rawmidi_bridge(
    reactor: &Reactor,
    router: &Rc<MidiRouter>,
    rawmidi: &RawMidiSettings,
    mdns: Option<MdnsService>,
) -> Result<()> {
    let name = if rawmidi.name.is_empty() {
        &rawmidi.device
    } else {
        &rawmidi.name
    };
    let device = RawMidiPeer::new(reactor, name, &rawmidi.device);
    let device_id = router.add_peer(device);

    if rawmidi.hostname.is_empty() {
        let listener = NetworkListener::new(reactor, name, rawmidi.local_udp_port, mdns)
            .with_context(|| format!("binding raw-MIDI listener '{name}'"))?;
        let listener_id = router.add_peer(listener);
        router.connect(device_id, listener_id);
        router.connect(listener_id, device_id);
    } else {
        let client = RtpClient::new(reactor, name.clone());
        let endpoints = vec![Endpoint::new(
            rawmidi.hostname.clone(),
            rawmidi.remote_udp_port.to_string(),
        )];
        let worker = NetworkClientPeer::new(client);
        let worker_id = router.add_peer(worker.clone());
        router.connect(device_id, worker_id);
        router.connect(worker_id, device_id);
        worker.client().connect_to(endpoints);
    }
    Ok(())
}
