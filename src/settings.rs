//! Daemon configuration: a TOML file plus a handful of command-line
//! overrides. Configuration problems are fatal at startup; nothing
//! here is reloaded at runtime.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Display name of the shared local sequencer port.
    pub alsa_name: String,
    /// Path of the JSON control socket.
    pub control_filename: String,
    /// Listener names and UDP ports to bind and advertise.
    pub rtpmidi_announces: Vec<RtpMidiAnnounce>,
    /// Additional shared local sequencer ports.
    pub alsa_announces: Vec<AlsaAnnounce>,
    /// Static outbound endpoints connected at startup.
    pub connect_to: Vec<ConnectTo>,
    pub rtpmidi_discover: DiscoverSettings,
    pub alsa_hw_auto_export: HwAutoExport,
    pub rawmidi: Vec<RawMidiSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RtpMidiAnnounce {
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlsaAnnounce {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectTo {
    pub hostname: String,
    #[serde(default = "default_port_string")]
    pub port: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverSettings {
    pub enabled: bool,
    /// Discovered names must match this to be auto-connected.
    pub name_positive_regex: String,
    /// Names matching this are never connected; wins over positive.
    pub name_negative_regex: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum HwExportKind {
    #[default]
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "HARDWARE")]
    Hardware,
    #[serde(rename = "SOFTWARE")]
    Software,
    #[serde(rename = "SYSTEM")]
    System,
    #[serde(rename = "ALL")]
    All,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct HwAutoExport {
    #[serde(rename = "type")]
    pub kind: HwExportKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawMidiSettings {
    /// Character device (or FIFO to create) to bridge.
    pub device: String,
    #[serde(default)]
    pub name: String,
    /// When set, connect out to this host instead of listening.
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub local_udp_port: u16,
    #[serde(default = "default_port")]
    pub remote_udp_port: u16,
}

fn default_port() -> u16 {
    5004
}

fn default_port_string() -> String {
    "5004".to_string()
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            alsa_name: "rtpmidi-bridge".to_string(),
            control_filename: "/var/run/rtpmidi-bridge/control.sock".to_string(),
            rtpmidi_announces: vec![RtpMidiAnnounce {
                name: "rtpmidi-bridge".to_string(),
                port: 5004,
            }],
            alsa_announces: vec![AlsaAnnounce {
                name: "rtpmidi-bridge".to_string(),
            }],
            connect_to: Vec::new(),
            rtpmidi_discover: DiscoverSettings::default(),
            alsa_hw_auto_export: HwAutoExport::default(),
            rawmidi: Vec::new(),
        }
    }
}

impl Default for DiscoverSettings {
    fn default() -> DiscoverSettings {
        DiscoverSettings {
            enabled: true,
            name_positive_regex: ".*".to_string(),
            name_negative_regex: String::new(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        let settings: Settings = toml::from_str(&text)
            .with_context(|| format!("parsing settings file {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.discover_filters()?;
        Ok(())
    }

    /// Compiled (positive, negative) discovery filters. An empty
    /// pattern means "no filter".
    pub fn discover_filters(&self) -> Result<(Option<Regex>, Option<Regex>)> {
        let compile = |pattern: &str, which: &str| -> Result<Option<Regex>> {
            if pattern.is_empty() {
                return Ok(None);
            }
            Regex::new(pattern)
                .map(Some)
                .with_context(|| format!("invalid {which} discovery regex: {pattern:?}"))
        };
        Ok((
            compile(&self.rtpmidi_discover.name_positive_regex, "positive")?,
            compile(&self.rtpmidi_discover.name_negative_regex, "negative")?,
        ))
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "alsa_name={} announces={} alsa_announces={} connect_to={} discover={} rawmidi={} control={}",
            self.alsa_name,
            self.rtpmidi_announces.len(),
            self.alsa_announces.len(),
            self.connect_to.len(),
            self.rtpmidi_discover.enabled,
            self.rawmidi.len(),
            self.control_filename,
        )
    }
}
