// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use quick_xml::{Reader, events::Event};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::socket::SocketOptions;

/// TLS material for a listener. The hub itself does not terminate TLS;
/// these paths are handed to whatever does.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TlsInfo {
    pub cert: PathBuf,
    pub pkey: PathBuf,
    pub trusted_path: PathBuf,
    pub dh: PathBuf,
}

/// One `Server` element: where to listen and which addresses to publish.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ServerInfo {
    pub port: u16,
    pub bind4: Option<Ipv4Addr>,
    pub bind6: Option<Ipv6Addr>,
    /// Published IPv4 address, e.g. for HBRI validation requests.
    pub address4: Option<String>,
    /// Published IPv6 address.
    pub address6: Option<String>,
    pub tls: Option<TlsInfo>,
}

impl ServerInfo {
    pub fn secure(&self) -> bool {
        self.tls.is_some()
    }

    /// The socket addresses this element binds; plain any-v4 when no bind
    /// address was configured.
    pub fn bind_addrs(&self) -> Vec<SocketAddr> {
        let mut out = Vec::with_capacity(2);
        if let Some(bind4) = self.bind4 {
            out.push(SocketAddr::from((bind4, self.port)));
        }
        if let Some(bind6) = self.bind6 {
            out.push(SocketAddr::from((bind6, self.port)));
        }
        if out.is_empty() {
            out.push(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)));
        }
        out
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct LogSettings {
    pub enabled: bool,
    /// Log file path; `%`-style date patterns are expanded at startup.
    pub file: String,
}

/// Hub settings, as loaded from the XML settings document.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct HubConfig {
    pub hub_name: String,
    pub description: String,
    pub log: LogSettings,

    /// Longest accepted command line in bytes, terminator included.
    pub max_command_size: usize,
    /// Read chunk size hint.
    pub buffer_size: usize,
    /// Per-connection out-queue cap in bytes; 0 disables it.
    pub max_buffer_size: usize,
    #[serde(with = "serde_millis")]
    pub overflow_timeout: Duration,
    #[serde(with = "serde_millis")]
    pub disconnect_timeout: Duration,
    /// Time a connection gets to reach NORMAL.
    #[serde(with = "serde_millis")]
    pub log_timeout: Duration,
    #[serde(with = "serde_millis")]
    pub hbri_timeout: Duration,

    pub servers: Vec<Arc<ServerInfo>>,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            hub_name: "ADC Hub".to_string(),
            description: String::new(),
            log: LogSettings::default(),
            max_command_size: 16 * 1024,
            buffer_size: 64,
            max_buffer_size: 16 * 1024,
            overflow_timeout: Duration::from_millis(60_000),
            disconnect_timeout: Duration::from_millis(10_000),
            log_timeout: Duration::from_millis(30_000),
            hbri_timeout: Duration::from_millis(5_000),
            servers: Vec::new(),
        }
    }
}

impl HubConfig {
    /// Loads the settings document, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<HubConfig> {
        let s = fs::read_to_string(&path).with_context(|| {
            format!("failed to read config file {:?}", path.as_ref())
        })?;
        let mut cfg = HubConfig::from_xml_str(&s).context("failed to parse config XML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Parses the `<ADCHub>` document: a `Settings` block of simple tags and
    /// a `Servers` block of `Server` elements.
    pub fn from_xml_str(xml: &str) -> Result<HubConfig> {
        #[derive(PartialEq)]
        enum Section {
            None,
            Settings,
            Servers,
        }

        let mut cfg = HubConfig::default();
        let mut reader = Reader::from_str(xml);

        let mut section = Section::None;
        let mut setting: Option<String> = None;

        loop {
            match reader.read_event().context("malformed XML")? {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    match section {
                        Section::None if name == "Settings" => section = Section::Settings,
                        Section::None if name == "Servers" => section = Section::Servers,
                        Section::Settings => setting = Some(name),
                        Section::Servers if name == "Server" => {
                            cfg.servers.push(Arc::new(parse_server(&e)?));
                        }
                        _ => {}
                    }
                }
                Event::Empty(e) => {
                    if section == Section::Servers && e.name().as_ref() == b"Server" {
                        cfg.servers.push(Arc::new(parse_server(&e)?));
                    }
                }
                Event::Text(t) => {
                    if let Some(tag) = &setting {
                        let value = t.unescape().context("bad text node")?;
                        cfg.apply_setting(tag, value.trim())?;
                    }
                }
                Event::End(e) => {
                    let name = e.name();
                    if setting.as_deref().map(str::as_bytes) == Some(name.as_ref()) {
                        setting = None;
                    } else {
                        match name.as_ref() {
                            b"Settings" | b"Servers" => section = Section::None,
                            _ => {}
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(cfg)
    }

    fn apply_setting(&mut self, tag: &str, value: &str) -> Result<()> {
        let millis = |v: &str| -> Result<Duration> {
            Ok(Duration::from_millis(v.parse().with_context(|| {
                format!("setting {tag} is not a millisecond count: {v:?}")
            })?))
        };
        match tag {
            "HubName" => self.hub_name = value.to_string(),
            "Description" => self.description = value.to_string(),
            "Log" => self.log.enabled = value == "1",
            "LogFile" => self.log.file = value.to_string(),
            "MaxCommandSize" => {
                self.max_command_size = value
                    .parse()
                    .with_context(|| format!("bad MaxCommandSize {value:?}"))?;
            }
            "BufferSize" => {
                self.buffer_size = value
                    .parse()
                    .with_context(|| format!("bad BufferSize {value:?}"))?;
            }
            "MaxBufferSize" => {
                self.max_buffer_size = value
                    .parse()
                    .with_context(|| format!("bad MaxBufferSize {value:?}"))?;
            }
            "OverflowTimeout" => self.overflow_timeout = millis(value)?,
            "DisconnectTimeout" => self.disconnect_timeout = millis(value)?,
            "LogTimeout" => self.log_timeout = millis(value)?,
            "HbriTimeout" => self.hbri_timeout = millis(value)?,
            other => debug!(tag = other, "ignoring unknown setting"),
        }
        Ok(())
    }

    /// Validates invariants after loading.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.max_command_size > 0,
            "MaxCommandSize must be positive"
        );
        ensure!(self.buffer_size > 0, "BufferSize must be positive");
        for server in &self.servers {
            ensure!(server.port > 0, "Server needs a non-zero Port");
        }
        Ok(())
    }

    /// The per-connection limits the socket layer runs with.
    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            buffer_size: self.buffer_size,
            max_command_size: self.max_command_size,
            max_buffer_size: self.max_buffer_size,
            overflow_timeout: self.overflow_timeout,
            disconnect_timeout: self.disconnect_timeout,
        }
    }
}

fn parse_server(e: &quick_xml::events::BytesStart<'_>) -> Result<ServerInfo> {
    let mut server = ServerInfo::default();
    let mut tls = TlsInfo::default();
    let mut has_tls = false;

    for attr in e.attributes() {
        let attr = attr.context("bad Server attribute")?;
        let value = attr.unescape_value().context("bad Server attribute value")?;
        let value = value.as_ref();
        match attr.key.as_ref() {
            b"Port" => {
                server.port = value
                    .parse()
                    .with_context(|| format!("bad Server Port {value:?}"))?;
            }
            b"BindAddress4" => {
                server.bind4 = Some(
                    value
                        .parse()
                        .with_context(|| format!("bad BindAddress4 {value:?}"))?,
                );
            }
            b"BindAddress6" => {
                server.bind6 = Some(
                    value
                        .parse()
                        .with_context(|| format!("bad BindAddress6 {value:?}"))?,
                );
            }
            b"HubAddress4" => server.address4 = Some(value.to_string()),
            b"HubAddress6" => server.address6 = Some(value.to_string()),
            b"TLS" => has_tls = value == "1" || value.eq_ignore_ascii_case("true"),
            b"Certificate" => tls.cert = PathBuf::from(value),
            b"PrivateKey" => tls.pkey = PathBuf::from(value),
            b"TrustedPath" => tls.trusted_path = PathBuf::from(value),
            b"DHParams" => tls.dh = PathBuf::from(value),
            other => {
                debug!(
                    attr = %String::from_utf8_lossy(other),
                    "ignoring unknown Server attribute"
                );
            }
        }
    }

    if server.port == 0 {
        bail!("Server element without a Port attribute");
    }
    if has_tls {
        server.tls = Some(tls);
    }
    Ok(server)
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
