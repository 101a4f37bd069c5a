use anyhow::Context;
use rfc5321::SmtpClientTimeouts;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The runtime configuration, loaded once from a TOML file and
/// then passed explicitly to everything that needs it.
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Product name shown in greetings and `Received` headers
    #[serde(default = "RelayConfig::default_name")]
    pub name: String,

    /// Our own host name
    pub server_name: String,

    /// Internal mailbox that receives all externally originated mail
    pub proxy_address: String,

    /// Envelope sender used when forwarding to `proxy_address`
    pub proxy_envelope: String,

    /// Display name placed in front of rewritten `From` addresses
    #[serde(default)]
    pub from_name: String,

    #[serde(default = "RelayConfig::default_capabilities")]
    pub capabilities: Vec<CapabilityName>,

    #[serde(default)]
    pub listener: ListenerConfig,

    pub relay: UpstreamConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub dkim: Option<DkimConfig>,

    #[serde(default)]
    pub allocation: AllocationSetting,

    #[serde(default)]
    pub users: Vec<User>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub blacklist: BlacklistConfig,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityName {
    SpfCheck,
    BlacklistCheck,
    Pseudonymize,
    LegacyReplyDecode,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    #[serde(default = "ListenerConfig::default_listen")]
    pub listen: String,

    /// Negotiate TLS as soon as the connection is accepted
    /// rather than waiting for STARTTLS
    #[serde(default)]
    pub implicit_tls: bool,

    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,
    #[serde(default)]
    pub tls_private_key: Option<PathBuf>,

    #[serde(
        default = "ListenerConfig::default_timeout",
        with = "humantime_serde"
    )]
    pub read_timeout: Duration,

    #[serde(
        default = "ListenerConfig::default_timeout",
        with = "humantime_serde"
    )]
    pub write_timeout: Duration,

    #[serde(default = "ListenerConfig::default_max_message_size")]
    pub max_message_size: usize,

    /// Permit AUTH on connections that are not protected by TLS
    #[serde(default)]
    pub allow_insecure_auth: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            implicit_tls: false,
            tls_certificate: None,
            tls_private_key: None,
            read_timeout: Self::default_timeout(),
            write_timeout: Self::default_timeout(),
            max_message_size: Self::default_max_message_size(),
            allow_insecure_auth: false,
        }
    }
}

impl ListenerConfig {
    fn default_listen() -> String {
        "0.0.0.0:25".to_string()
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(300)
    }

    fn default_max_message_size() -> usize {
        20 * 1024 * 1024
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// TLS from the first byte
    Tls,
    /// Plaintext connection upgraded with STARTTLS
    #[default]
    StartTls,
    None,
}

/// Where externally originated mail is forwarded to
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// `host:port`, or a socket path when `lmtp` is set
    pub address: String,

    #[serde(default)]
    pub security: Security,

    #[serde(default)]
    pub lmtp: bool,

    /// Name used for HELO/LHLO and for certificate verification.
    /// Defaults to the host part of `address`.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub insecure_tls: bool,

    #[serde(default)]
    pub timeouts: SmtpClientTimeouts,
}

/// Direct delivery of outbound mail to mail exchangers
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DeliveryConfig {
    #[serde(default = "DeliveryConfig::default_port")]
    pub port: u16,

    /// Use STARTTLS when the exchanger advertises it
    #[serde(default = "DeliveryConfig::default_true")]
    pub starttls: bool,

    #[serde(default = "DeliveryConfig::default_true")]
    pub verify_certificates: bool,

    #[serde(default)]
    pub timeouts: SmtpClientTimeouts,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            starttls: true,
            verify_certificates: true,
            timeouts: SmtpClientTimeouts::default(),
        }
    }
}

impl DeliveryConfig {
    fn default_port() -> u16 {
        25
    }

    fn default_true() -> bool {
        true
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DkimConfig {
    pub domain: String,
    pub selector: String,
    /// PEM encoded PKCS#1 RSA private key
    pub private_key: PathBuf,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AllocationSetting {
    #[serde(default)]
    pub to_addresses: HashMap<String, bool>,
    #[serde(default)]
    pub to_domains: HashMap<String, bool>,
    #[serde(default)]
    pub blacklist_hosts: HashSet<String>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct User {
    pub name: String,
    pub password: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Sqlite { path: PathBuf },
    /// Not durable; intended for testing
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("fujinami.db"),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BlacklistConfig {
    #[serde(default = "BlacklistConfig::default_zones")]
    pub zones: Vec<String>,

    /// The client is rejected when it is listed by more
    /// than this many zones
    #[serde(default = "BlacklistConfig::default_threshold")]
    pub threshold: usize,

    #[serde(default = "BlacklistConfig::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            zones: Self::default_zones(),
            threshold: Self::default_threshold(),
            timeout: Self::default_timeout(),
        }
    }
}

impl BlacklistConfig {
    fn default_threshold() -> usize {
        6
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(2)
    }

    fn default_zones() -> Vec<String> {
        DEFAULT_ZONES.iter().map(|z| z.to_string()).collect()
    }
}

const DEFAULT_ZONES: &[&str] = &[
    "aspews.ext.sorbs.net",
    "b.barracudacentral.org",
    "bl.deadbeef.com",
    "bl.spamcop.net",
    "blackholes.five-ten-sg.com",
    "blacklist.woody.ch",
    "bogons.cymru.com",
    "cbl.abuseat.org",
    "combined.abuse.ch",
    "combined.rbl.msrbl.net",
    "db.wpbl.info",
    "dnsbl-1.uceprotect.net",
    "dnsbl-2.uceprotect.net",
    "dnsbl-3.uceprotect.net",
    "dnsbl.cyberlogic.net",
    "dnsbl.dronebl.org",
    "dnsbl.inps.de",
    "dnsbl.sorbs.net",
    "drone.abuse.ch",
    "duinv.aupads.org",
    "dul.dnsbl.sorbs.net",
    "dul.ru",
    "dyna.spamrats.com",
    "dynip.rothen.com",
    "http.dnsbl.sorbs.net",
    "images.rbl.msrbl.net",
    "ips.backscatterer.org",
    "ix.dnsbl.manitu.net",
    "korea.services.net",
    "misc.dnsbl.sorbs.net",
    "noptr.spamrats.com",
    "ohps.dnsbl.net.au",
    "omrs.dnsbl.net.au",
    "orvedb.aupads.org",
    "osps.dnsbl.net.au",
    "osrs.dnsbl.net.au",
    "owfs.dnsbl.net.au",
    "owps.dnsbl.net.au",
    "pbl.spamhaus.org",
    "phishing.rbl.msrbl.net",
    "probes.dnsbl.net.au",
    "proxy.bl.gweep.ca",
    "proxy.block.transip.nl",
    "psbl.surriel.com",
    "rdts.dnsbl.net.au",
    "residential.block.transip.nl",
    "ricn.dnsbl.net.au",
    "rmst.dnsbl.net.au",
    "sbl.spamhaus.org",
    "short.rbl.jp",
    "smtp.dnsbl.sorbs.net",
    "socks.dnsbl.sorbs.net",
    "spam.abuse.ch",
    "spam.dnsbl.sorbs.net",
    "spam.rbl.msrbl.net",
    "spam.spamrats.com",
    "spamlist.or.kr",
    "spamrbl.imp.ch",
    "t3direct.dnsbl.net.au",
    "tor.dnsbl.sectoor.de",
    "torserver.tor.dnsbl.sectoor.de",
    "ubl.lashback.com",
    "ubl.unsubscore.com",
    "virbl.bit.nl",
    "virus.rbl.jp",
    "virus.rbl.msrbl.net",
    "web.dnsbl.sorbs.net",
    "wormrbl.imp.ch",
    "xbl.spamhaus.org",
    "zen.spamhaus.org",
    "zombie.dnsbl.sorbs.net",
];

impl RelayConfig {
    fn default_name() -> String {
        "Fujinami SMTP Transfer".to_string()
    }

    fn default_capabilities() -> Vec<CapabilityName> {
        vec![
            CapabilityName::SpfCheck,
            CapabilityName::BlacklistCheck,
            CapabilityName::Pseudonymize,
        ]
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("loading config from file {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(data: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (label, addr) in [
            ("proxy_address", &self.proxy_address),
            ("proxy_envelope", &self.proxy_envelope),
        ] {
            if !addr.contains('@') {
                anyhow::bail!("{label} {addr:?} is not an email address");
            }
        }
        if self.relay.lmtp && self.relay.security != Security::None {
            anyhow::bail!("relay: LMTP doesn't support TLS; set security = \"none\"");
        }
        if self.listener.tls_certificate.is_some() != self.listener.tls_private_key.is_some() {
            anyhow::bail!("listener: tls_certificate and tls_private_key must be set together");
        }
        if self.blacklist.zones.is_empty()
            && self.capabilities.contains(&CapabilityName::BlacklistCheck)
        {
            anyhow::bail!("blacklist-check is enabled but no zones are configured");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    const MINIMAL: &str = r#"
server_name = "mx.example.jp"
proxy_address = "inbox@internal.example"
proxy_envelope = "relay@example.jp"

[relay]
address = "127.0.0.1:2525"
"#;

    #[test]
    fn defaults() {
        let config = RelayConfig::parse(MINIMAL).unwrap();
        assert_equal!(config.name, "Fujinami SMTP Transfer");
        assert_equal!(config.relay.security, Security::StartTls);
        assert_equal!(config.blacklist.zones.len(), 71);
        assert_equal!(config.blacklist.threshold, 6);
        assert_equal!(config.blacklist.timeout, Duration::from_secs(2));
        assert_equal!(config.delivery.port, 25);
        assert_equal!(config.listener.listen, "0.0.0.0:25");
        assert_equal!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("fujinami.db")
            }
        );
        assert!(config.dkim.is_none());
    }

    #[test]
    fn full() {
        let config = RelayConfig::parse(
            r#"
name = "Relay"
server_name = "mx.example.jp"
proxy_address = "inbox@internal.example"
proxy_envelope = "relay@example.jp"
from_name = "Support"
capabilities = ["blacklist-check", "legacy-reply-decode"]

[listener]
listen = "127.0.0.1:2525"
read_timeout = "30s"
allow_insecure_auth = true

[relay]
address = "/run/dovecot/lmtp"
lmtp = true
security = "none"

[relay.timeouts]
data_timeout = "1m"

[dkim]
domain = "example.jp"
selector = "s1"
private_key = "/etc/fujinami/dkim.pem"

[allocation]
to_addresses = { "Sales@Example.jp" = true }
to_domains = { "example.jp" = true }
blacklist_hosts = ["spam.example"]

[[users]]
name = "staff"
password = "secret"

[store]
backend = "memory"

[blacklist]
zones = ["zen.spamhaus.org"]
threshold = 0
timeout = "500ms"
"#,
        )
        .unwrap();

        assert_equal!(
            config.capabilities,
            vec![
                CapabilityName::BlacklistCheck,
                CapabilityName::LegacyReplyDecode
            ]
        );
        assert_equal!(config.listener.read_timeout, Duration::from_secs(30));
        assert_equal!(config.relay.timeouts.data_timeout, Duration::from_secs(60));
        assert_equal!(config.store, StoreConfig::Memory);
        assert_equal!(config.users[0].name, "staff");
        assert_equal!(config.blacklist.timeout, Duration::from_millis(500));
        assert_equal!(config.allocation.to_addresses.get("Sales@Example.jp"), Some(&true));
    }

    #[test]
    fn lmtp_with_tls_is_rejected() {
        let err = RelayConfig::parse(&MINIMAL.replace(
            "address = \"127.0.0.1:2525\"",
            "address = \"/run/lmtp\"\nlmtp = true",
        ))
        .unwrap_err();
        assert_equal!(
            err.to_string(),
            "relay: LMTP doesn't support TLS; set security = \"none\""
        );
    }

    #[test]
    fn unknown_fields_are_errors() {
        assert!(RelayConfig::parse(&format!("{MINIMAL}\n[bogus]\nx = 1\n")).is_err());
    }
}
