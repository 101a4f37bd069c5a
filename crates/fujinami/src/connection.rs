use chrono::{DateTime, Local};
use rustls::{CipherSuite, ProtocolVersion};
use std::net::{IpAddr, SocketAddr};

/// What was negotiated when the client connection switched to TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsDescriptor {
    pub version: u16,
    pub cipher_suite: u16,
}

impl TlsDescriptor {
    pub fn from_connection(conn: &rustls::ServerConnection) -> Option<Self> {
        let version = conn.protocol_version()?;
        let suite = conn.negotiated_cipher_suite()?;
        Some(Self {
            version: u16::from(version),
            cipher_suite: u16::from(suite.suite()),
        })
    }

    /// `TLS1_2` style names; unknown versions as `0x%04x`
    pub fn version_name(&self) -> String {
        match ProtocolVersion::from(self.version) {
            ProtocolVersion::TLSv1_0 => "TLS1_0".to_string(),
            ProtocolVersion::TLSv1_1 => "TLS1_1".to_string(),
            ProtocolVersion::TLSv1_2 => "TLS1_2".to_string(),
            ProtocolVersion::TLSv1_3 => "TLS1_3".to_string(),
            _ => format!("0x{:04x}", self.version),
        }
    }

    pub fn cipher_name(&self) -> String {
        match CipherSuite::from(self.cipher_suite).as_str() {
            Some(name) => name.to_string(),
            None => format!("0x{:04x}", self.cipher_suite),
        }
    }
}

/// Facts about the client connection that a session consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub remote: SocketAddr,
    pub local: SocketAddr,
    /// The name given in HELO/EHLO
    pub helo: Option<String>,
    pub tls: Option<TlsDescriptor>,
}

impl ConnectionState {
    pub fn new(remote: SocketAddr, local: SocketAddr) -> Self {
        Self {
            remote,
            local,
            helo: None,
            tls: None,
        }
    }

    /// The peer address, with IPv4-mapped IPv6 addresses from a
    /// dual-stack listener unmapped to plain IPv4
    pub fn remote_ip(&self) -> IpAddr {
        self.remote.ip().to_canonical()
    }

    pub fn helo(&self) -> &str {
        self.helo.as_deref().unwrap_or("unknown")
    }

    /// The value of a `Received` header describing this hop.
    ///
    /// `server_name` and `product` identify us; `now` is passed in
    /// so that the header can be tested.
    pub fn received_header(
        &self,
        server_name: &str,
        product: &str,
        recipient: &str,
        now: DateTime<Local>,
    ) -> String {
        let tls = match &self.tls {
            Some(tls) => format!(
                "(version={} cipher={});\r\n       ",
                tls.version_name(),
                tls.cipher_name()
            ),
            None => ";".to_string(),
        };
        format!(
            "from {helo} ({helo} {remote})\r\n       \
             by {server_name} ({local} {product})\r\n       \
             for <{recipient}>\r\n       \
             {tls}{date}",
            helo = self.helo(),
            remote = self.remote_ip(),
            local = self.local.ip().to_canonical(),
            date = now.format("%a, %d %b %Y %H:%M:%S %z"),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use k9::assert_equal;

    fn state() -> ConnectionState {
        let mut state = ConnectionState::new(
            "192.0.2.10:41000".parse().unwrap(),
            "198.51.100.1:25".parse().unwrap(),
        );
        state.helo.replace("client.example.org".to_string());
        state
    }

    #[test]
    fn tls_names() {
        let tls = TlsDescriptor {
            version: 0x0304,
            cipher_suite: 0x1301,
        };
        assert_equal!(tls.version_name(), "TLS1_3");
        assert_equal!(tls.cipher_name(), "TLS13_AES_128_GCM_SHA256");

        let unknown = TlsDescriptor {
            version: 0x7f1c,
            cipher_suite: 0xfefe,
        };
        assert_equal!(unknown.version_name(), "0x7f1c");
        assert_equal!(unknown.cipher_name(), "0xfefe");
    }

    #[test]
    fn received_plaintext() {
        let now = Local.with_ymd_and_hms(2024, 3, 5, 9, 7, 1).unwrap();
        let header = state().received_header("mx.example.jp", "Fujinami SMTP Transfer", "sales@example.jp", now);
        let date = now.format("%a, %d %b %Y %H:%M:%S %z").to_string();
        assert_equal!(
            header,
            format!(
                "from client.example.org (client.example.org 192.0.2.10)\r\n       \
                 by mx.example.jp (198.51.100.1 Fujinami SMTP Transfer)\r\n       \
                 for <sales@example.jp>\r\n       \
                 ;{date}"
            )
        );
        assert!(date.starts_with("Tue, 05 Mar 2024 09:07:01"));
    }

    #[test]
    fn received_tls() {
        let mut state = state();
        state.tls.replace(TlsDescriptor {
            version: 0x0303,
            cipher_suite: 0xc02f,
        });
        let now = Local.with_ymd_and_hms(2024, 3, 5, 9, 7, 1).unwrap();
        let header = state.received_header("mx.example.jp", "Relay", "sales@example.jp", now);
        assert!(header.contains(
            "(version=TLS1_2 cipher=TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256);\r\n       "
        ));
    }

    #[test]
    fn dual_stack_peer_is_unmapped() {
        let mut state = ConnectionState::new(
            "[::ffff:192.0.2.10]:41000".parse().unwrap(),
            "[::ffff:198.51.100.1]:25".parse().unwrap(),
        );
        state.helo.replace("client.example.org".to_string());
        assert_equal!(state.remote_ip(), "192.0.2.10".parse::<IpAddr>().unwrap());

        let now = Local.with_ymd_and_hms(2024, 3, 5, 9, 7, 1).unwrap();
        let header = state.received_header("mx.example.jp", "Relay", "sales@example.jp", now);
        assert!(header.starts_with(
            "from client.example.org (client.example.org 192.0.2.10)\r\n       \
             by mx.example.jp (198.51.100.1 Relay)"
        ));

        let native = ConnectionState::new(
            "[2001:db8::10]:41000".parse().unwrap(),
            "[2001:db8::1]:25".parse().unwrap(),
        );
        assert_equal!(native.remote_ip(), "2001:db8::10".parse::<IpAddr>().unwrap());
    }
}
