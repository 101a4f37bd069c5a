use crate::config::{DeliveryConfig, Security, UpstreamConfig};
use dns_resolver::{MailExchanger, Resolver};
use rfc5321::{ClientError, Response, SmtpClient, SmtpClientTimeouts, TlsOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("LMTP doesn't support TLS")]
    LmtpWithTls,

    #[error("{address}: {source}")]
    Client {
        address: String,
        #[source]
        source: ClientError,
    },

    #[error("{address}: unexpected greeting: {}", response.to_single_line())]
    Greeting { address: String, response: Response },

    #[error("{address} does not advertise STARTTLS")]
    StartTlsUnavailable { address: String },

    #[error("no mail exchanger for {domain}: {reason}")]
    NoMailExchanger { domain: String, reason: String },

    #[error("no usable address for {host}")]
    NoAddress { host: String },
}

impl UpstreamError {
    fn client(address: &str) -> impl FnOnce(ClientError) -> Self + '_ {
        move |source| Self::Client {
            address: address.to_string(),
            source,
        }
    }
}

async fn read_greeting(client: &mut SmtpClient, address: &str) -> Result<(), UpstreamError> {
    let timeout = client.timeouts().ehlo_timeout;
    let banner = client
        .read_response(None, timeout)
        .await
        .map_err(UpstreamError::client(address))?;
    if banner.code != 220 {
        return Err(UpstreamError::Greeting {
            address: address.to_string(),
            response: banner,
        });
    }
    Ok(())
}

async fn transmit(
    mut client: SmtpClient,
    address: &str,
    sender: &str,
    recipient: &str,
    data: &[u8],
) -> Result<Response, UpstreamError> {
    let result = client
        .send_mail(sender, recipient, data)
        .await
        .map_err(UpstreamError::client(address));
    client.quit().await;
    result
}

/// Opens connections to the internal relay target
#[derive(Clone, Debug)]
pub struct UpstreamConnector {
    config: UpstreamConfig,
    helo_name: String,
}

impl UpstreamConnector {
    pub fn new(config: UpstreamConfig, helo_name: &str) -> Self {
        Self {
            config,
            helo_name: helo_name.to_string(),
        }
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    fn tls_options(&self) -> TlsOptions {
        TlsOptions {
            insecure: self.config.insecure_tls,
            alt_name: self.config.host.clone(),
        }
    }

    /// Returns a client that has completed the greeting and
    /// EHLO/LHLO, with TLS in place when configured.
    pub async fn connect(&self) -> Result<SmtpClient, UpstreamError> {
        let address = self.config.address.as_str();
        let timeouts = self.config.timeouts;

        if self.config.lmtp {
            if self.config.security != Security::None {
                return Err(UpstreamError::LmtpWithTls);
            }
            let mut client = connect_lmtp(address, timeouts).await?;
            read_greeting(&mut client, address).await?;
            client
                .lhlo(&self.helo_name)
                .await
                .map_err(UpstreamError::client(address))?;
            return Ok(client);
        }

        let mut client = match self.config.security {
            Security::Tls => {
                let (client, info) = SmtpClient::new_tls(address, self.tls_options(), timeouts)
                    .await
                    .map_err(UpstreamError::client(address))?;
                tracing::debug!(
                    "{address}: TLS {} {}",
                    info.protocol_version,
                    info.cipher
                );
                client
            }
            Security::StartTls | Security::None => SmtpClient::new(address, timeouts)
                .await
                .map_err(UpstreamError::client(address))?,
        };

        read_greeting(&mut client, address).await?;
        let caps = client
            .ehlo(&self.helo_name)
            .await
            .map_err(UpstreamError::client(address))?;

        if self.config.security == Security::StartTls {
            if !caps.contains_key("STARTTLS") {
                return Err(UpstreamError::StartTlsUnavailable {
                    address: address.to_string(),
                });
            }
            let info = client
                .starttls(self.tls_options())
                .await
                .map_err(UpstreamError::client(address))?;
            tracing::debug!(
                "{address}: STARTTLS {} {}",
                info.protocol_version,
                info.cipher
            );
            client
                .ehlo(&self.helo_name)
                .await
                .map_err(UpstreamError::client(address))?;
        }

        Ok(client)
    }

    /// Sends one message over a connection obtained from
    /// [connect](Self::connect), then closes it.
    pub async fn send(
        &self,
        client: SmtpClient,
        sender: &str,
        recipient: &str,
        data: &[u8],
    ) -> Result<Response, UpstreamError> {
        transmit(client, &self.config.address, sender, recipient, data).await
    }

    /// Transmits one message over a fresh connection
    pub async fn forward(
        &self,
        sender: &str,
        recipient: &str,
        data: &[u8],
    ) -> Result<Response, UpstreamError> {
        let client = self.connect().await?;
        self.send(client, sender, recipient, data).await
    }
}

#[cfg(unix)]
async fn connect_lmtp(address: &str, timeouts: SmtpClientTimeouts) -> Result<SmtpClient, UpstreamError> {
    if address.starts_with('/') {
        SmtpClient::new_unix(address, timeouts)
            .await
            .map_err(UpstreamError::client(address))
    } else {
        SmtpClient::new(address, timeouts)
            .await
            .map_err(UpstreamError::client(address))
    }
}

#[cfg(not(unix))]
async fn connect_lmtp(address: &str, timeouts: SmtpClientTimeouts) -> Result<SmtpClient, UpstreamError> {
    SmtpClient::new(address, timeouts)
        .await
        .map_err(UpstreamError::client(address))
}

/// Delivers outbound mail directly to the recipient domain's
/// mail exchangers.
#[derive(Clone)]
pub struct MxDelivery {
    resolver: Arc<dyn Resolver>,
    config: DeliveryConfig,
    helo_name: String,
}

impl MxDelivery {
    pub fn new(resolver: Arc<dyn Resolver>, config: DeliveryConfig, helo_name: &str) -> Self {
        Self {
            resolver,
            config,
            helo_name: helo_name.to_string(),
        }
    }

    pub async fn resolve(&self, domain: &str) -> Result<MailExchanger, UpstreamError> {
        MailExchanger::resolve(self.resolver.as_ref(), domain)
            .await
            .map_err(|err| UpstreamError::NoMailExchanger {
                domain: domain.to_string(),
                reason: format!("{err:#}"),
            })
    }

    /// Tries each exchanger in preference order and stops at the
    /// first one that accepts the message. Returns the host that
    /// accepted it, or the error from the last attempt.
    pub async fn deliver(
        &self,
        mx: &MailExchanger,
        sender: &str,
        recipient: &str,
        data: &[u8],
    ) -> Result<String, UpstreamError> {
        let mut last_error = UpstreamError::NoMailExchanger {
            domain: mx.domain_name.clone(),
            reason: "no hosts".to_string(),
        };

        for host in &mx.hosts {
            match self.deliver_to_host(host, sender, recipient, data).await {
                Ok(response) => {
                    tracing::debug!("{host}: {}", response.to_single_line());
                    return Ok(host.clone());
                }
                Err(err) => {
                    tracing::info!(host, recipient, "delivery attempt failed: {err:#}");
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    async fn deliver_to_host(
        &self,
        host: &str,
        sender: &str,
        recipient: &str,
        data: &[u8],
    ) -> Result<Response, UpstreamError> {
        let addresses = self
            .resolver
            .resolve_ip(host)
            .await
            .map_err(|err| {
                tracing::debug!("{host}: {err:#}");
                UpstreamError::NoAddress {
                    host: host.to_string(),
                }
            })?;

        let mut last_error = UpstreamError::NoAddress {
            host: host.to_string(),
        };
        for ip in addresses {
            let addr = SocketAddr::new(ip, self.config.port);
            match self.connect(host, addr).await {
                Ok(client) => {
                    return transmit(client, host, sender, recipient, data).await;
                }
                Err(err) => {
                    tracing::debug!("{host} ({addr}): {err:#}");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn connect(&self, host: &str, addr: SocketAddr) -> Result<SmtpClient, UpstreamError> {
        let mut client = SmtpClient::new(addr, self.config.timeouts)
            .await
            .map_err(UpstreamError::client(host))?;
        read_greeting(&mut client, host).await?;
        let caps = client
            .ehlo(&self.helo_name)
            .await
            .map_err(UpstreamError::client(host))?;

        if self.config.starttls && caps.contains_key("STARTTLS") {
            let options = TlsOptions {
                insecure: !self.config.verify_certificates,
                alt_name: Some(host.to_string()),
            };
            client
                .starttls(options)
                .await
                .map_err(UpstreamError::client(host))?;
            client
                .ehlo(&self.helo_name)
                .await
                .map_err(UpstreamError::client(host))?;
        }

        Ok(client)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::MockSink;
    use dns_resolver::TestResolver;
    use k9::assert_equal;

    fn upstream(address: String) -> UpstreamConfig {
        UpstreamConfig {
            address,
            security: Security::None,
            lmtp: false,
            host: None,
            insecure_tls: false,
            timeouts: SmtpClientTimeouts::short_timeouts(),
        }
    }

    #[tokio::test]
    async fn forward_plaintext() {
        let sink = MockSink::start().await;
        let connector = UpstreamConnector::new(upstream(sink.addr.to_string()), "mx.example.jp");
        connector
            .forward("relay@example.jp", "inbox@internal.example", b"Subject: x\r\n\r\nhi\r\n")
            .await
            .unwrap();
        let transactions = sink.transactions();
        assert_equal!(transactions.len(), 1);
        assert_equal!(transactions[0].mail_from, "relay@example.jp");
        assert_equal!(transactions[0].rcpt_to, "inbox@internal.example");
        assert_equal!(transactions[0].data, "Subject: x\r\n\r\nhi\r\n");
    }

    #[tokio::test]
    async fn starttls_required_but_missing() {
        let sink = MockSink::start().await;
        let mut config = upstream(sink.addr.to_string());
        config.security = Security::StartTls;
        let err = UpstreamConnector::new(config, "mx.example.jp")
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::StartTlsUnavailable { .. }));
    }

    #[tokio::test]
    async fn lmtp_with_tls_is_refused() {
        let mut config = upstream("/run/lmtp".to_string());
        config.lmtp = true;
        config.security = Security::Tls;
        let err = UpstreamConnector::new(config, "mx.example.jp")
            .connect()
            .await
            .unwrap_err();
        assert_equal!(err.to_string(), "LMTP doesn't support TLS");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lmtp_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lmtp.sock");
        let sink = MockSink::start_unix(&path).await;

        let mut config = upstream(path.display().to_string());
        config.lmtp = true;
        UpstreamConnector::new(config, "mx.example.jp")
            .forward("relay@example.jp", "inbox@internal.example", b"Subject: x\r\n\r\nhi\r\n")
            .await
            .unwrap();
        assert_equal!(sink.transactions().len(), 1);
    }

    fn delivery(resolver: TestResolver, port: u16) -> MxDelivery {
        MxDelivery::new(
            Arc::new(resolver),
            DeliveryConfig {
                port,
                starttls: true,
                verify_certificates: true,
                timeouts: SmtpClientTimeouts::short_timeouts(),
            },
            "mx.example.jp",
        )
    }

    #[tokio::test]
    async fn failover_to_next_exchanger() {
        // The preferred exchanger has no address records
        let good = MockSink::start().await;
        let port = good.addr.port();
        let resolver = TestResolver::new()
            .with_mx("example.com", 5, "gone.example.com")
            .with_mx("example.com", 10, "mx1.example.com")
            .with_ip("mx1.example.com", "127.0.0.1".parse().unwrap());

        let delivery = delivery(resolver, port);
        let mx = delivery.resolve("example.com").await.unwrap();
        assert_equal!(mx.hosts, vec!["gone.example.com".to_string(), "mx1.example.com".to_string()]);
        let host = delivery
            .deliver(&mx, "si-abcd@example.jp", "bob@example.com", b"Subject: x\r\n\r\nhi\r\n")
            .await
            .unwrap();
        assert_equal!(host, "mx1.example.com");
        assert_equal!(good.transactions()[0].mail_from, "si-abcd@example.jp");
    }

    #[tokio::test]
    async fn all_exchangers_fail() {
        let rejecting = MockSink::start_with_rcpt_reply("550 5.1.1 no such user").await;
        let resolver = TestResolver::new()
            .with_mx("example.com", 10, "mx1.example.com")
            .with_ip("mx1.example.com", "127.0.0.1".parse().unwrap());

        let delivery = delivery(resolver, rejecting.addr.port());
        let mx = delivery.resolve("example.com").await.unwrap();
        let err = delivery
            .deliver(&mx, "si-abcd@example.jp", "bob@example.com", b"Subject: x\r\n\r\nhi\r\n")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no such user"), "{err}");
        assert!(rejecting.transactions().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_domain() {
        let delivery = delivery(TestResolver::new(), 25);
        let err = delivery.resolve("nowhere.example").await.unwrap_err();
        assert!(matches!(err, UpstreamError::NoMailExchanger { .. }));
    }
}
