use crate::allocation::AllocationGuard;
use crate::config::{CapabilityName, RelayConfig};
use crate::connection::ConnectionState;
use crate::dkim::DkimSigner;
use crate::dnsbl::{BlacklistScreener, BlacklistVerdict};
use crate::error::RelayError;
use crate::message::{
    decode_thread_header, encode_thread_id, new_message_id, parse_address, split_address, Mail,
};
use crate::pseudonym::PseudonymStore;
use crate::spf::{SpfEvaluator, SpfVerdict};
use crate::upstream::{MxDelivery, UpstreamConnector, UpstreamError};
use chrono::Local;
use dns_resolver::Resolver;
use std::sync::Arc;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Capabilities: u8 {
        /// Evaluate SPF for inbound senders and report it
        const SPF_CHECK = 1;
        /// Refuse inbound mail from addresses on too many blocklists
        const BLACKLIST_CHECK = 2;
        /// Substitute pseudonyms for internal senders
        const PSEUDONYMIZE = 4;
        /// Embed the recipient in forwarded Message-IDs and recover
        /// it from replies
        const LEGACY_REPLY_DECODE = 8;
    }
}

impl Capabilities {
    pub fn from_names(names: &[CapabilityName]) -> Self {
        names.iter().fold(Self::empty(), |caps, name| {
            caps | match name {
                CapabilityName::SpfCheck => Self::SPF_CHECK,
                CapabilityName::BlacklistCheck => Self::BLACKLIST_CHECK,
                CapabilityName::Pseudonymize => Self::PSEUDONYMIZE,
                CapabilityName::LegacyReplyDecode => Self::LEGACY_REPLY_DECODE,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Mail from the outside world, forwarded to the internal relay
    Inbound,
    /// Mail from authenticated internal users, delivered via MX
    Outbound,
}

/// Everything a session needs, built once at startup
pub struct RelayContext {
    pub config: RelayConfig,
    pub capabilities: Capabilities,
    pub allocation: AllocationGuard,
    pub store: PseudonymStore,
    pub screener: BlacklistScreener,
    pub spf: Arc<dyn SpfEvaluator>,
    pub dkim: Option<DkimSigner>,
    pub upstream: UpstreamConnector,
    pub delivery: MxDelivery,
}

impl RelayContext {
    pub fn new(
        config: RelayConfig,
        resolver: Arc<dyn Resolver>,
        store: PseudonymStore,
        spf: Arc<dyn SpfEvaluator>,
    ) -> anyhow::Result<Self> {
        let dkim = match &config.dkim {
            Some(dkim) => Some(DkimSigner::load(dkim)?),
            None => None,
        };
        let helo_name = config.server_name.as_str();
        Ok(Self {
            capabilities: Capabilities::from_names(&config.capabilities),
            allocation: AllocationGuard::new(&config.allocation),
            screener: BlacklistScreener::new(resolver.clone(), &config.blacklist),
            upstream: UpstreamConnector::new(config.relay.clone(), helo_name),
            delivery: MxDelivery::new(resolver, config.delivery.clone(), helo_name),
            store,
            spf,
            dkim,
            config,
        })
    }

    fn has(&self, cap: Capabilities) -> bool {
        self.capabilities.contains(cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Envelope {
    Idle,
    HaveFrom { from: String },
    HaveTo { from: String, to: String },
}

/// One SMTP transaction at a time, for one connection
pub struct Session {
    ctx: Arc<RelayContext>,
    direction: Direction,
    envelope: Envelope,
    spf: Option<SpfVerdict>,
}

impl Session {
    pub fn new(ctx: Arc<RelayContext>, direction: Direction) -> Self {
        Self {
            ctx,
            direction,
            envelope: Envelope::Idle,
            spf: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// True between MAIL and the end of DATA or RSET
    pub fn in_transaction(&self) -> bool {
        self.envelope != Envelope::Idle
    }

    /// Whether DATA may begin; checked before the client is
    /// invited to send the message
    pub fn expect_data(&self) -> Result<(), RelayError> {
        match self.envelope {
            Envelope::HaveTo { .. } => Ok(()),
            _ => Err(RelayError::NeedRcpt),
        }
    }

    pub fn reset(&mut self) {
        self.envelope = Envelope::Idle;
        self.spf = None;
    }

    pub async fn mail(&mut self, conn: &ConnectionState, from: &str) -> Result<(), RelayError> {
        if self.envelope != Envelope::Idle {
            return Err(RelayError::NestedMail);
        }
        if from.is_empty() {
            tracing::info!(
                helo = conn.helo(),
                remote = %conn.remote,
                "empty MAIL FROM refused"
            );
            return Err(RelayError::EmptySender);
        }
        tracing::debug!("MAIL FROM: {from}");

        if self.direction == Direction::Inbound && self.ctx.has(Capabilities::SPF_CHECK) {
            self.spf = Some(
                self.ctx
                    .spf
                    .evaluate(conn.remote_ip(), conn.helo(), from)
                    .await,
            );
        }

        self.envelope = Envelope::HaveFrom {
            from: from.to_string(),
        };
        Ok(())
    }

    pub fn rcpt(&mut self, to: &str) -> Result<(), RelayError> {
        let from = match &self.envelope {
            Envelope::Idle => return Err(RelayError::NeedMail),
            Envelope::HaveFrom { from } => from.clone(),
            Envelope::HaveTo { .. } => return Err(RelayError::BadSequence),
        };
        tracing::debug!("RCPT TO: {to}");

        match self.direction {
            Direction::Inbound => self.ctx.allocation.allocate(&from, to)?,
            Direction::Outbound => {
                if !self.ctx.allocation.allowed_to(&from) {
                    tracing::info!(from, to, check = "sender", "outbound sender not allowed");
                    return Err(RelayError::PolicyDenied(from));
                }
            }
        }

        self.envelope = Envelope::HaveTo {
            from,
            to: to.to_string(),
        };
        Ok(())
    }

    /// Relays the message. The transaction is over afterwards,
    /// whether or not that succeeded.
    pub async fn data(&mut self, conn: &ConnectionState, data: &[u8]) -> Result<(), RelayError> {
        let (from, to) = match &self.envelope {
            Envelope::HaveTo { from, to } => (from.clone(), to.clone()),
            _ => return Err(RelayError::NeedRcpt),
        };
        let spf = self.spf.take();
        self.reset();

        match self.direction {
            Direction::Inbound => self.inbound(conn, spf, &from, &to, data).await,
            Direction::Outbound => self.outbound(conn, &from, &to, data).await,
        }
    }

    async fn inbound(
        &self,
        conn: &ConnectionState,
        spf: Option<SpfVerdict>,
        from: &str,
        to: &str,
        data: &[u8],
    ) -> Result<(), RelayError> {
        let ctx = &self.ctx;
        let config = &ctx.config;
        let remote_ip = conn.remote_ip();

        let mut screened = None;
        if ctx.has(Capabilities::BLACKLIST_CHECK) {
            let verdict = ctx.screener.screen(remote_ip).await;
            if verdict.listed {
                tracing::info!(
                    helo = conn.helo(),
                    remote = %remote_ip,
                    from,
                    to,
                    positive_count = verdict.positive_count,
                    "refused blacklisted client"
                );
                return Err(RelayError::ReputationRejected {
                    positive_count: verdict.positive_count,
                });
            }
            screened = Some(verdict);
        }

        let client = ctx.upstream.connect().await.map_err(|err| {
            tracing::error!("connecting to relay {}: {err:#}", ctx.upstream.address());
            RelayError::transient(err)
        })?;

        let mail = match Mail::parse(data) {
            Ok(mail) => Some(mail),
            Err(err) => {
                tracing::warn!(from, to, "forwarding unparsed message: {err:#}");
                None
            }
        };

        let mut body = data.to_vec();
        if let Some(mut mail) = mail {
            if let Err(err) = self.record_senders(&mail, to).await {
                tracing::error!(from, to, "recording sender: {err:#}");
                client.quit().await;
                return Err(RelayError::transient(err));
            }

            if ctx.has(Capabilities::LEGACY_REPLY_DECODE) {
                let original = match mail.headers.get("Message-ID") {
                    Some(header) => header.unfolded(),
                    None => new_message_id(&config.server_name),
                };
                let thread_id = encode_thread_id(to, &original);
                if !mail.headers.replace("Message-ID", thread_id.as_str()) {
                    mail.headers.push("Message-ID", thread_id);
                }
                body = mail.to_bytes();
            }
        }

        let mut message = vec![];
        let mut push = |key: &str, value: String| {
            message.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        };
        if let Some(BlacklistVerdict { positive_count, .. }) = screened {
            push("X-Blacklist-Count", format!("{positive_count} ({remote_ip})"));
        }
        push("Return-Path", format!("<{from}>"));
        push("X-Transfer-To", format!("<{}>", config.proxy_address));
        push("Deliverd-To", format!("<{to}>"));
        if let Some(spf) = &spf {
            push("Authentication-Results", spf.header_value(&config.server_name));
        }
        push(
            "Received",
            conn.received_header(&config.server_name, &config.name, to, Local::now()),
        );
        message.extend_from_slice(&body);

        ctx.upstream
            .send(client, &config.proxy_envelope, &config.proxy_address, &message)
            .await
            .map_err(|err| {
                tracing::error!(from, to, "relaying to {}: {err:#}", ctx.upstream.address());
                RelayError::transient(err)
            })?;

        tracing::info!(
            helo = conn.helo(),
            remote = %remote_ip,
            from,
            to,
            "relayed inbound message"
        );
        Ok(())
    }

    /// Remembers which internal address each `From` wrote to, so that
    /// replies reuse it
    async fn record_senders(&self, mail: &Mail, to: &str) -> anyhow::Result<()> {
        for header in mail.headers.get_all("From") {
            let external = parse_address(&header.value);
            if external.is_empty() {
                continue;
            }
            self.ctx.store.record(&external, to).await?;
        }
        Ok(())
    }

    async fn outbound(
        &self,
        conn: &ConnectionState,
        from: &str,
        to: &str,
        data: &[u8],
    ) -> Result<(), RelayError> {
        let ctx = &self.ctx;
        let config = &ctx.config;

        let mut mail = Mail::parse(data).map_err(|err| RelayError::MessageInvalid(err.to_string()))?;
        mail.check()
            .map_err(|err| RelayError::MessageInvalid(err.to_string()))?;

        let header_to = mail
            .headers
            .get("To")
            .map(|h| h.unfolded())
            .unwrap_or_default();
        let header_to = parse_address(header_to.split(',').next().unwrap_or(""));
        // A group such as `undisclosed-recipients:;` names nobody
        let header_to = match split_address(&header_to) {
            Some(_) => header_to,
            None => to.to_string(),
        };
        let header_from = mail
            .headers
            .get("From")
            .map(|h| parse_address(&h.value))
            .unwrap_or_default();

        let mut effective_from = None;

        if ctx.has(Capabilities::LEGACY_REPLY_DECODE) {
            for header in mail.headers.iter_mut() {
                if !(header.key.eq_ignore_ascii_case("In-Reply-To")
                    || header.key.eq_ignore_ascii_case("References"))
                {
                    continue;
                }
                if let Some((recipient, restored)) = decode_thread_header(&header.value) {
                    header.value = restored;
                    effective_from.get_or_insert(recipient);
                }
            }
        }

        if effective_from.is_none() && ctx.has(Capabilities::PSEUDONYMIZE) {
            let domain = split_address(&header_from)
                .or_else(|| split_address(from))
                .map(|(_, domain)| domain.to_string())
                .ok_or_else(|| {
                    RelayError::MessageInvalid("From address has no domain".to_string())
                })?;
            let (pseudonym, existed) = ctx
                .store
                .resolve(&header_to, &domain)
                .await
                .map_err(RelayError::transient)?;
            tracing::debug!(recipient = header_to, pseudonym, existed, "resolved pseudonym");
            effective_from = Some(pseudonym);
        }

        let sender = effective_from.unwrap_or_else(|| from.to_string());
        let display = format!("{} <{sender}>", config.from_name);
        mail.headers.replace_all("From", display.trim_start());

        mail.headers.prepend(
            "Received",
            conn.received_header(&config.server_name, &config.name, to, Local::now()),
        );

        let mut message = mail.to_bytes();
        if let Some(dkim) = &ctx.dkim {
            message = dkim.sign(&message).map_err(|err| {
                tracing::error!("{err:#}");
                RelayError::transient(err)
            })?;
        }

        let domain = match split_address(to) {
            Some((_, domain)) => domain,
            None => return Err(RelayError::RecipientUnresolvable(to.to_string())),
        };
        let mx = ctx.delivery.resolve(domain).await.map_err(|err| {
            tracing::info!(to, "{err:#}");
            RelayError::RecipientUnresolvable(to.to_string())
        })?;

        let host = ctx
            .delivery
            .deliver(&mx, &sender, to, &message)
            .await
            .map_err(|err: UpstreamError| {
                tracing::error!(from = sender, to, "delivery failed: {err:#}");
                RelayError::transient(err)
            })?;

        tracing::info!(
            helo = conn.helo(),
            remote = %conn.remote,
            from,
            sender,
            to,
            host,
            "delivered outbound message"
        );
        Ok(())
    }
}
