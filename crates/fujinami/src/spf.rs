use async_trait::async_trait;
use mail_auth::SpfResult;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfDisposition {
    /// No SPF record was found, or there was no usable identity
    None,
    /// The domain explicitly makes no assertion about the client
    Neutral,
    Pass,
    Fail,
    /// The client is probably not authorized
    SoftFail,
    /// A transient, usually DNS, error prevented evaluation
    TempError,
    /// The published record could not be interpreted
    PermError,
}

impl SpfDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Neutral => "neutral",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::SoftFail => "softfail",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
        }
    }
}

impl fmt::Display for SpfDisposition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SpfResult> for SpfDisposition {
    fn from(result: SpfResult) -> Self {
        match result {
            SpfResult::Pass => Self::Pass,
            SpfResult::Fail => Self::Fail,
            SpfResult::SoftFail => Self::SoftFail,
            SpfResult::Neutral => Self::Neutral,
            SpfResult::TempError => Self::TempError,
            SpfResult::PermError => Self::PermError,
            SpfResult::None => Self::None,
        }
    }
}

/// The outcome of checking one MAIL FROM identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfVerdict {
    pub disposition: SpfDisposition,
    pub sender: String,
    pub client_ip: IpAddr,
}

impl SpfVerdict {
    /// Value for an `Authentication-Results` header
    pub fn header_value(&self, server_name: &str) -> String {
        format!(
            "{server_name}; spf={} smtp.mailfrom={}",
            self.disposition, self.sender
        )
    }
}

#[async_trait]
pub trait SpfEvaluator: Send + Sync + 'static {
    async fn check_host(&self, client_ip: IpAddr, helo: &str, sender: &str) -> SpfDisposition;

    async fn evaluate(&self, client_ip: IpAddr, helo: &str, sender: &str) -> SpfVerdict {
        let disposition = self.check_host(client_ip, helo, sender).await;
        tracing::debug!(%client_ip, helo, sender, %disposition, "spf evaluated");
        SpfVerdict {
            disposition,
            sender: sender.to_string(),
            client_ip,
        }
    }
}

pub struct MailAuthSpf {
    resolver: mail_auth::Resolver,
    /// Our host name, reported to macros that expand `%{r}`
    host_domain: String,
}

impl MailAuthSpf {
    pub fn from_system_conf(host_domain: &str) -> anyhow::Result<Self> {
        let resolver = mail_auth::Resolver::new_system_conf()
            .map_err(|err| anyhow::anyhow!("initializing SPF resolver: {err}"))?;
        Ok(Self {
            resolver,
            host_domain: host_domain.to_string(),
        })
    }
}

#[async_trait]
impl SpfEvaluator for MailAuthSpf {
    async fn check_host(&self, client_ip: IpAddr, helo: &str, sender: &str) -> SpfDisposition {
        let output = self
            .resolver
            .verify_spf_sender(client_ip, helo, &self.host_domain, sender)
            .await;
        output.result().into()
    }
}

/// Always answers with the same disposition
pub struct FixedSpf(pub SpfDisposition);

#[async_trait]
impl SpfEvaluator for FixedSpf {
    async fn check_host(&self, _client_ip: IpAddr, _helo: &str, _sender: &str) -> SpfDisposition {
        self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[tokio::test]
    async fn header() {
        let verdict = FixedSpf(SpfDisposition::SoftFail)
            .evaluate("192.0.2.1".parse().unwrap(), "client.example", "alice@example.org")
            .await;
        assert_equal!(
            verdict.header_value("mx.example.jp"),
            "mx.example.jp; spf=softfail smtp.mailfrom=alice@example.org"
        );
    }

    #[test]
    fn from_mail_auth() {
        assert_equal!(SpfDisposition::from(SpfResult::TempError), SpfDisposition::TempError);
        assert_equal!(SpfDisposition::from(SpfResult::None).to_string(), "none");
    }
}
