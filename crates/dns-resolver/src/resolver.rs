use async_trait::async_trait;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    /// Exchange host name, lowercased, without the trailing dot.
    /// A null MX is represented as "."
    pub host: String,
}

/// The DNS operations needed to route and screen mail.
///
/// A name that exists but has no records of the requested type,
/// and a name that does not exist at all, both produce an empty
/// answer rather than an error. Errors are reserved for failures
/// to obtain an answer.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve_ip(&self, name: &str) -> anyhow::Result<Vec<IpAddr>>;
    async fn resolve_mx(&self, name: &str) -> anyhow::Result<Vec<MxRecord>>;
}

pub(crate) fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn is_no_records(err: &ResolveError) -> bool {
    matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn from_system_conf() -> anyhow::Result<Self> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self { inner })
    }

    pub fn new(inner: TokioAsyncResolver) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve_ip(&self, name: &str) -> anyhow::Result<Vec<IpAddr>> {
        // Fully qualified so that search domains never apply
        let fqdn = format!("{}.", normalize_name(name));
        match self.inner.lookup_ip(fqdn.as_str()).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(err) if is_no_records(&err) => Ok(vec![]),
            Err(err) => Err(anyhow::anyhow!("address lookup for {name} failed: {err:#}")),
        }
    }

    async fn resolve_mx(&self, name: &str) -> anyhow::Result<Vec<MxRecord>> {
        let fqdn = format!("{}.", normalize_name(name));
        match self.inner.mx_lookup(fqdn.as_str()).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|mx| {
                    let host = mx.exchange().to_lowercase().to_string();
                    let host = match host.trim_end_matches('.') {
                        "" => ".".to_string(),
                        trimmed => trimmed.to_string(),
                    };
                    MxRecord {
                        preference: mx.preference(),
                        host,
                    }
                })
                .collect()),
            Err(err) if is_no_records(&err) => Ok(vec![]),
            Err(err) => Err(anyhow::anyhow!("MX lookup for {name} failed: {err:#}")),
        }
    }
}

/// An in-memory resolver for tests and for pinning answers
/// without consulting the network.
#[derive(Default)]
pub struct TestResolver {
    ip: HashMap<String, Vec<IpAddr>>,
    mx: HashMap<String, Vec<MxRecord>>,
    delays: HashMap<String, Duration>,
    failures: HashMap<String, String>,
    queries: Mutex<Vec<String>>,
}

impl TestResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, name: &str, addr: IpAddr) -> Self {
        self.ip.entry(normalize_name(name)).or_default().push(addr);
        self
    }

    pub fn with_mx(mut self, name: &str, preference: u16, host: &str) -> Self {
        self.mx
            .entry(normalize_name(name))
            .or_default()
            .push(MxRecord {
                preference,
                host: match normalize_name(host).as_str() {
                    "" => ".".to_string(),
                    name => name.to_string(),
                },
            });
        self
    }

    /// Answers for `name` are held back for `delay`
    pub fn with_delay(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(normalize_name(name), delay);
        self
    }

    /// Lookups of `name` fail as if the server were unreachable
    pub fn with_failure(mut self, name: &str, reason: &str) -> Self {
        self.failures
            .insert(normalize_name(name), reason.to_string());
        self
    }

    /// The names that were looked up, in the order the lookups started
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    async fn prepare(&self, name: &str) -> anyhow::Result<String> {
        let name = normalize_name(name);
        self.queries.lock().push(name.clone());
        if let Some(delay) = self.delays.get(&name) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(reason) = self.failures.get(&name) {
            anyhow::bail!("lookup of {name} failed: {reason}");
        }
        Ok(name)
    }
}

#[async_trait]
impl Resolver for TestResolver {
    async fn resolve_ip(&self, name: &str) -> anyhow::Result<Vec<IpAddr>> {
        let name = self.prepare(name).await?;
        Ok(self.ip.get(&name).cloned().unwrap_or_default())
    }

    async fn resolve_mx(&self, name: &str) -> anyhow::Result<Vec<MxRecord>> {
        let name = self.prepare(name).await?;
        Ok(self.mx.get(&name).cloned().unwrap_or_default())
    }
}
