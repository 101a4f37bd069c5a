use crate::config::BlacklistConfig;
use dns_resolver::Resolver;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlacklistVerdict {
    pub listed: bool,
    pub positive_count: usize,
}

/// Screens a client address against a set of DNS blocklist zones.
///
/// All zones are queried concurrently. Screening stops as soon as
/// more than `threshold` zones have listed the address, or when
/// `timeout` elapses, whichever comes first.
#[derive(Clone)]
pub struct BlacklistScreener {
    resolver: Arc<dyn Resolver>,
    zones: Arc<Vec<String>>,
    threshold: usize,
    timeout: Duration,
}

/// The query name for `ip` in `zone`: reversed octets for IPv4,
/// reversed nibbles for IPv6.
pub fn query_name(ip: IpAddr, zone: &str) -> String {
    let zone = zone.trim_end_matches('.');
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{d}.{c}.{b}.{a}.{zone}")
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(64 + zone.len());
            for byte in v6.octets().iter().rev() {
                name.push_str(&format!("{:x}.{:x}.", byte & 0xf, byte >> 4));
            }
            name.push_str(zone);
            name
        }
    }
}

/// Listings are answers in 127.0.0.0/8. 127.255.255.0/24 is used by
/// some zones to report query errors such as refused resolvers, and
/// does not count.
fn is_listing(answer: &IpAddr) -> bool {
    match answer {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            a == 127 && !(b == 255 && c == 255)
        }
        IpAddr::V6(_) => false,
    }
}

impl BlacklistScreener {
    pub fn new(resolver: Arc<dyn Resolver>, config: &BlacklistConfig) -> Self {
        Self {
            resolver,
            zones: Arc::new(config.zones.clone()),
            threshold: config.threshold,
            timeout: config.timeout,
        }
    }

    pub async fn screen(&self, ip: IpAddr) -> BlacklistVerdict {
        let deadline = Instant::now() + self.timeout;
        let mut lookups = JoinSet::new();

        for zone in self.zones.iter() {
            let resolver = self.resolver.clone();
            let name = query_name(ip, zone);
            let zone = zone.clone();
            lookups.spawn(async move {
                match resolver.resolve_ip(&name).await {
                    Ok(answers) => answers.iter().any(is_listing),
                    Err(err) => {
                        tracing::trace!("{zone}: {err:#}");
                        false
                    }
                }
            });
        }

        let mut positive_count = 0;
        loop {
            match tokio::time::timeout_at(deadline, lookups.join_next()).await {
                Ok(Some(Ok(true))) => {
                    positive_count += 1;
                    if positive_count > self.threshold {
                        lookups.abort_all();
                        tracing::debug!(%ip, positive_count, "blacklisted");
                        return BlacklistVerdict {
                            listed: true,
                            positive_count,
                        };
                    }
                }
                Ok(Some(Ok(false))) => {}
                Ok(Some(Err(err))) => {
                    tracing::error!("blacklist lookup task failed: {err:#}");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(
                        %ip,
                        positive_count,
                        pending = lookups.len(),
                        "blacklist screening deadline reached"
                    );
                    lookups.abort_all();
                    break;
                }
            }
        }

        BlacklistVerdict {
            listed: false,
            positive_count,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dns_resolver::TestResolver;
    use k9::assert_equal;

    const CLIENT: &str = "192.0.2.99";

    fn zones(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("zone{i}.example")).collect()
    }

    fn screener(resolver: TestResolver, zones: Vec<String>) -> BlacklistScreener {
        BlacklistScreener::new(
            Arc::new(resolver),
            &BlacklistConfig {
                zones,
                threshold: 6,
                timeout: Duration::from_secs(2),
            },
        )
    }

    fn listed_by(mut resolver: TestResolver, zones: &[String]) -> TestResolver {
        let ip: IpAddr = CLIENT.parse().unwrap();
        for zone in zones {
            resolver = resolver.with_ip(&query_name(ip, zone), "127.0.0.2".parse().unwrap());
        }
        resolver
    }

    #[test]
    fn query_names() {
        assert_equal!(
            query_name("192.0.2.99".parse().unwrap(), "zen.spamhaus.org"),
            "99.2.0.192.zen.spamhaus.org"
        );
        assert_equal!(
            query_name("2001:db8::1".parse().unwrap(), "bl.example."),
            "1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.bl.example"
        );
    }

    #[test]
    fn listing_answers() {
        assert!(is_listing(&"127.0.0.2".parse().unwrap()));
        assert!(is_listing(&"127.0.1.10".parse().unwrap()));
        assert!(!is_listing(&"127.255.255.254".parse().unwrap()));
        assert!(!is_listing(&"10.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn seven_of_seventy_is_listed() {
        let zones = zones(70);
        let resolver = listed_by(TestResolver::new(), &zones[..7]);
        let verdict = screener(resolver, zones).screen(CLIENT.parse().unwrap()).await;
        assert!(verdict.listed);
        assert!(verdict.positive_count >= 7);
    }

    #[tokio::test]
    async fn six_of_seventy_is_not_listed() {
        let zones = zones(70);
        let resolver = listed_by(TestResolver::new(), &zones[..6]);
        let verdict = screener(resolver, zones).screen(CLIENT.parse().unwrap()).await;
        assert_equal!(
            verdict,
            BlacklistVerdict {
                listed: false,
                positive_count: 6
            }
        );
    }

    #[tokio::test]
    async fn failures_count_as_unlisted() {
        let zones = zones(3);
        let ip: IpAddr = CLIENT.parse().unwrap();
        let resolver = listed_by(TestResolver::new(), &zones[..1])
            .with_failure(&query_name(ip, &zones[1]), "SERVFAIL")
            .with_ip(&query_name(ip, &zones[2]), "127.255.255.254".parse().unwrap());
        let verdict = screener(resolver, zones).screen(ip).await;
        assert_equal!(verdict.positive_count, 1);
        assert!(!verdict.listed);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_yields_partial_count() {
        let zones = zones(10);
        let ip: IpAddr = CLIENT.parse().unwrap();
        let mut resolver = listed_by(TestResolver::new(), &zones);
        for zone in &zones[3..] {
            resolver = resolver.with_delay(&query_name(ip, zone), Duration::from_secs(30));
        }
        let verdict = screener(resolver, zones).screen(ip).await;
        assert_equal!(
            verdict,
            BlacklistVerdict {
                listed: false,
                positive_count: 3
            }
        );
    }
}
