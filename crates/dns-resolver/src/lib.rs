use std::collections::BTreeMap;

mod resolver;

pub use resolver::{HickoryResolver, MxRecord, Resolver, TestResolver};

/// The ordered set of hosts responsible for receiving mail for a domain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailExchanger {
    pub domain_name: String,
    /// Hosts in the order in which delivery should be attempted
    pub hosts: Vec<String>,
    pub by_pref: BTreeMap<u16, Vec<String>>,
    /// True when the domain had no MX records and its own address
    /// records are being used instead (RFC 5321 section 5.1)
    pub is_implicit: bool,
}

impl MailExchanger {
    pub async fn resolve(resolver: &dyn Resolver, domain_name: &str) -> anyhow::Result<Self> {
        let domain_name = resolver::normalize_name(domain_name);
        if domain_name.is_empty() {
            anyhow::bail!("cannot resolve MX for an empty domain");
        }

        let records = resolver.resolve_mx(&domain_name).await?;

        if records.is_empty() {
            let addresses = resolver.resolve_ip(&domain_name).await?;
            if addresses.is_empty() {
                anyhow::bail!("{domain_name} has neither MX nor address records");
            }
            let hosts = vec![domain_name.clone()];
            return Ok(Self {
                by_pref: BTreeMap::from([(0, hosts.clone())]),
                hosts,
                domain_name,
                is_implicit: true,
            });
        }

        let mut by_pref: BTreeMap<u16, Vec<String>> = BTreeMap::new();
        for record in records {
            // '.' is a null mx; the domain accepts no mail there
            if record.host == "." {
                continue;
            }
            by_pref
                .entry(record.preference)
                .or_default()
                .push(record.host);
        }

        if by_pref.is_empty() {
            anyhow::bail!("{domain_name} publishes a null MX and does not accept mail");
        }

        // Sort the hosts at each preference level to produce the
        // overall ordered list of hosts for this site
        let mut hosts = vec![];
        for pref_hosts in by_pref.values_mut() {
            pref_hosts.sort();
            pref_hosts.dedup();
            hosts.extend(pref_hosts.iter().cloned());
        }

        tracing::trace!("MX for {domain_name}: {hosts:?}");

        Ok(Self {
            domain_name,
            hosts,
            by_pref,
            is_implicit: false,
        })
    }
}
