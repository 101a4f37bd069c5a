use crate::config::AllocationSetting;
use crate::error::RelayError;
use crate::message::split_address;
use std::collections::{HashMap, HashSet};

/// Decides which sender/recipient pairs may use the relay.
///
/// All lookups are case-insensitive; keys are lowercased once
/// at construction.
#[derive(Debug, Clone, Default)]
pub struct AllocationGuard {
    to_addresses: HashMap<String, bool>,
    to_domains: HashMap<String, bool>,
    blacklist_hosts: HashSet<String>,
}

impl AllocationGuard {
    pub fn new(setting: &AllocationSetting) -> Self {
        let lower_map = |map: &HashMap<String, bool>| {
            map.iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), *v))
                .collect()
        };
        Self {
            to_addresses: lower_map(&setting.to_addresses),
            to_domains: lower_map(&setting.to_domains),
            blacklist_hosts: setting
                .blacklist_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    /// An explicit per-address entry wins over the domain entry;
    /// an address covered by neither is not allowed.
    pub fn allowed_to(&self, to: &str) -> bool {
        let Some((_, domain)) = split_address(to) else {
            return false;
        };
        if let Some(allowed) = self.to_addresses.get(&to.to_ascii_lowercase()) {
            return *allowed;
        }
        self.to_domains
            .get(&domain.to_ascii_lowercase())
            .copied()
            .unwrap_or(false)
    }

    pub fn allowed_from(&self, from: &str) -> bool {
        match split_address(from) {
            Some((_, domain)) => !self.blacklist_hosts.contains(&domain.to_ascii_lowercase()),
            None => false,
        }
    }

    /// The rejection always names `to`, whichever check failed.
    pub fn allocate(&self, from: &str, to: &str) -> Result<(), RelayError> {
        if !self.allowed_to(to) {
            tracing::info!(from, to, check = "recipient", "allocation denied");
            return Err(RelayError::PolicyDenied(to.to_string()));
        }
        if !self.allowed_from(from) {
            tracing::info!(from, to, check = "sender", "allocation denied");
            return Err(RelayError::PolicyDenied(to.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;
    use maplit::{hashmap, hashset};

    fn guard() -> AllocationGuard {
        AllocationGuard::new(&AllocationSetting {
            to_addresses: hashmap! {
                "Sales@Example.jp".to_string() => true,
                "closed@example.jp".to_string() => false,
                "vip@other.example".to_string() => true,
            },
            to_domains: hashmap! {
                "example.jp".to_string() => true,
                "other.example".to_string() => false,
            },
            blacklist_hosts: hashset! {"Spam.Example".to_string()},
        })
    }

    #[test]
    fn address_entry_beats_domain() {
        let guard = guard();
        assert!(!guard.allowed_to("closed@example.jp"));
        assert!(guard.allowed_to("vip@other.example"));
        assert!(guard.allowed_to("sales@example.jp"));
        assert!(guard.allowed_to("anyone@EXAMPLE.jp"));
        assert!(!guard.allowed_to("anyone@other.example"));
    }

    #[test]
    fn unknown_and_malformed_recipients() {
        let guard = guard();
        assert!(!guard.allowed_to("someone@elsewhere.example"));
        assert!(!guard.allowed_to("no-domain"));
        assert!(!guard.allowed_to("trailing@"));
    }

    #[test]
    fn blacklisted_sender_domain() {
        let guard = guard();
        assert!(!guard.allowed_from("bot@spam.example"));
        assert!(!guard.allowed_from("bot@SPAM.EXAMPLE"));
        assert!(guard.allowed_from("person@ham.example"));
        assert!(!guard.allowed_from("nodomain"));
    }

    #[test]
    fn denial_names_recipient() {
        let guard = guard();
        let err = guard
            .allocate("bot@spam.example", "sales@example.jp")
            .unwrap_err();
        assert_equal!(
            err.to_string(),
            "<sales@example.jp>... User unknown, not local address."
        );
        let err = guard
            .allocate("person@ham.example", "nobody@elsewhere.example")
            .unwrap_err();
        assert_equal!(
            err.to_string(),
            "<nobody@elsewhere.example>... User unknown, not local address."
        );
        assert!(guard
            .allocate("person@ham.example", "sales@example.jp")
            .is_ok());
    }
}
