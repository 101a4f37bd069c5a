use crate::config::DkimConfig;
use anyhow::Context;
use mail_auth::common::crypto::{RsaKey, Sha256};
use mail_auth::common::headers::HeaderWriter;
use mail_auth::dkim::DkimSigner as MailAuthSigner;

const SIGNED_HEADERS: &[&str] = &[
    "From",
    "To",
    "Cc",
    "Subject",
    "Date",
    "Message-ID",
    "In-Reply-To",
    "References",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
];

/// Signs outgoing mail with an RSA-SHA256 DKIM signature.
#[derive(Clone)]
pub struct DkimSigner {
    domain: String,
    selector: String,
    key_pem: String,
}

impl DkimSigner {
    /// Loads and validates the key; a bad key fails startup
    /// rather than the first delivery.
    pub fn load(config: &DkimConfig) -> anyhow::Result<Self> {
        let key_pem = std::fs::read_to_string(&config.private_key).with_context(|| {
            format!(
                "reading DKIM private key {}",
                config.private_key.display()
            )
        })?;
        Self::from_pem(&config.domain, &config.selector, key_pem)
    }

    pub fn from_pem(domain: &str, selector: &str, key_pem: String) -> anyhow::Result<Self> {
        RsaKey::<Sha256>::from_rsa_pem(&key_pem)
            .map_err(|err| anyhow::anyhow!("invalid DKIM private key: {err}"))?;
        Ok(Self {
            domain: domain.to_string(),
            selector: selector.to_string(),
            key_pem,
        })
    }

    /// Returns `message` with a `DKIM-Signature` header prepended
    pub fn sign(&self, message: &[u8]) -> anyhow::Result<Vec<u8>> {
        let key = RsaKey::<Sha256>::from_rsa_pem(&self.key_pem)
            .map_err(|err| anyhow::anyhow!("invalid DKIM private key: {err}"))?;
        let signature = MailAuthSigner::from_key(key)
            .domain(&self.domain)
            .selector(&self.selector)
            .headers(SIGNED_HEADERS.iter().copied())
            .sign(message)
            .map_err(|err| anyhow::anyhow!("DKIM signing failed: {err}"))?;

        let header = signature.to_header();
        let mut signed = Vec::with_capacity(header.len() + message.len());
        signed.extend_from_slice(header.as_bytes());
        signed.extend_from_slice(message);
        Ok(signed)
    }
}
