use anyhow::Context;
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Builds the listener's TLS configuration. Without a configured
/// key a self-signed certificate for `hostname` is generated.
pub fn make_server_config(
    hostname: &str,
    tls_private_key: &Option<PathBuf>,
    tls_certificate: &Option<PathBuf>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let mut certificates = vec![];
    let private_key = match tls_private_key {
        Some(key) => load_private_key(key)?,
        None => {
            let key = rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
            certificates.push(key.cert.der().clone());
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()))
        }
    };

    if let Some(cert_file) = tls_certificate {
        certificates = load_certs(cert_file)?;
    }

    let config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;

    Ok(Arc::new(config))
}

fn load_certs(filename: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certfile = std::fs::File::open(filename)
        .with_context(|| format!("cannot open certificate file {}", filename.display()))?;

    let mut reader = std::io::BufReader::new(certfile);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| {
            format!(
                "reading PEM encoded certificates from {}",
                filename.display()
            )
        })?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", filename.display());
    }
    Ok(certs)
}

fn load_private_key(filename: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let keyfile = std::fs::File::open(filename)
        .with_context(|| format!("cannot open private key file {}", filename.display()))?;
    let mut reader = std::io::BufReader::new(keyfile);

    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("cannot parse private key file {}", filename.display()))?
        .ok_or_else(|| {
            anyhow::anyhow!(
                "no keys found in {} (encrypted keys not supported)",
                filename.display()
            )
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn self_signed() {
        let config = make_server_config("mx.example.jp", &None, &None).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn from_files() {
        let dir = tempfile::tempdir().unwrap();
        let generated = rcgen::generate_simple_self_signed(vec!["mx.example.jp".to_string()]).unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, generated.cert.pem()).unwrap();
        std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();

        make_server_config("ignored", &Some(key.clone()), &Some(cert)).unwrap();

        let err = make_server_config("ignored", &Some(key), &Some(dir.path().join("missing.pem")))
            .unwrap_err();
        assert_equal!(
            err.to_string(),
            format!(
                "cannot open certificate file {}",
                dir.path().join("missing.pem").display()
            )
        );
    }

    #[test]
    fn key_file_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("empty.pem");
        std::fs::write(&key, "").unwrap();
        let err = make_server_config("mx.example.jp", &Some(key), &None).unwrap_err();
        assert!(err.to_string().starts_with("no keys found in"), "{err}");
    }
}
