use std::path::Path;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("io error writing certificate: {0}")]
    Io(#[from] std::io::Error),
}

/// Ensure `<cert_dir>/default.crt` and `<cert_dir>/default.key` exist,
/// generating a self-signed certificate for `localhost` if not. This is
/// the one piece of certificate lifecycle carried in scope; full ACME
/// automation is not attempted.
pub async fn ensure_default_certificate(cert_dir: &Path) -> Result<(), CertError> {
    let crt_path = cert_dir.join("default.crt");
    let key_path = cert_dir.join("default.key");

    if tokio::fs::try_exists(&crt_path).await.unwrap_or(false)
        && tokio::fs::try_exists(&key_path).await.unwrap_or(false)
    {
        return Ok(());
    }

    tokio::fs::create_dir_all(cert_dir).await?;

    let (cert_pem, key_pem) = generate_self_signed("localhost")?;
    tokio::fs::write(&crt_path, cert_pem).await?;
    tokio::fs::write(&key_path, key_pem).await?;

    info!(dir = %cert_dir.display(), "generated default self-signed certificate");
    Ok(())
}

fn generate_self_signed(dns_name: &str) -> Result<(String, String), rcgen::Error> {
    let mut params = CertificateParams::new(vec![dns_name.to_string()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, dns_name);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::DnsName(dns_name.try_into()?)];

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_certificate_pair_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        ensure_default_certificate(dir.path()).await.unwrap();

        assert!(dir.path().join("default.crt").exists());
        assert!(dir.path().join("default.key").exists());
    }

    #[tokio::test]
    async fn is_idempotent_when_already_present() {
        let dir = tempfile::tempdir().unwrap();
        ensure_default_certificate(dir.path()).await.unwrap();
        let first = tokio::fs::read(dir.path().join("default.crt")).await.unwrap();

        ensure_default_certificate(dir.path()).await.unwrap();
        let second = tokio::fs::read(dir.path().join("default.crt")).await.unwrap();

        assert_eq!(first, second);
    }
}
