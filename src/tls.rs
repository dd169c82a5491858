use anyhow::{Context, Result};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open cert {}", path.display()))?,
    );
    let mut out = Vec::new();
    for c in rustls_pemfile::certs(&mut rd) {
        out.push(c.context("read cert")?);
    }
    if out.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(out)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open key {}", path.display()))?,
    );
    let pkcs8: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut rd).collect();
    if let Some(k) = pkcs8.into_iter().next() {
        return Ok(PrivateKeyDer::from(k.context("pkcs8 key")?));
    }
    let mut rd2 = BufReader::new(fs::File::open(path).context("reopen key")?);
    let rsa: Vec<_> = rustls_pemfile::rsa_private_keys(&mut rd2).collect();
    let k = rsa.into_iter().next().context("rsa key not found")??;
    Ok(PrivateKeyDer::from(k))
}

fn load_root_store(ca_path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots.add(cert).context("add CA cert to root store")?;
    }
    Ok(roots)
}

/// Server-side TLS: present the chain + key, require and verify a client
/// certificate against the CA bundle. Connections without a peer
/// certificate fail the handshake.
pub fn build_server_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca_path: &Path,
) -> Result<rustls::ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let roots = load_root_store(client_ca_path)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("build client cert verifier")?;
    let cfg = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(cfg)
}

/// Client-side TLS: verify the server against the CA bundle and present
/// our own certificate for mutual authentication.
pub fn build_client_config(
    ca_path: &Path,
    cert_path: &Path,
    key_path: &Path,
) -> Result<rustls::ClientConfig> {
    let roots = load_root_store(ca_path)?;
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("build client tls config")?;
    Ok(cfg)
}

pub fn server_name_for(host: &str) -> ServerName<'static> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        ServerName::IpAddress(ip.into())
    } else {
        ServerName::try_from(host.to_string())
            .unwrap_or_else(|_| ServerName::try_from("localhost".to_string()).unwrap())
    }
}
