//! TLS acceptor construction. The server generates a self-signed
//! certificate at startup, so tests need no certificate files; test
//! clients are expected to use a permissive verifier.
use anyhow::Context;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

pub fn make_self_signed_acceptor(hostnames: &[String]) -> anyhow::Result<TlsAcceptor> {
    // Several servers may race to install the process-wide provider;
    // losing that race is fine.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    for name in hostnames {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    let cert = generate_simple_self_signed(names).context("generate self-signed certificate")?;

    let cert_der = cert.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .context("build server TLS config")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
