//! TLS identity and pinned-peer client configuration.
//!
//! Every node carries a single identity (`server.crt` / `server.key` in
//! the data directory) and presents it both as a server and as a client.
//! When dialing a known peer, the peer's certificate is pinned: the
//! verifier accepts exactly that certificate and nothing else, with a
//! minimum protocol version of TLS 1.2.
//!
//! Listener-side TLS termination (and capture of the client certificate)
//! is done by the fronting HTTPS layer; it hands the peer certificate to
//! handlers through the [`PeerCertificate`] request extension.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::errors::ClusterError;

/// The TLS client certificate of an inbound connection, in DER form,
/// inserted by the TLS terminator in front of the HTTP router.
#[derive(Debug, Clone)]
pub struct PeerCertificate(pub Vec<u8>);

impl PeerCertificate {
    /// Re-encode the captured certificate as PEM.
    pub fn to_pem(&self) -> String {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;

        let b64 = STANDARD.encode(&self.0);
        let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
        for chunk in b64.as_bytes().chunks(64) {
            pem.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        pem
    }
}

/// The local node's TLS identity.
#[derive(Clone)]
pub struct TlsIdentity {
    /// PEM text of the certificate, as stored on disk and as exchanged
    /// in membership requests.
    pub cert_pem: String,
    /// PEM text of the private key.
    pub key_pem: String,
}

impl TlsIdentity {
    /// Load `server.crt` and `server.key` from the data directory.
    pub fn load(var_dir: &Path) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read_to_string(var_dir.join("server.crt"))?;
        let key_pem = std::fs::read_to_string(var_dir.join("server.key"))?;
        Ok(Self { cert_pem, key_pem })
    }

    fn cert_chain(&self) -> Result<Vec<CertificateDer<'static>>, ClusterError> {
        parse_cert_chain(&self.cert_pem)
    }

    fn private_key(&self) -> Result<PrivateKeyDer<'static>, ClusterError> {
        rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .map_err(|e| ClusterError::InvalidCertificate(e.to_string()))?
            .ok_or_else(|| ClusterError::InvalidCertificate("no private key in PEM".into()))
    }
}

/// Parse a PEM certificate chain, failing with `InvalidCertificate` when
/// the PEM is malformed or contains no certificate.
pub fn parse_cert_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>, ClusterError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClusterError::InvalidCertificate(e.to_string()))?;
    if certs.is_empty() {
        return Err(ClusterError::InvalidCertificate(
            "no certificate found in PEM".into(),
        ));
    }
    Ok(certs)
}

/// Build a rustls client config that presents the local identity and
/// accepts exactly `pinned_pem` as the remote server certificate.
pub fn pinned_client_config(
    identity: &TlsIdentity,
    pinned_pem: &str,
) -> Result<ClientConfig, ClusterError> {
    let pinned = parse_cert_chain(pinned_pem)?
        .into_iter()
        .next()
        .expect("parse_cert_chain rejects empty chains");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(PinnedServerVerifier {
        pinned,
        provider: provider.clone(),
    });

    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ClusterError::InvalidCertificate(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(identity.cert_chain()?, identity.private_key()?)
        .map_err(|e| ClusterError::InvalidCertificate(e.to_string()))?;

    Ok(config)
}

/// Certificate verifier that accepts a single pinned certificate.
///
/// Cluster members are self-signed; trust is by exact certificate match,
/// not by chain validation.  Handshake signatures are still verified so
/// the remote must hold the pinned certificate's private key.
#[derive(Debug)]
struct PinnedServerVerifier {
    pinned: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cert_chain_rejects_garbage() {
        assert!(matches!(
            parse_cert_chain("not a certificate"),
            Err(ClusterError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_parse_cert_chain_rejects_empty() {
        assert!(matches!(
            parse_cert_chain(""),
            Err(ClusterError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_peer_certificate_pem_framing() {
        let pem = PeerCertificate(vec![0u8; 100]).to_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        // 100 bytes -> 136 base64 chars -> lines of at most 64.
        for line in pem.lines().skip(1) {
            if line.starts_with("-----") {
                break;
            }
            assert!(line.len() <= 64);
        }
    }
}
