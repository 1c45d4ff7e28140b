//! # TLS Material for the QUIC Transport
//!
//! QUIC mandates TLS 1.3, so every node presents a certificate. The certificate
//! is self-signed and carries the node's own Ed25519 identity key:
//!
//! - **Self-Signed Certs**: generated from the node [`Keypair`], no CA involved
//! - **Mutual TLS**: both ends must present a certificate with a valid Ed25519 key
//! - **No name binding**: connections are dialed by address only, so the server
//!   certificate is not matched against an expected identity here. Peer
//!   authentication is the in-band handshake (`crate::handshake`); afterwards the
//!   node checks that the certificate key equals the handshake identity.
//!
//! Only Ed25519 signature schemes are offered or accepted. ALPN `pastry` keeps
//! unrelated QUIC applications from talking to the overlay by accident.

use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};

use crate::identity::{Identity, Keypair, IDENTITY_LEN, SEED_LEN};

static CRYPTO_PROVIDER: LazyLock<Arc<CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for overlay connections.
pub const ALPN: &[u8] = b"pastry";

/// Server name presented when dialing. Certificates are not bound to it.
pub const SERVER_NAME: &str = "pastry";

/// DER prefix of a PKCS#8 v1 `PrivateKeyInfo` wrapping a raw Ed25519 seed (RFC 8410).
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, // SEQUENCE, 46 bytes
    0x02, 0x01, 0x00, // INTEGER 0 (v1)
    0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, // AlgorithmIdentifier id-Ed25519
    0x04, 0x22, 0x04, 0x20, // OCTET STRING { OCTET STRING (32) }
];

fn ed25519_pkcs8(seed: &[u8; SEED_LEN]) -> Vec<u8> {
    let mut der = Vec::with_capacity(ED25519_PKCS8_PREFIX.len() + SEED_LEN);
    der.extend_from_slice(&ED25519_PKCS8_PREFIX);
    der.extend_from_slice(seed);
    der
}

/// Self-signed certificate whose subject key is the node's identity key.
pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let pkcs8 = PrivatePkcs8KeyDer::from(ed25519_pkcs8(&keypair.secret_key_bytes()));
    let signing_key = rcgen::KeyPair::try_from(&pkcs8)
        .context("failed to load identity key for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.identity().to_hex()),
    );
    let cert = params
        .self_signed(&signing_key)
        .context("failed to self-sign identity certificate")?;

    Ok((vec![cert.der().clone()], PrivateKeyDer::Pkcs8(pkcs8)))
}

pub fn create_server_config(
    keypair: &Keypair,
    transport: Arc<quinn::TransportConfig>,
) -> Result<quinn::ServerConfig> {
    let (certs, key) = generate_ed25519_cert(keypair)?;
    let mut tls = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3 for server")?
        .with_client_cert_verifier(Arc::new(Ed25519CertVerifier))
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let quic = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .context("failed to create QUIC server config")?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(quic));
    config.transport_config(transport);
    Ok(config)
}

pub fn create_client_config(
    keypair: &Keypair,
    transport: Arc<quinn::TransportConfig>,
) -> Result<quinn::ClientConfig> {
    let (certs, key) = generate_ed25519_cert(keypair)?;
    let mut tls = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3 for client")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(Ed25519CertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config")?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .context("failed to create QUIC client config")?;
    let mut config = quinn::ClientConfig::new(Arc::new(quic));
    config.transport_config(transport);
    Ok(config)
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; IDENTITY_LEN]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes: &[u8] = &cert.public_key().subject_public_key.data;
    key_bytes.try_into().ok()
}

/// Identity carried by the certificate the remote presented during the TLS handshake.
pub fn extract_verified_identity(connection: &quinn::Connection) -> Option<Identity> {
    let presented = connection.peer_identity()?;
    let chain: &Vec<CertificateDer> = presented.downcast_ref()?;
    let public_key = extract_public_key_from_cert(chain.first()?.as_ref())?;
    Some(Identity::from_bytes(public_key))
}

fn check_ed25519_cert(end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
    let public_key = extract_public_key_from_cert(end_entity.as_ref())
        .ok_or(rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
    if !Identity::from_bytes(public_key).is_valid() {
        return Err(rustls::Error::InvalidCertificate(
            CertificateError::ApplicationVerificationFailure,
        ));
    }
    Ok(())
}

/// Accepts any certificate carrying a valid Ed25519 key, in either TLS role.
#[derive(Debug)]
struct Ed25519CertVerifier;

impl Ed25519CertVerifier {
    fn tls12(
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &CRYPTO_PROVIDER.signature_verification_algorithms)
    }

    fn tls13(
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &CRYPTO_PROVIDER.signature_verification_algorithms)
    }
}

impl ClientCertVerifier for Ed25519CertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        check_ed25519_cert(end_entity).map(|()| ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Self::tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Self::tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

impl ServerCertVerifier for Ed25519CertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        check_ed25519_cert(end_entity).map(|()| ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Self::tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Self::tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn pkcs8_wrapping_is_48_bytes() {
        let der = ed25519_pkcs8(&[0x11; SEED_LEN]);
        assert_eq!(der.len(), 48);
        assert_eq!(der[1] as usize, der.len() - 2);
        assert_eq!(&der[16..], &[0x11; SEED_LEN]);
    }

    #[test]
    fn certificate_carries_identity_public_key() {
        for _ in 0..20 {
            let keypair = Keypair::generate();
            let (certs, _key) = generate_ed25519_cert(&keypair).expect("cert generation must succeed");

            let extracted = extract_public_key_from_cert(certs[0].as_ref())
                .expect("public key extraction must succeed");
            assert_eq!(extracted, *keypair.identity().as_bytes());
        }
    }

    #[test]
    fn distinct_keypairs_produce_distinct_certificate_keys() {
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let (certs, _) = generate_ed25519_cert(&Keypair::generate()).expect("cert generation must succeed");
            let key = extract_public_key_from_cert(certs[0].as_ref()).expect("pk extraction must succeed");
            assert!(seen.insert(key));
        }
    }

    #[test]
    fn garbage_is_not_a_certificate() {
        assert!(extract_public_key_from_cert(b"not a certificate").is_none());
        assert!(check_ed25519_cert(&CertificateDer::from(vec![0u8; 16])).is_err());
    }

    #[test]
    fn generated_certificate_passes_verifier_check() {
        let keypair = Keypair::generate();
        let (certs, _) = generate_ed25519_cert(&keypair).expect("cert generation must succeed");
        assert!(check_ed25519_cert(&certs[0]).is_ok());
    }

    #[test]
    fn tls_configs_build() {
        let keypair = Keypair::generate();
        let transport = Arc::new(quinn::TransportConfig::default());
        assert!(create_server_config(&keypair, transport.clone()).is_ok());
        assert!(create_client_config(&keypair, transport).is_ok());
    }
}
