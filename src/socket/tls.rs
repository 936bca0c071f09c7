use crate::base::neterror::NetError;
use boring::ssl::{SslConnector, SslConnectorBuilder, SslMethod, SslRef, SslVerifyMode, SslVersion};
use boring::x509::X509VerifyResult;
use std::path::PathBuf;

/// Certificate verification collaborator.
///
/// Consulted after the TLS handshake with the DER-encoded peer chain (leaf
/// first). Revocation checking, if any, belongs in here. Any error is treated
/// as a security failure for that connection attempt.
pub trait CertVerifier: Send + Sync + 'static {
    fn verify(&self, chain: &[Vec<u8>], host: &str) -> Result<(), NetError>;
}

/// TLS client configuration for TCP-based connections.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub min_version: Option<SslVersion>,
    pub max_version: Option<SslVersion>,
    pub cipher_list: String,
    /// ALPN identifiers offered, in preference order.
    pub alpn_protos: Vec<String>,
    pub curves: Vec<String>,
    pub sigalgs: String,
    /// Verify the peer chain and host name. Disable only in test environments.
    pub verify_peer: bool,
    /// Extra PEM trust anchors.
    pub ca_file: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            min_version: Some(SslVersion::TLS1_2),
            max_version: Some(SslVersion::TLS1_3),
            cipher_list: "TLS_AES_128_GCM_SHA256:TLS_AES_256_GCM_SHA384:TLS_CHACHA20_POLY1305_SHA256:\
                ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
                ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:\
                ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305"
                .to_string(),
            alpn_protos: vec!["h2".to_string(), "http/1.1".to_string()],
            curves: vec!["X25519".to_string(), "P-256".to_string(), "P-384".to_string()],
            sigalgs: "ECDSA+SHA256:RSA-PSS+SHA256:RSA+SHA256:\
                ECDSA+SHA384:RSA-PSS+SHA384:RSA+SHA384:\
                RSA-PSS+SHA512:RSA+SHA512"
                .to_string(),
            verify_peer: true,
            ca_file: None,
        }
    }
}

impl TlsConfig {
    /// Offer only HTTP/1.1 in ALPN.
    pub fn http1_only(mut self) -> Self {
        self.alpn_protos = vec!["http/1.1".to_string()];
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// ALPN protocol list in wire format (length-prefixed).
    pub fn alpn_wire(&self) -> Result<Vec<u8>, NetError> {
        let mut wire = Vec::new();
        for proto in &self.alpn_protos {
            let len = u8::try_from(proto.len()).map_err(|_| NetError::SslProtocolError)?;
            wire.push(len);
            wire.extend_from_slice(proto.as_bytes());
        }
        Ok(wire)
    }

    /// Apply this configuration to an SSL connector builder.
    pub fn apply_to_builder(&self, builder: &mut SslConnectorBuilder) -> Result<(), NetError> {
        if let Some(min) = self.min_version {
            builder.set_min_proto_version(Some(min)).map_err(|_| NetError::SslProtocolError)?;
        }
        if let Some(max) = self.max_version {
            builder.set_max_proto_version(Some(max)).map_err(|_| NetError::SslProtocolError)?;
        }
        builder.set_cipher_list(&self.cipher_list).map_err(|_| NetError::SslProtocolError)?;

        if !self.alpn_protos.is_empty() {
            builder.set_alpn_protos(&self.alpn_wire()?).map_err(|_| NetError::SslProtocolError)?;
        }
        if !self.sigalgs.is_empty() {
            builder.set_sigalgs_list(&self.sigalgs).map_err(|_| NetError::SslProtocolError)?;
        }
        if !self.curves.is_empty() {
            builder
                .set_curves_list(&self.curves.join(":"))
                .map_err(|_| NetError::SslProtocolError)?;
        }
        if let Some(ca) = &self.ca_file {
            builder.set_ca_file(ca).map_err(|_| NetError::CertAuthorityInvalid)?;
        }

        builder.set_verify(if self.verify_peer { SslVerifyMode::PEER } else { SslVerifyMode::NONE });
        Ok(())
    }

    pub fn build_connector(&self) -> Result<SslConnector, NetError> {
        let mut builder =
            SslConnector::builder(SslMethod::tls()).map_err(|_| NetError::SslProtocolError)?;
        self.apply_to_builder(&mut builder)?;
        Ok(builder.build())
    }

    /// Per RFC 6066, SNI MUST NOT be set for raw IP addresses.
    pub fn should_set_sni(host: &str) -> bool {
        host.parse::<std::net::IpAddr>().is_err()
    }
}

// X509_V_ERR_* codes from BoringSSL's x509.h.
const X509_V_ERR_CERT_NOT_YET_VALID: i32 = 9;
const X509_V_ERR_CERT_HAS_EXPIRED: i32 = 10;
const X509_V_ERR_CERT_REVOKED: i32 = 23;
const X509_V_ERR_HOSTNAME_MISMATCH: i32 = 62;

/// Map an X509 verification result to a certificate error, if it failed.
pub fn cert_error(result: X509VerifyResult) -> Option<NetError> {
    cert_error_code(result.as_raw())
}

fn cert_error_code(raw: i32) -> Option<NetError> {
    Some(match raw {
        0 => return None,
        X509_V_ERR_CERT_NOT_YET_VALID | X509_V_ERR_CERT_HAS_EXPIRED => NetError::CertDateInvalid,
        X509_V_ERR_HOSTNAME_MISMATCH => NetError::CertCommonNameInvalid,
        X509_V_ERR_CERT_REVOKED => NetError::CertRevoked,
        _ => NetError::CertAuthorityInvalid,
    })
}

/// DER-encoded peer chain, leaf first.
pub fn peer_chain_der(ssl: &SslRef) -> Vec<Vec<u8>> {
    let mut chain = Vec::new();
    if let Some(leaf) = ssl.peer_certificate() {
        if let Ok(der) = leaf.to_der() {
            chain.push(der);
        }
    }
    if let Some(stack) = ssl.peer_cert_chain() {
        for cert in stack.iter().skip(1) {
            if let Ok(der) = cert.to_der() {
                chain.push(der);
            }
        }
    }
    chain
}
