//! Certificate generation on top of `rcgen`.

use super::PkiError;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use time::{Duration, OffsetDateTime};

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 825;
const ORGANIZATION: &str = "vpngate";

/// PEM encoded certificate and private key.
pub(crate) struct IssuedPair {
    pub cert_pem: String,
    pub key_pem: String,
    /// Lowercase hex SHA-256 of the certificate DER.
    pub fingerprint: String,
}

fn cert_err(context: &str) -> impl FnOnce(rcgen::RcgenError) -> PkiError + '_ {
    move |e| PkiError::Certificate(format!("{context}: {e}"))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(DnType::OrganizationName, DnValue::Utf8String(ORGANIZATION.to_string()));
    dn
}

fn validity(params: &mut CertificateParams, days: i64) {
    let now = OffsetDateTime::now_utc();
    // Backdate slightly so clients with skewed clocks accept fresh certs.
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(days);
}

pub(crate) fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn encode_cert(der: Vec<u8>) -> (String, String) {
    let fp = fingerprint(&der);
    let config = pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF);
    let pem = pem::encode_config(&pem::Pem::new("CERTIFICATE", der), config);
    (pem, fp)
}

/// Fingerprint of a PEM encoded certificate.
pub(crate) fn fingerprint_pem(cert_pem: &str) -> Result<String, PkiError> {
    let parsed = pem::parse(cert_pem)
        .map_err(|e| PkiError::Certificate(format!("unreadable certificate: {e}")))?;
    Ok(fingerprint(parsed.contents()))
}

/// Self-signed certificate authority.
pub(crate) fn new_ca(common_name: &str) -> Result<(Certificate, IssuedPair), PkiError> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    validity(&mut params, CA_VALIDITY_DAYS);

    let ca = Certificate::from_params(params).map_err(cert_err("failed to create CA"))?;
    let der = ca.serialize_der().map_err(cert_err("failed to sign CA"))?;
    let (cert_pem, fingerprint) = encode_cert(der);
    let key_pem = ca.serialize_private_key_pem();
    Ok((
        ca,
        IssuedPair {
            cert_pem,
            key_pem,
            fingerprint,
        },
    ))
}

/// Rebuild a signing CA from its persisted certificate and key.
pub(crate) fn load_ca(cert_pem: &str, key_pem: &str) -> Result<Certificate, PkiError> {
    let key_pair = KeyPair::from_pem(key_pem).map_err(cert_err("failed to parse CA key"))?;
    let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)
        .map_err(cert_err("failed to parse CA certificate"))?;
    Certificate::from_params(params).map_err(cert_err("failed to load CA"))
}

/// Which side of the tunnel a leaf certificate is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafRole {
    Server,
    Client,
}

/// Issue a leaf certificate with a fresh key, signed by `ca`.
///
/// For servers `san_host` becomes the subject alternative name.
pub(crate) fn issue_leaf(
    ca: &Certificate,
    common_name: &str,
    role: LeafRole,
    san_host: Option<&str>,
) -> Result<IssuedPair, PkiError> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::NoCa;
    validity(&mut params, LEAF_VALIDITY_DAYS);

    match role {
        LeafRole::Server => {
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        }
        LeafRole::Client => {
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        }
    }

    if let Some(host) = san_host {
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.to_string()),
        }];
    }

    let leaf = Certificate::from_params(params).map_err(cert_err("failed to create certificate"))?;
    let der = leaf
        .serialize_der_with_signer(ca)
        .map_err(cert_err("failed to sign certificate"))?;
    let (cert_pem, fingerprint) = encode_cert(der);
    Ok(IssuedPair {
        cert_pem,
        key_pem: leaf.serialize_private_key_pem(),
        fingerprint,
    })
}
