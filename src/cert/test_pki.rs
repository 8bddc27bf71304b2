//! rcgen-backed certificate fixtures, shared by unit and integration tests.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    date_time_ymd,
};

/// A throwaway CA that can issue leaf certificates.
pub struct TestCa {
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    issuer: Issuer<'static, KeyPair>,
}

impl TestCa {
    pub fn new(cn: &str) -> Self {
        let key = KeyPair::generate().expect("CA key generation failed");
        let mut params = CertificateParams::default();
        params.distinguished_name = dn(cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).expect("CA self-signing failed");
        Self {
            cert_pem: cert.pem(),
            cert_der: cert.der().to_vec(),
            issuer: Issuer::new(params, key),
        }
    }

    /// The CA as it appears in configuration: base64 of the PEM text.
    pub fn config_value(&self) -> String {
        STANDARD.encode(self.cert_pem.as_bytes())
    }

    /// Issue a currently-valid leaf and return its DER.
    pub fn issue(&self, cn: &str) -> Vec<u8> {
        self.issue_with(leaf_params(cn))
    }

    /// Issue a leaf whose validity window ended in 2001.
    pub fn issue_expired(&self, cn: &str) -> Vec<u8> {
        let mut params = leaf_params(cn);
        params.not_before = date_time_ymd(2000, 1, 1);
        params.not_after = date_time_ymd(2001, 1, 1);
        self.issue_with(params)
    }

    fn issue_with(&self, params: CertificateParams) -> Vec<u8> {
        let key = KeyPair::generate().expect("leaf key generation failed");
        params
            .signed_by(&key, &self.issuer)
            .expect("leaf signing failed")
            .der()
            .to_vec()
    }
}

/// A self-signed leaf that chains to nothing.
pub fn self_signed(cn: &str) -> Vec<u8> {
    let key = KeyPair::generate().expect("key generation failed");
    leaf_params(cn)
        .self_signed(&key)
        .expect("self-signing failed")
        .der()
        .to_vec()
}

/// The forwarded-header form of a certificate: bare base64 DER.
pub fn header_value(der: &[u8]) -> String {
    STANDARD.encode(der)
}

fn leaf_params(cn: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = dn(cn);
    params
}

fn dn(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    dn
}
