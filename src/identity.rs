//! Client-side identities.
//!
//! The private key never leaves the process: only the PEM-encoded
//! certificate signing request built from it is sent to a cluster.

use std::fmt;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use tracing::debug;

use crate::{Error, Result, Stage, StageExt};

/// Name of the control plane identity inside worker clusters.
pub const PRIMAZA_IDENTITY: &str = "primaza";

pub const KEY_BITS: usize = 2048;

/// An actor that authenticates with a client certificate.
pub struct Identity {
    name: String,
    key_pair: KeyPair,
    certificate: Option<Vec<u8>>,
}

impl Identity {
    /// Generates a fresh RSA key pair of [`KEY_BITS`] for `name`.
    pub fn generate(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let key_pair = generate_rsa_key_pair().at_stage(Stage::KeyGeneration, &name)?;
        debug!("Generated key pair for identity \"{}\"", name);
        Ok(Self {
            name,
            key_pair,
            certificate: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref()
    }

    pub fn set_certificate(&mut self, certificate: Vec<u8>) {
        self.certificate = Some(certificate);
    }

    pub fn private_key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    pub fn public_key_pem(&self) -> String {
        self.key_pair.public_key_pem()
    }

    /// Builds a CSR whose subject common name is the identity name.
    pub fn certificate_signing_request(&self) -> Result<String> {
        CsrBuilder::new(&self.name).build(&self.key_pair)
    }
}

fn generate_rsa_key_pair() -> Result<KeyPair> {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)?;
    let pem = private_key.to_pkcs8_pem(LineEnding::LF)?;
    Ok(KeyPair::from_pem_and_sign_algo(&pem, &PKCS_RSA_SHA256)?)
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("certificate", &self.certificate.as_ref().map(|c| c.len()))
            .finish_non_exhaustive()
    }
}

/// Subject attributes of a certificate signing request.
///
/// Kubernetes maps the common name to the user name and each organization
/// to a group of the authenticated user.
#[derive(Clone, Debug)]
pub struct CsrBuilder {
    common_name: String,
    organizations: Vec<String>,
    subject_alt_names: Vec<String>,
}

impl CsrBuilder {
    pub fn new(common_name: impl Into<String>) -> Self {
        let common_name = common_name.into();
        Self {
            subject_alt_names: vec![common_name.clone()],
            common_name,
            organizations: vec![],
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organizations.push(organization.into());
        self
    }

    pub fn with_subject_alt_name(mut self, san: impl Into<String>) -> Self {
        self.subject_alt_names.push(san.into());
        self
    }

    pub fn build(&self, key_pair: &KeyPair) -> Result<String> {
        let name = &self.common_name;
        let mut params = CertificateParams::new(self.subject_alt_names.clone())
            .map_err(Error::from)
            .at_stage(Stage::CsrSubmission, name)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name.clone());
        for organization in &self.organizations {
            dn.push(DnType::OrganizationName, organization.clone());
        }
        params.distinguished_name = dn;

        let csr = params.serialize_request(key_pair).map_err(Error::from).at_stage(Stage::CsrSubmission, name)?;
        csr.pem().map_err(Error::from).at_stage(Stage::CsrSubmission, name)
    }
}
