use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub mod bootstrap;
pub mod cluster;
pub mod csr;
pub mod identity;
pub mod kubeconfig;
pub mod rbac;
pub mod secret;
pub mod service_account;
pub mod settings;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} \"{name}\" already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("CertificateSigningRequest \"{0}\" was denied")]
    CsrDenied(String),

    #[error("certificate for CertificateSigningRequest \"{name}\" not issued after {elapsed:?}")]
    CertificateTimeout { name: String, elapsed: Duration },

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Kubeconfig Error: {0}")]
    KubeconfigError(#[source] kube::config::KubeconfigError),

    #[error("invalid kubeconfig: {0}")]
    InvalidKubeconfig(String),

    #[error("Certificate Error: {0}")]
    CertificateError(#[from] rcgen::Error),

    #[error("RSA Error: {0}")]
    RsaError(#[from] rsa::Error),

    #[error("PKCS#8 Error: {0}")]
    Pkcs8Error(#[from] rsa::pkcs8::Error),

    #[error("YAML Error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kubeconfig source failed: {0}")]
    SourceError(String),

    #[error("no token secret found for service account \"{0}\"")]
    SecretNotFound(String),

    #[error("{stage} failed for identity \"{identity}\": {source}")]
    Bootstrap {
        identity: String,
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::KubeError(e)
    }
}

impl From<kube::config::KubeconfigError> for Error {
    fn from(e: kube::config::KubeconfigError) -> Self {
        Error::KubeconfigError(e)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Step of the trust bootstrap that produced an error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    KeyGeneration,
    CsrSubmission,
    Approval,
    Polling,
    Kubeconfig,
    NamespaceCreation,
    RoleGrant,
    SecretPublish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Stage::KeyGeneration => "key generation",
            Stage::CsrSubmission => "CSR submission",
            Stage::Approval => "CSR approval",
            Stage::Polling => "certificate polling",
            Stage::Kubeconfig => "kubeconfig synthesis",
            Stage::NamespaceCreation => "namespace creation",
            Stage::RoleGrant => "role grant",
            Stage::SecretPublish => "secret publish",
        };
        f.write_str(stage)
    }
}

impl Error {
    /// Attaches the identity and stage to an error. Errors that already carry
    /// a stage keep the innermost one.
    pub fn at(self, stage: Stage, identity: &str) -> Error {
        match self {
            Error::Bootstrap { .. } => self,
            other => Error::Bootstrap {
                identity: identity.to_string(),
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The error without any stage context.
    pub fn root(&self) -> &Error {
        match self {
            Error::Bootstrap { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Bootstrap { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), Error::AlreadyExists { .. })
    }
}

/// Extension for results whose error should name the failing stage.
pub trait StageExt<T> {
    fn at_stage(self, stage: Stage, identity: &str) -> Result<T>;
}

impl<T> StageExt<T> for Result<T> {
    fn at_stage(self, stage: Stage, identity: &str) -> Result<T> {
        self.map_err(|e| e.at(stage, identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_context_is_not_nested() {
        let err = Error::CsrDenied("primaza".into())
            .at(Stage::Approval, "primaza")
            .at(Stage::RoleGrant, "primaza");

        assert_eq!(err.stage(), Some(Stage::Approval));
        assert!(matches!(err.root(), Error::CsrDenied(name) if name == "primaza"));
        assert_eq!(
            err.to_string(),
            "CSR approval failed for identity \"primaza\": CertificateSigningRequest \"primaza\" was denied"
        );
    }

    #[test]
    fn not_found_is_detected_through_stage() {
        let err = Error::NotFound { kind: "Secret", name: "x".into() }.at(Stage::SecretPublish, "primaza");
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
    }
}
