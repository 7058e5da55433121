//! Submission, approval and issuance of client certificates.
//!
//! A CSR moves through `Submitted -> Approved -> Issued`, or ends in
//! `TimedOut` when the cluster's CA does not sign it in time. The transitions
//! are a pure function so the polling loop only feeds it observations.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
    CertificateSigningRequestStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::cluster::{ClusterApi, FIELD_MANAGER};
use crate::settings::Settings;
use crate::{Error, Result, Stage, StageExt};

pub const SIGNER_NAME: &str = "kubernetes.io/kube-apiserver-client";
pub const CLIENT_AUTH_USAGE: &str = "client auth";

const APPROVED: &str = "Approved";
const DENIED: &str = "Denied";
const FAILED: &str = "Failed";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
}

/// Approval state as recorded in the CSR's status conditions.
pub fn approval_state(csr: &CertificateSigningRequest) -> ApprovalState {
    let conditions = csr.status.as_ref().and_then(|s| s.conditions.as_deref()).unwrap_or_default();
    let holds = |type_: &str| conditions.iter().any(|c| c.type_ == type_ && c.status == "True");

    if holds(DENIED) || holds(FAILED) {
        ApprovalState::Denied
    } else if holds(APPROVED) {
        ApprovalState::Approved
    } else {
        ApprovalState::Pending
    }
}

/// The signed certificate, once the CA has issued it.
pub fn issued_certificate(csr: &CertificateSigningRequest) -> Option<Vec<u8>> {
    csr.status
        .as_ref()
        .and_then(|s| s.certificate.as_ref())
        .map(|c| c.0.clone())
        .filter(|c| !c.is_empty())
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CsrState {
    Submitted,
    Approved,
    Issued(Vec<u8>),
    TimedOut { elapsed: Duration },
}

#[derive(Clone, Debug)]
pub enum CsrEvent {
    ApprovalRecorded,
    Polled { certificate: Option<Vec<u8>>, elapsed: Duration },
}

impl CsrState {
    pub fn transition(self, event: CsrEvent, timeout: Duration) -> CsrState {
        match (self, event) {
            (CsrState::Submitted, CsrEvent::ApprovalRecorded) => CsrState::Approved,
            (CsrState::Approved, CsrEvent::Polled { certificate: Some(certificate), .. }) if !certificate.is_empty() => {
                CsrState::Issued(certificate)
            }
            (CsrState::Approved, CsrEvent::Polled { elapsed, .. }) if elapsed >= timeout => CsrState::TimedOut { elapsed },
            (state, _) => state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CsrState::Issued(_) | CsrState::TimedOut { .. })
    }
}

/// Outcome of [`CsrIssuer::issue`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Issuance {
    /// Submitted, approved and signed during this call.
    Issued { certificate: Vec<u8>, elapsed: Duration },
    /// The CSR was approved before; nothing was changed.
    AlreadyApproved { certificate: Option<Vec<u8>> },
}

impl Issuance {
    pub fn certificate(&self) -> Option<&[u8]> {
        match self {
            Issuance::Issued { certificate, .. } => Some(certificate),
            Issuance::AlreadyApproved { certificate } => certificate.as_deref(),
        }
    }
}

pub struct CsrIssuer<'a> {
    cluster: &'a dyn ClusterApi,
    poll_interval: Duration,
    expiration_seconds: i32,
}

impl<'a> CsrIssuer<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, settings: &Settings) -> Self {
        Self {
            cluster,
            poll_interval: settings.poll_interval(),
            expiration_seconds: settings.csr_expiration_seconds,
        }
    }

    /// Submits `request_pem` as CSR `name`, approves it and waits up to
    /// `timeout` for the cluster to sign it.
    #[instrument(skip(self, request_pem))]
    pub async fn issue(&self, name: &str, request_pem: &[u8], timeout: Duration) -> Result<Issuance> {
        let started = Instant::now();

        let csr = match self.cluster.get_csr(name).await.at_stage(Stage::CsrSubmission, name)? {
            Some(csr) => match approval_state(&csr) {
                ApprovalState::Approved => {
                    info!("CertificateSigningRequest \"{}\" is already approved. Nothing to do.", name);
                    return Ok(Issuance::AlreadyApproved { certificate: issued_certificate(&csr) });
                }
                ApprovalState::Denied => return Err(Error::CsrDenied(name.to_string()).at(Stage::Approval, name)),
                ApprovalState::Pending if csr.spec.request.0 != request_pem => {
                    return Err(Error::AlreadyExists {
                        kind: "CertificateSigningRequest",
                        name: name.to_string(),
                    }
                    .at(Stage::CsrSubmission, name));
                }
                ApprovalState::Pending => {
                    debug!("CertificateSigningRequest \"{}\" exists and is pending", name);
                    csr
                }
            },
            None => {
                info!("CertificateSigningRequest \"{}\" does not exist. Creating...", name);
                self.cluster
                    .create_csr(&self.request(name, request_pem))
                    .await
                    .at_stage(Stage::CsrSubmission, name)?
            }
        };

        let state = CsrState::Submitted;
        self.cluster.approve_csr(name, &approve(csr, name)).await.at_stage(Stage::Approval, name)?;
        info!("Approved CertificateSigningRequest \"{}\"", name);
        let state = state.transition(CsrEvent::ApprovalRecorded, timeout);

        let certificate = self.poll(name, state, started, timeout).await?;
        Ok(Issuance::Issued {
            certificate,
            elapsed: started.elapsed(),
        })
    }

    /// Waits for an already approved CSR to be signed. Performs reads only.
    #[instrument(skip(self))]
    pub async fn await_certificate(&self, name: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.poll(name, CsrState::Approved, Instant::now(), timeout).await
    }

    async fn poll(&self, name: &str, mut state: CsrState, started: Instant, timeout: Duration) -> Result<Vec<u8>> {
        loop {
            let Some(csr) = self.cluster.get_csr(name).await.at_stage(Stage::Polling, name)? else {
                return Err(Error::NotFound {
                    kind: "CertificateSigningRequest",
                    name: name.to_string(),
                }
                .at(Stage::Polling, name));
            };
            if approval_state(&csr) == ApprovalState::Denied {
                return Err(Error::CsrDenied(name.to_string()).at(Stage::Polling, name));
            }

            let event = CsrEvent::Polled {
                certificate: issued_certificate(&csr),
                elapsed: started.elapsed(),
            };
            match state.transition(event, timeout) {
                CsrState::Issued(certificate) => {
                    info!("Certificate for \"{}\" issued after {:?}", name, started.elapsed());
                    return Ok(certificate);
                }
                CsrState::TimedOut { elapsed } => {
                    return Err(Error::CertificateTimeout {
                        name: name.to_string(),
                        elapsed,
                    }
                    .at(Stage::Polling, name));
                }
                next => state = next,
            }

            let wait = self.poll_interval.min(timeout.saturating_sub(started.elapsed()));
            debug!("Certificate for \"{}\" not issued yet, checking again in {:?}", name, wait);
            tokio::time::sleep(wait).await;
        }
    }

    fn request(&self, name: &str, request_pem: &[u8]) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request_pem.to_vec()),
                signer_name: SIGNER_NAME.to_string(),
                expiration_seconds: Some(self.expiration_seconds),
                usages: Some(vec![CLIENT_AUTH_USAGE.to_string()]),
                ..Default::default()
            },
            status: None,
        }
    }
}

fn approve(mut csr: CertificateSigningRequest, name: &str) -> CertificateSigningRequest {
    let now = Time(Utc::now());
    let status = csr.status.get_or_insert_with(CertificateSigningRequestStatus::default);
    status.conditions.get_or_insert_with(Vec::new).push(CertificateSigningRequestCondition {
        type_: APPROVED.to_string(),
        status: "True".to_string(),
        reason: Some("WorkerTrustApprove".to_string()),
        message: Some(format!("Approved by {} for identity {}", FIELD_MANAGER, name)),
        last_update_time: Some(now.clone()),
        last_transition_time: Some(now),
    });
    csr
}
