//! Trust bootstrap of a worker cluster.
//!
//! The control plane identity gets a client certificate signed by the
//! worker's CA and a cluster-wide grant; each application or service
//! namespace gets an agent identity and a namespace grant for the control
//! plane identity.

use std::time::Duration;

use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{info, instrument};

use crate::cluster::{tolerate_existing, ClusterApi};
use crate::csr::{CsrIssuer, Issuance};
use crate::identity::{Identity, PRIMAZA_IDENTITY};
use crate::kubeconfig::{synthesize, Kubeconfig};
use crate::rbac::{control_plane_grant, namespace_grant, AccessProvisioner, AgentAccess, AgentKind};
use crate::secret::SecretPublisher;
use crate::settings::Settings;
use crate::{Error, Result, Stage, StageExt};

/// Secret holding the kubeconfig agents use to reach the control plane.
pub const CLUSTER_CONTEXT_SECRET: &str = "primaza-kubeconfig";

pub struct WorkerCluster<'a> {
    cluster: &'a dyn ClusterApi,
    settings: Settings,
}

/// What to bootstrap on a worker cluster.
#[derive(Clone, Debug, Default)]
pub struct BootstrapPlan {
    /// Administrator kubeconfig of the worker, as reachable by the control
    /// plane. The control plane identity's kubeconfig is derived from it.
    pub base: Kubeconfig,
    pub application: Vec<String>,
    pub service: Vec<String>,
    /// Published to every agent namespace as [`CLUSTER_CONTEXT_SECRET`].
    pub cluster_context: Option<Kubeconfig>,
}

impl BootstrapPlan {
    fn agents(&self) -> impl Iterator<Item = (&str, AgentKind)> {
        let apps = self.application.iter().map(|ns| (ns.as_str(), AgentKind::Application));
        let svcs = self.service.iter().map(|ns| (ns.as_str(), AgentKind::Service));
        apps.chain(svcs)
    }
}

impl<'a> WorkerCluster<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, settings: Settings) -> Self {
        Self { cluster, settings }
    }

    /// Issues the control plane identity's certificate and grants it
    /// cluster-wide access.
    #[instrument(skip(self, request_pem))]
    pub async fn create_primaza_user(&self, request_pem: &[u8], timeout: Duration) -> Result<Issuance> {
        let issuance = CsrIssuer::new(self.cluster, &self.settings)
            .issue(PRIMAZA_IDENTITY, request_pem, timeout)
            .await?;
        AccessProvisioner::new(self.cluster)
            .grant(&control_plane_grant())
            .await
            .at_stage(Stage::RoleGrant, PRIMAZA_IDENTITY)?;
        Ok(issuance)
    }

    pub async fn create_application_namespace(&self, namespace: &str) -> Result<()> {
        self.create_agent_namespace(namespace, AgentKind::Application).await
    }

    pub async fn create_service_namespace(&self, namespace: &str) -> Result<()> {
        self.create_agent_namespace(namespace, AgentKind::Service).await
    }

    #[instrument(skip(self))]
    async fn create_agent_namespace(&self, namespace: &str, kind: AgentKind) -> Result<()> {
        let access = AgentAccess::new(kind, namespace);
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        tolerate_existing(self.cluster.create_namespace(&ns).await)
            .at_stage(Stage::NamespaceCreation, &access.service_account)?;

        let provisioner = AccessProvisioner::new(self.cluster);
        provisioner
            .provision_agent(&access)
            .await
            .at_stage(Stage::RoleGrant, &access.service_account)?;
        provisioner
            .grant(&namespace_grant(namespace))
            .await
            .at_stage(Stage::RoleGrant, PRIMAZA_IDENTITY)?;
        info!("Namespace {} is ready for {}", namespace, kind.name());
        Ok(())
    }

    /// A kubeconfig authenticating as `identity` with its issued `certificate`.
    pub fn primaza_kubeconfig(&self, base: &Kubeconfig, identity: &Identity, certificate: &[u8]) -> Result<Kubeconfig> {
        synthesize(base, identity.name(), certificate, &identity.private_key_pem()).at_stage(Stage::Kubeconfig, identity.name())
    }

    /// Publishes `kubeconfig` as secret `secret_name`. Failures name the
    /// identity the kubeconfig authenticates as.
    pub async fn publish_cluster_context(&self, secret_name: &str, kubeconfig: &Kubeconfig, namespace: &str) -> Result<()> {
        SecretPublisher::new(self.cluster, self.settings.secret_delete_policy)
            .publish_kubeconfig(secret_name, namespace, kubeconfig)
            .await
            .at_stage(Stage::SecretPublish, kubeconfig.identity().unwrap_or_default())
    }

    /// Whether the agent's controller deployment exists in `namespace`.
    pub async fn is_agent_deployed(&self, namespace: &str, kind: AgentKind) -> Result<bool> {
        Ok(self.cluster.get_deployment(namespace, kind.deployment_name()).await?.is_some())
    }

    /// Runs the whole bootstrap: certificate and grant for the control plane
    /// identity, its kubeconfig, then every namespace of `plan` concurrently.
    #[instrument(skip_all)]
    pub async fn bootstrap(&self, plan: &BootstrapPlan) -> Result<(Identity, Kubeconfig)> {
        let mut identity = Identity::generate(PRIMAZA_IDENTITY)?;
        let request = identity.certificate_signing_request()?;
        let timeout = self.settings.csr_timeout();

        let certificate = match self.create_primaza_user(request.as_bytes(), timeout).await? {
            Issuance::Issued { certificate, .. } => certificate,
            Issuance::AlreadyApproved { .. } => {
                // signed for a key this process never held
                return Err(Error::AlreadyExists {
                    kind: "CertificateSigningRequest",
                    name: PRIMAZA_IDENTITY.to_string(),
                }
                .at(Stage::CsrSubmission, PRIMAZA_IDENTITY));
            }
        };
        let kubeconfig = self.primaza_kubeconfig(&plan.base, &identity, &certificate)?;
        identity.set_certificate(certificate);

        try_join_all(plan.agents().map(|(namespace, kind)| async move {
            self.create_agent_namespace(namespace, kind).await?;
            match &plan.cluster_context {
                Some(context) => self.publish_cluster_context(CLUSTER_CONTEXT_SECRET, context, namespace).await,
                None => Ok(()),
            }
        }))
        .await?;

        info!("Worker cluster bootstrapped for {} namespaces", plan.application.len() + plan.service.len());
        Ok((identity, kubeconfig))
    }
}
