use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

#[cfg(test)]
pub(crate) mod memory;

pub(crate) const FIELD_MANAGER: &str = "worker-trust";

/// Calls against a worker cluster's control plane.
///
/// Reads return `None` when the object does not exist, creates fail with
/// [`Error::AlreadyExists`] on conflict and deletes fail with
/// [`Error::NotFound`] when there is nothing to delete.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>>;
    async fn create_csr(&self, csr: &CertificateSigningRequest) -> Result<CertificateSigningRequest>;
    /// Replaces the approval conditions through the `approval` subresource.
    async fn approve_csr(&self, name: &str, csr: &CertificateSigningRequest) -> Result<CertificateSigningRequest>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>>;
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>>;
    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole>;
    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>>;
    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<ClusterRoleBinding>;

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>>;
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<Role>;
    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>>;
    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding) -> Result<RoleBinding>;

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>>;
    async fn create_service_account(&self, namespace: &str, account: &ServiceAccount) -> Result<ServiceAccount>;
    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;
}

/// [`ClusterApi`] backed by a kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        let mut ps = PostParams::default();
        ps.field_manager = Some(FIELD_MANAGER.to_string());
        ps
    }
}

fn conflict<'a>(kind: &'static str, name: &'a str) -> impl FnOnce(kube::Error) -> Error + 'a {
    move |e| match e {
        kube::Error::Api(ae) if ae.code == 409 => Error::AlreadyExists { kind, name: name.to_string() },
        e => Error::KubeError(e),
    }
}

fn missing<'a>(kind: &'static str, name: &'a str) -> impl FnOnce(kube::Error) -> Error + 'a {
    move |e| match e {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound { kind, name: name.to_string() },
        e => Error::KubeError(e),
    }
}

fn object_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>> {
        let csrs: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        Ok(csrs.get_opt(name).await?)
    }

    async fn create_csr(&self, csr: &CertificateSigningRequest) -> Result<CertificateSigningRequest> {
        let csrs: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        csrs.create(&Self::post_params(), csr)
            .await
            .map_err(conflict("CertificateSigningRequest", object_name(&csr.metadata)))
    }

    async fn approve_csr(&self, name: &str, csr: &CertificateSigningRequest) -> Result<CertificateSigningRequest> {
        let csrs: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let body = serde_json::to_vec(csr)?;
        debug!("Submitting approval for CertificateSigningRequest \"{}\"", name);
        csrs.replace_subresource("approval", name, &Self::post_params(), body)
            .await
            .map_err(missing("CertificateSigningRequest", name))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get_opt(name).await?)
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.list(&ListParams::default()).await?.items)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        secrets.create(&Self::post_params(), secret)
            .await
            .map_err(conflict("Secret", object_name(&secret.metadata)))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        secrets.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(missing("Secret", name))
    }

    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>> {
        let roles: Api<ClusterRole> = Api::all(self.client.clone());
        Ok(roles.get_opt(name).await?)
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole> {
        let roles: Api<ClusterRole> = Api::all(self.client.clone());
        roles.create(&Self::post_params(), role)
            .await
            .map_err(conflict("ClusterRole", object_name(&role.metadata)))
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        let bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        Ok(bindings.get_opt(name).await?)
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<ClusterRoleBinding> {
        let bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        bindings.create(&Self::post_params(), binding)
            .await
            .map_err(conflict("ClusterRoleBinding", object_name(&binding.metadata)))
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>> {
        let roles: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        Ok(roles.get_opt(name).await?)
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<Role> {
        let roles: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        roles.create(&Self::post_params(), role)
            .await
            .map_err(conflict("Role", object_name(&role.metadata)))
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>> {
        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        Ok(bindings.get_opt(name).await?)
    }

    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding) -> Result<RoleBinding> {
        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        bindings.create(&Self::post_params(), binding)
            .await
            .map_err(conflict("RoleBinding", object_name(&binding.metadata)))
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(accounts.get_opt(name).await?)
    }

    async fn create_service_account(&self, namespace: &str, account: &ServiceAccount) -> Result<ServiceAccount> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        accounts.create(&Self::post_params(), account)
            .await
            .map_err(conflict("ServiceAccount", object_name(&account.metadata)))
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        accounts.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(missing("ServiceAccount", name))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        namespaces.create(&Self::post_params(), namespace)
            .await
            .map_err(conflict("Namespace", object_name(&namespace.metadata)))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments.get_opt(name).await?)
    }
}

/// Turns a conflicting create into success. Used by the idempotent flows,
/// which pre-check existence but can still race another writer.
pub(crate) fn tolerate_existing<T>(result: Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(Error::AlreadyExists { kind, name }) => {
            debug!("{} \"{}\" already exists", kind, name);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
