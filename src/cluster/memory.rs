//! In-memory cluster used by the test suites. Signs approved CSRs after a
//! configurable delay measured on the tokio clock.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestStatus};
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tokio::time::Instant;

use crate::cluster::ClusterApi;
use crate::csr::{approval_state, ApprovalState};
use crate::{Error, Result};

pub(crate) const ISSUED_CERTIFICATE: &str = "-----BEGIN CERTIFICATE-----\nZmFrZQ==\n-----END CERTIFICATE-----\n";

type Key = (String, String);

#[derive(Default)]
struct Objects {
    csrs: BTreeMap<String, CertificateSigningRequest>,
    approved_at: BTreeMap<String, Instant>,
    secrets: BTreeMap<Key, Secret>,
    cluster_roles: BTreeMap<String, ClusterRole>,
    cluster_role_bindings: BTreeMap<String, ClusterRoleBinding>,
    roles: BTreeMap<Key, Role>,
    role_bindings: BTreeMap<Key, RoleBinding>,
    service_accounts: BTreeMap<Key, ServiceAccount>,
    namespaces: BTreeMap<String, Namespace>,
    deployments: BTreeMap<Key, Deployment>,
}

#[derive(Default)]
pub(crate) struct MemoryCluster {
    objects: Mutex<Objects>,
    mutations: Mutex<usize>,
    reads: Mutex<usize>,
    sign_after: Option<Duration>,
}

fn name_of(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn insert_new<T: Clone>(map: &mut BTreeMap<Key, T>, k: Key, kind: &'static str, obj: &T) -> Result<T> {
    if map.contains_key(&k) {
        return Err(Error::AlreadyExists { kind, name: k.1 });
    }
    map.insert(k, obj.clone());
    Ok(obj.clone())
}

fn insert_new_global<T: Clone>(map: &mut BTreeMap<String, T>, k: String, kind: &'static str, obj: &T) -> Result<T> {
    if map.contains_key(&k) {
        return Err(Error::AlreadyExists { kind, name: k });
    }
    map.insert(k, obj.clone());
    Ok(obj.clone())
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster whose CA signs a CSR once it has been approved for `delay`.
    pub fn signing_after(delay: Duration) -> Self {
        Self {
            sign_after: Some(delay),
            ..Self::default()
        }
    }

    pub fn mutations(&self) -> usize {
        *self.mutations.lock().unwrap()
    }

    pub fn csr_reads(&self) -> usize {
        *self.reads.lock().unwrap()
    }

    fn mutated(&self) {
        *self.mutations.lock().unwrap() += 1;
    }

    pub fn insert_csr(&self, csr: CertificateSigningRequest) {
        self.objects.lock().unwrap().csrs.insert(name_of(&csr.metadata), csr);
    }

    pub fn insert_deployment(&self, namespace: &str, name: &str) {
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.objects.lock().unwrap().deployments.insert(key(namespace, name), deployment);
    }

    pub fn insert_secret(&self, namespace: &str, secret: Secret) {
        let k = key(namespace, &name_of(&secret.metadata));
        self.objects.lock().unwrap().secrets.insert(k, secret);
    }

    pub fn secrets(&self, namespace: &str) -> Vec<Secret> {
        let objects = self.objects.lock().unwrap();
        objects.secrets.iter().filter(|((ns, _), _)| ns == namespace).map(|(_, s)| s.clone()).collect()
    }

    pub fn roles(&self, namespace: &str) -> Vec<Role> {
        let objects = self.objects.lock().unwrap();
        objects.roles.iter().filter(|((ns, _), _)| ns == namespace).map(|(_, r)| r.clone()).collect()
    }

    pub fn role_bindings(&self, namespace: &str) -> Vec<RoleBinding> {
        let objects = self.objects.lock().unwrap();
        objects.role_bindings.iter().filter(|((ns, _), _)| ns == namespace).map(|(_, r)| r.clone()).collect()
    }

    pub fn cluster_roles(&self) -> Vec<ClusterRole> {
        self.objects.lock().unwrap().cluster_roles.values().cloned().collect()
    }

    pub fn cluster_role_bindings(&self) -> Vec<ClusterRoleBinding> {
        self.objects.lock().unwrap().cluster_role_bindings.values().cloned().collect()
    }

    pub fn service_accounts(&self, namespace: &str) -> Vec<ServiceAccount> {
        let objects = self.objects.lock().unwrap();
        objects.service_accounts.iter().filter(|((ns, _), _)| ns == namespace).map(|(_, s)| s.clone()).collect()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.objects.lock().unwrap().namespaces.keys().cloned().collect()
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>> {
        *self.reads.lock().unwrap() += 1;
        let mut objects = self.objects.lock().unwrap();
        let signable = match (self.sign_after, objects.approved_at.get(name)) {
            (Some(delay), Some(approved_at)) => approved_at.elapsed() >= delay,
            _ => false,
        };
        let Some(csr) = objects.csrs.get_mut(name) else {
            return Ok(None);
        };
        if signable {
            let status = csr.status.get_or_insert_with(CertificateSigningRequestStatus::default);
            if status.certificate.is_none() {
                status.certificate = Some(ByteString(ISSUED_CERTIFICATE.as_bytes().to_vec()));
            }
        }
        Ok(Some(csr.clone()))
    }

    async fn create_csr(&self, csr: &CertificateSigningRequest) -> Result<CertificateSigningRequest> {
        self.mutated();
        let mut objects = self.objects.lock().unwrap();
        insert_new_global(&mut objects.csrs, name_of(&csr.metadata), "CertificateSigningRequest", csr)
    }

    async fn approve_csr(&self, name: &str, csr: &CertificateSigningRequest) -> Result<CertificateSigningRequest> {
        self.mutated();
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.csrs.get_mut(name) else {
            return Err(Error::NotFound { kind: "CertificateSigningRequest", name: name.to_string() });
        };
        let status = stored.status.get_or_insert_with(CertificateSigningRequestStatus::default);
        status.conditions = csr.status.as_ref().and_then(|s| s.conditions.clone());
        let approved = approval_state(stored) == ApprovalState::Approved;
        let updated = stored.clone();
        if approved {
            objects.approved_at.insert(name.to_string(), Instant::now());
        }
        Ok(updated)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.objects.lock().unwrap().secrets.get(&key(namespace, name)).cloned())
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>> {
        Ok(self.secrets(namespace))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        self.mutated();
        let mut objects = self.objects.lock().unwrap();
        insert_new(&mut objects.secrets, key(namespace, &name_of(&secret.metadata)), "Secret", secret)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.mutated();
        match self.objects.lock().unwrap().secrets.remove(&key(namespace, name)) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound { kind: "Secret", name: name.to_string() }),
        }
    }

    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>> {
        Ok(self.objects.lock().unwrap().cluster_roles.get(name).cloned())
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole> {
        self.mutated();
        let mut objects = self.objects.lock().unwrap();
        insert_new_global(&mut objects.cluster_roles, name_of(&role.metadata), "ClusterRole", role)
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        Ok(self.objects.lock().unwrap().cluster_role_bindings.get(name).cloned())
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<ClusterRoleBinding> {
        self.mutated();
        let mut objects = self.objects.lock().unwrap();
        insert_new_global(&mut objects.cluster_role_bindings, name_of(&binding.metadata), "ClusterRoleBinding", binding)
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>> {
        Ok(self.objects.lock().unwrap().roles.get(&key(namespace, name)).cloned())
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<Role> {
        self.mutated();
        let mut objects = self.objects.lock().unwrap();
        insert_new(&mut objects.roles, key(namespace, &name_of(&role.metadata)), "Role", role)
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>> {
        Ok(self.objects.lock().unwrap().role_bindings.get(&key(namespace, name)).cloned())
    }

    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding) -> Result<RoleBinding> {
        self.mutated();
        let mut objects = self.objects.lock().unwrap();
        insert_new(&mut objects.role_bindings, key(namespace, &name_of(&binding.metadata)), "RoleBinding", binding)
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>> {
        Ok(self.objects.lock().unwrap().service_accounts.get(&key(namespace, name)).cloned())
    }

    async fn create_service_account(&self, namespace: &str, account: &ServiceAccount) -> Result<ServiceAccount> {
        self.mutated();
        let mut objects = self.objects.lock().unwrap();
        let mut account = account.clone();
        account.metadata.uid = Some(format!("uid-{}", name_of(&account.metadata)));
        insert_new(&mut objects.service_accounts, key(namespace, &name_of(&account.metadata)), "ServiceAccount", &account)
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()> {
        self.mutated();
        match self.objects.lock().unwrap().service_accounts.remove(&key(namespace, name)) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound { kind: "ServiceAccount", name: name.to_string() }),
        }
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        self.mutated();
        let mut objects = self.objects.lock().unwrap();
        insert_new_global(&mut objects.namespaces, name_of(&namespace.metadata), "Namespace", namespace)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.objects.lock().unwrap().deployments.get(&key(namespace, name)).cloned())
    }
}
