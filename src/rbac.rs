//! Least-privilege access for the control plane identity and its agents.
//!
//! Grants are plain data. [`AccessProvisioner`] turns them into Role /
//! ClusterRole objects and their bindings, creating only what is missing.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::cluster::{tolerate_existing, ClusterApi};
use crate::identity::PRIMAZA_IDENTITY;
use crate::service_account::ensure_token_secret;
use crate::Result;

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

const CORE: &str = "";
const APPS: &str = "apps";
const PRIMAZA: &str = "primaza.io";

const ALL_VERBS: &[&str] = &["get", "list", "watch", "create", "update", "patch", "delete"];
const READ_VERBS: &[&str] = &["get", "list", "watch"];
const WRITE_VERBS: &[&str] = &["get", "list", "watch", "update", "patch"];

/// One permission entry of a role.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rule {
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub verbs: Vec<String>,
    pub resource_names: Option<Vec<String>>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl Rule {
    pub fn new(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> Self {
        Self {
            api_groups: strings(api_groups),
            resources: strings(resources),
            verbs: strings(verbs),
            resource_names: None,
        }
    }

    pub fn named(mut self, resource_names: &[&str]) -> Self {
        self.resource_names = Some(strings(resource_names));
        self
    }
}

impl From<&Rule> for PolicyRule {
    fn from(rule: &Rule) -> Self {
        PolicyRule {
            api_groups: Some(rule.api_groups.clone()),
            resources: Some(rule.resources.clone()),
            verbs: rule.verbs.clone(),
            resource_names: rule.resource_names.clone(),
            ..Default::default()
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SubjectKind {
    User,
    ServiceAccount,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Scope {
    Cluster,
    Namespace(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccessGrant {
    pub role_name: String,
    pub binding_name: String,
    pub scope: Scope,
    pub subject_kind: SubjectKind,
    pub subject_name: String,
    /// Namespace of a service account subject.
    pub subject_namespace: Option<String>,
    pub rules: Vec<Rule>,
}

impl AccessGrant {
    fn subject(&self) -> Subject {
        match self.subject_kind {
            SubjectKind::User => Subject {
                api_group: Some(RBAC_API_GROUP.to_string()),
                kind: "User".to_string(),
                name: self.subject_name.clone(),
                namespace: None,
            },
            SubjectKind::ServiceAccount => Subject {
                api_group: None,
                kind: "ServiceAccount".to_string(),
                name: self.subject_name.clone(),
                namespace: self.subject_namespace.clone(),
            },
        }
    }

    fn role_ref(&self) -> RoleRef {
        RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: match self.scope {
                Scope::Cluster => "ClusterRole",
                Scope::Namespace(_) => "Role",
            }
            .to_string(),
            name: self.role_name.clone(),
        }
    }

    fn meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: match &self.scope {
                Scope::Cluster => None,
                Scope::Namespace(ns) => Some(ns.clone()),
            },
            ..Default::default()
        }
    }

    fn policy_rules(&self) -> Vec<PolicyRule> {
        self.rules.iter().map(PolicyRule::from).collect()
    }

    pub fn manifests(&self) -> Vec<Manifest> {
        match self.scope {
            Scope::Cluster => vec![
                Manifest::ClusterRole(ClusterRole {
                    metadata: self.meta(&self.role_name),
                    rules: Some(self.policy_rules()),
                    ..Default::default()
                }),
                Manifest::ClusterRoleBinding(ClusterRoleBinding {
                    metadata: self.meta(&self.binding_name),
                    role_ref: self.role_ref(),
                    subjects: Some(vec![self.subject()]),
                }),
            ],
            Scope::Namespace(_) => vec![
                Manifest::Role(Role {
                    metadata: self.meta(&self.role_name),
                    rules: Some(self.policy_rules()),
                }),
                Manifest::RoleBinding(RoleBinding {
                    metadata: self.meta(&self.binding_name),
                    role_ref: self.role_ref(),
                    subjects: Some(vec![self.subject()]),
                }),
            ],
        }
    }
}

/// Any object the provisioner may create.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum Manifest {
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    Role(Role),
    RoleBinding(RoleBinding),
}

/// Cluster-wide access of the control plane identity: enough to bootstrap
/// agents into a worker cluster.
pub fn control_plane_grant() -> AccessGrant {
    AccessGrant {
        role_name: PRIMAZA_IDENTITY.to_string(),
        binding_name: format!("{}-{}", PRIMAZA_IDENTITY, PRIMAZA_IDENTITY),
        scope: Scope::Cluster,
        subject_kind: SubjectKind::User,
        subject_name: PRIMAZA_IDENTITY.to_string(),
        subject_namespace: None,
        rules: vec![
            Rule::new(&[CORE], &["pods"], &["list", "get", "create"]),
            Rule::new(&[CORE], &["secrets"], &["list", "get", "create"]),
            Rule::new(&[PRIMAZA], &["servicebindings"], &["create"]),
        ],
    }
}

/// Access of the control plane identity inside an application or service
/// namespace.
pub fn namespace_grant(namespace: &str) -> AccessGrant {
    AccessGrant {
        role_name: "primaza-role".to_string(),
        binding_name: "primaza-rolebinding".to_string(),
        scope: Scope::Namespace(namespace.to_string()),
        subject_kind: SubjectKind::User,
        subject_name: PRIMAZA_IDENTITY.to_string(),
        subject_namespace: None,
        rules: vec![
            Rule::new(&[CORE], &["services"], ALL_VERBS),
            Rule::new(&[APPS], &["deployments"], &["create"]),
            Rule::new(&[APPS], &["deployments"], &["delete"])
                .named(&[AgentKind::Application.deployment_name(), AgentKind::Service.deployment_name()]),
            Rule::new(&[PRIMAZA], &["servicebindings", "serviceclasses"], ALL_VERBS),
        ],
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AgentKind {
    Application,
    Service,
}

impl AgentKind {
    pub fn name(self) -> &'static str {
        match self {
            AgentKind::Application => "agentapp",
            AgentKind::Service => "agentsvc",
        }
    }

    /// Name of both the agent's deployment and its service account.
    pub fn deployment_name(self) -> &'static str {
        match self {
            AgentKind::Application => "primaza-controller-agentapp",
            AgentKind::Service => "primaza-controller-agentsvc",
        }
    }

    /// Permissions specific to this kind of agent.
    pub fn rules(self) -> Vec<Rule> {
        match self {
            AgentKind::Application => vec![
                Rule::new(&[APPS], &["deployments"], WRITE_VERBS),
                Rule::new(&[PRIMAZA], &["serviceclaims"], READ_VERBS),
                Rule::new(&[PRIMAZA], &["servicebindings", "servicebindings/status"], WRITE_VERBS),
            ],
            AgentKind::Service => vec![
                Rule::new(&[APPS], &["deployments"], &["get", "list"]),
                Rule::new(&[PRIMAZA], &["serviceclasses"], READ_VERBS),
            ],
        }
    }
}

/// Permissions every agent needs: leader election, its configuration,
/// events and secret reads.
pub fn agent_baseline_rules() -> Vec<Rule> {
    vec![
        Rule::new(&["coordination.k8s.io"], &["leases"], ALL_VERBS),
        Rule::new(&[CORE], &["configmaps"], ALL_VERBS),
        Rule::new(&[CORE], &["events"], &["create", "patch"]),
        Rule::new(&[CORE], &["secrets"], &["get", "list"]),
    ]
}

/// Identity and access of an agent deployed in `namespace`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AgentAccess {
    pub kind: AgentKind,
    pub namespace: String,
    pub service_account: String,
    /// Lets the agent authenticate and authorize inbound calls.
    pub review_grant: AccessGrant,
    pub namespace_grant: AccessGrant,
}

impl AgentAccess {
    pub fn new(kind: AgentKind, namespace: &str) -> Self {
        let agent = kind.name();
        let service_account = kind.deployment_name().to_string();

        let review_grant = AccessGrant {
            role_name: format!("primaza-{}-{}-role", agent, namespace),
            binding_name: format!("primaza-{}-{}-rolebinding", agent, namespace),
            scope: Scope::Cluster,
            subject_kind: SubjectKind::ServiceAccount,
            subject_name: service_account.clone(),
            subject_namespace: Some(namespace.to_string()),
            rules: vec![
                Rule::new(&["authentication.k8s.io"], &["tokenreviews"], &["create"]),
                Rule::new(&["authorization.k8s.io"], &["subjectaccessreviews"], &["create"]),
            ],
        };

        let mut rules = agent_baseline_rules();
        rules.extend(kind.rules());
        let namespace_grant = AccessGrant {
            role_name: format!("primaza-{}-role", agent),
            binding_name: format!("{}-rolebinding", agent),
            scope: Scope::Namespace(namespace.to_string()),
            subject_kind: SubjectKind::ServiceAccount,
            subject_name: service_account.clone(),
            subject_namespace: Some(namespace.to_string()),
            rules,
        };

        Self {
            kind,
            namespace: namespace.to_string(),
            service_account,
            review_grant,
            namespace_grant,
        }
    }

    /// Grants the agent `rules` in its namespace on top of its kind's table.
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.namespace_grant.rules.extend(rules);
        self
    }

    fn service_account_object(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(self.service_account.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn manifests(&self) -> Vec<Manifest> {
        let mut manifests = vec![Manifest::ServiceAccount(self.service_account_object())];
        manifests.extend(self.review_grant.manifests());
        manifests.extend(self.namespace_grant.manifests());
        manifests
    }
}

pub struct AccessProvisioner<'a> {
    cluster: &'a dyn ClusterApi,
}

impl<'a> AccessProvisioner<'a> {
    pub fn new(cluster: &'a dyn ClusterApi) -> Self {
        Self { cluster }
    }

    /// Creates the role and binding of `grant` unless they already exist.
    #[instrument(skip(self, grant), fields(role = %grant.role_name, subject = %grant.subject_name))]
    pub async fn grant(&self, grant: &AccessGrant) -> Result<()> {
        for manifest in grant.manifests() {
            self.ensure(manifest).await?;
        }
        Ok(())
    }

    /// Creates the agent's service account with its token secret and both of
    /// its grants.
    #[instrument(skip(self, access), fields(agent = access.kind.name(), namespace = %access.namespace))]
    pub async fn provision_agent(&self, access: &AgentAccess) -> Result<()> {
        for manifest in access.manifests() {
            self.ensure(manifest).await?;
        }
        ensure_token_secret(self.cluster, &access.service_account, &access.namespace).await?;
        info!("Provisioned {} identity in {}", access.kind.name(), access.namespace);
        Ok(())
    }

    async fn ensure(&self, manifest: Manifest) -> Result<()> {
        let cluster = self.cluster;
        match manifest {
            Manifest::ServiceAccount(account) => {
                let (ns, name) = namespaced(&account.metadata);
                if cluster.get_service_account(ns, name).await?.is_some() {
                    debug!("ServiceAccount \"{}.{}\" exists", name, ns);
                    return Ok(());
                }
                info!("Creating ServiceAccount \"{}\" in {}", name, ns);
                tolerate_existing(cluster.create_service_account(ns, &account).await)
            }
            Manifest::ClusterRole(role) => {
                let name = role.metadata.name.as_deref().unwrap_or_default();
                if cluster.get_cluster_role(name).await?.is_some() {
                    debug!("ClusterRole \"{}\" exists", name);
                    return Ok(());
                }
                info!("Creating ClusterRole \"{}\"", name);
                tolerate_existing(cluster.create_cluster_role(&role).await)
            }
            Manifest::ClusterRoleBinding(binding) => {
                let name = binding.metadata.name.as_deref().unwrap_or_default();
                if cluster.get_cluster_role_binding(name).await?.is_some() {
                    debug!("ClusterRoleBinding \"{}\" exists", name);
                    return Ok(());
                }
                info!("Creating ClusterRoleBinding \"{}\"", name);
                tolerate_existing(cluster.create_cluster_role_binding(&binding).await)
            }
            Manifest::Role(role) => {
                let (ns, name) = namespaced(&role.metadata);
                if cluster.get_role(ns, name).await?.is_some() {
                    debug!("Role \"{}.{}\" exists", name, ns);
                    return Ok(());
                }
                info!("Creating Role \"{}\" in {}", name, ns);
                tolerate_existing(cluster.create_role(ns, &role).await)
            }
            Manifest::RoleBinding(binding) => {
                let (ns, name) = namespaced(&binding.metadata);
                if cluster.get_role_binding(ns, name).await?.is_some() {
                    debug!("RoleBinding \"{}.{}\" exists", name, ns);
                    return Ok(());
                }
                info!("Creating RoleBinding \"{}\" in {}", name, ns);
                tolerate_existing(cluster.create_role_binding(ns, &binding).await)
            }
        }
    }
}

fn namespaced(meta: &ObjectMeta) -> (&str, &str) {
    (
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}
