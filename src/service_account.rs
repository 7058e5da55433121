//! Service accounts with long-lived token secrets.
//!
//! Agent provisioning relies on [`ensure_token_secret`]; the other functions
//! manage service accounts outside of a bootstrap.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{debug, info, instrument};

use crate::cluster::{tolerate_existing, ClusterApi};
use crate::{Error, Result};

pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceAccountIdentity {
    pub namespace: String,
    pub service_account: String,
    pub secrets: Vec<String>,
}

pub fn token_secret_name(service_account: &str) -> String {
    format!("tkn-{}", service_account)
}

/// Creates service account `name` and a token secret owned by it. Both may
/// already exist.
#[instrument(skip(cluster))]
pub async fn create(cluster: &dyn ClusterApi, name: &str, namespace: &str) -> Result<ServiceAccountIdentity> {
    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match cluster.create_service_account(namespace, &account).await {
        Ok(_) => info!("Created ServiceAccount \"{}\" in {}", name, namespace),
        Err(e) if e.is_already_exists() => debug!("ServiceAccount \"{}.{}\" exists", name, namespace),
        Err(e) => return Err(e),
    }

    let secret_name = ensure_token_secret(cluster, name, namespace).await?;
    Ok(ServiceAccountIdentity {
        namespace: namespace.to_string(),
        service_account: name.to_string(),
        secrets: vec![secret_name],
    })
}

/// Creates the token secret of the existing service account `name` unless it
/// is already there. Returns the secret's name.
#[instrument(skip(cluster))]
pub async fn ensure_token_secret(cluster: &dyn ClusterApi, name: &str, namespace: &str) -> Result<String> {
    let secret_name = token_secret_name(name);
    if cluster.get_secret(namespace, &secret_name).await?.is_some() {
        debug!("Token secret \"{}.{}\" exists", secret_name, namespace);
        return Ok(secret_name);
    }

    let account = cluster
        .get_service_account(namespace, name)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "ServiceAccount",
            name: name.to_string(),
        })?;
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
                name.to_string(),
            )])),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".to_string(),
                kind: "ServiceAccount".to_string(),
                name: name.to_string(),
                uid: account.metadata.uid.unwrap_or_default(),
                ..Default::default()
            }]),
            ..Default::default()
        },
        type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
        ..Default::default()
    };
    info!("Creating token secret \"{}\" in {}", secret_name, namespace);
    tolerate_existing(cluster.create_secret(namespace, &secret).await)?;
    Ok(secret_name)
}

/// Deletes service account `name`; a missing account is not an error.
#[instrument(skip(cluster))]
pub async fn delete_if_exists(cluster: &dyn ClusterApi, name: &str, namespace: &str) -> Result<()> {
    match cluster.delete_service_account(namespace, name).await {
        Err(e) if e.is_not_found() => {
            debug!("ServiceAccount \"{}.{}\" already gone", name, namespace);
            Ok(())
        }
        other => other,
    }
}

/// The most recently created token secret of service account `name`.
pub async fn latest_token_secret(cluster: &dyn ClusterApi, name: &str, namespace: &str) -> Result<Secret> {
    cluster
        .list_secrets(namespace)
        .await?
        .into_iter()
        .filter(|s| {
            s.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(SERVICE_ACCOUNT_NAME_ANNOTATION))
                .map(|n| n == name)
                .unwrap_or(false)
        })
        .max_by_key(|s| s.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .ok_or_else(|| Error::SecretNotFound(name.to_string()))
}
