//! Distribution of credential bundles as secrets.

use std::collections::BTreeMap;

use clap::ValueEnum;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterApi;
use crate::kubeconfig::Kubeconfig;
use crate::Result;

/// Key under which a kubeconfig is stored in a credential secret.
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Handling of a failed delete of the previous secret.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum DeletePolicy {
    /// Only a missing secret is tolerated; any other failure aborts the publish.
    #[default]
    Strict,
    /// Failures are logged and the new secret is created regardless.
    BestEffort,
}

pub struct SecretPublisher<'a> {
    cluster: &'a dyn ClusterApi,
    policy: DeletePolicy,
}

impl<'a> SecretPublisher<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, policy: DeletePolicy) -> Self {
        Self { cluster, policy }
    }

    /// Replaces secret `name` in `namespace` with one holding `payload`.
    ///
    /// The old secret is deleted rather than patched so that no key of a
    /// previous credential survives a rotation.
    #[instrument(skip(self, payload))]
    pub async fn publish(&self, name: &str, namespace: &str, payload: &BTreeMap<String, String>) -> Result<()> {
        match self.cluster.delete_secret(namespace, name).await {
            Ok(()) => debug!("Deleted previous secret \"{}.{}\"", name, namespace),
            Err(e) if e.is_not_found() => debug!("Secret \"{}.{}\" does not exist yet", name, namespace),
            Err(e) if self.policy == DeletePolicy::BestEffort => {
                warn!("Could not delete secret \"{}.{}\", creating anyway: {}", name, namespace, e)
            }
            Err(e) => return Err(e),
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                payload
                    .iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.cluster.create_secret(namespace, &secret).await?;
        info!("Published secret \"{}\" in {}", name, namespace);
        Ok(())
    }

    /// Publishes `kubeconfig` under the `kubeconfig` key.
    pub async fn publish_kubeconfig(&self, name: &str, namespace: &str, kubeconfig: &Kubeconfig) -> Result<()> {
        let payload = BTreeMap::from([(KUBECONFIG_KEY.to_string(), kubeconfig.to_yaml()?)]);
        self.publish(name, namespace, &payload).await
    }
}
