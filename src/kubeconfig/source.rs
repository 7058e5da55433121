//! Where administrator kubeconfigs come from.
//!
//! A worker cluster is reachable on two endpoints: the one published to the
//! host running the bootstrap, and the one other clusters' workloads use.
//! `internal = true` selects the latter.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::kubeconfig::Kubeconfig;
use crate::{Error, Result};

#[async_trait]
pub trait KubeconfigSource: Send + Sync {
    async fn admin_kubeconfig(&self, internal: bool) -> Result<Kubeconfig>;
}

/// A cluster created by `kind`.
#[derive(Clone, Debug)]
pub struct KindCluster {
    pub name: String,
}

impl KindCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn arguments(&self, internal: bool) -> Vec<String> {
        let mut args = vec!["get".to_string(), "kubeconfig".to_string(), "--name".to_string(), self.name.clone()];
        if internal {
            args.push("--internal".to_string());
        }
        args
    }
}

#[async_trait]
impl KubeconfigSource for KindCluster {
    async fn admin_kubeconfig(&self, internal: bool) -> Result<Kubeconfig> {
        debug!("Reading kubeconfig of kind cluster \"{}\" (internal: {})", self.name, internal);
        let output = Command::new("kind").args(self.arguments(internal)).output().await?;
        if !output.status.success() {
            return Err(Error::SourceError(format!(
                "kind get kubeconfig for \"{}\" exited with {}: {}",
                self.name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let text = String::from_utf8(output.stdout).map_err(|e| Error::SourceError(e.to_string()))?;
        Kubeconfig::from_yaml(&text)
    }
}

/// A kubeconfig file, optionally paired with the server URL reachable from
/// inside the cluster network.
#[derive(Clone, Debug)]
pub struct StaticKubeconfig {
    pub path: PathBuf,
    pub internal_server: Option<String>,
}

impl StaticKubeconfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            internal_server: None,
        }
    }

    pub fn with_internal_server(mut self, server: impl Into<String>) -> Self {
        self.internal_server = Some(server.into());
        self
    }
}

fn use_server(mut kubeconfig: Kubeconfig, server: &str) -> Kubeconfig {
    for cluster in &mut kubeconfig.clusters {
        cluster.cluster.server = server.to_string();
    }
    kubeconfig
}

#[async_trait]
impl KubeconfigSource for StaticKubeconfig {
    async fn admin_kubeconfig(&self, internal: bool) -> Result<Kubeconfig> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let kubeconfig = Kubeconfig::from_yaml(&text)?;
        match (internal, &self.internal_server) {
            (false, _) => Ok(kubeconfig),
            (true, Some(server)) => Ok(use_server(kubeconfig, server)),
            (true, None) => Err(Error::SourceError(format!(
                "no internal server configured for {}",
                self.path.display()
            ))),
        }
    }
}
