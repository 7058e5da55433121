use std::io;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use kube::Client;
use tracing::{info, warn};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use trust::bootstrap::{BootstrapPlan, WorkerCluster};
use trust::cluster::KubeCluster;
use trust::kubeconfig::source::{KindCluster, KubeconfigSource, StaticKubeconfig};
use trust::kubeconfig::Kubeconfig;
use trust::rbac::AgentKind;
use trust::settings::Settings;

/// Establishes trust between the primaza control plane and a worker cluster.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Name of the kind cluster acting as worker
    #[arg(long, conflicts_with = "kubeconfig", required_unless_present = "kubeconfig")]
    kind_cluster: Option<String>,

    /// Administrator kubeconfig of the worker cluster
    #[arg(long, env = "WORKER_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Worker API server URL as reachable from the control plane
    #[arg(long, requires = "kubeconfig")]
    internal_server: Option<String>,

    /// Namespace of the control plane receiving the worker kubeconfig
    #[arg(long, env = "PRIMAZA_NAMESPACE", default_value = "primaza-system")]
    primaza_namespace: String,

    /// Name of the secret holding the worker kubeconfig
    #[arg(long, default_value = "primaza-kubeconfig-worker")]
    secret_name: String,

    /// Kubeconfig of the control plane, published to every agent namespace
    #[arg(long)]
    cluster_context: Option<PathBuf>,

    #[arg(long = "application-namespace")]
    application_namespaces: Vec<String>,

    #[arg(long = "service-namespace")]
    service_namespaces: Vec<String>,

    #[command(flatten)]
    settings: Settings,
}

impl Cli {
    fn source(&self) -> Box<dyn KubeconfigSource> {
        match (&self.kind_cluster, &self.kubeconfig) {
            (Some(name), _) => Box::new(KindCluster::new(name)),
            (None, path) => {
                let mut source = StaticKubeconfig::new(path.clone().unwrap_or_default());
                if let Some(server) = &self.internal_server {
                    source = source.with_internal_server(server);
                }
                Box::new(source)
            }
        }
    }

    fn has_internal_endpoint(&self) -> bool {
        self.kind_cluster.is_some() || self.internal_server.is_some()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let collector = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .json()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    collector.init();

    let cli = Cli::parse();
    let source = cli.source();

    let admin = source.admin_kubeconfig(false).await.context("reading worker kubeconfig")?;
    let base = if cli.has_internal_endpoint() {
        source.admin_kubeconfig(true).await.context("reading internal worker kubeconfig")?
    } else {
        admin.clone()
    };
    let cluster_context = match &cli.cluster_context {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            Some(Kubeconfig::from_yaml(&text)?)
        }
        None => None,
    };

    let worker_api = KubeCluster::new(admin.client().await?);
    let worker = WorkerCluster::new(&worker_api, cli.settings.clone());
    let plan = BootstrapPlan {
        base,
        application: cli.application_namespaces.clone(),
        service: cli.service_namespaces.clone(),
        cluster_context,
    };
    let (identity, kubeconfig) = worker.bootstrap(&plan).await?;

    let control_plane_api = KubeCluster::new(Client::try_default().await?);
    WorkerCluster::new(&control_plane_api, cli.settings.clone())
        .publish_cluster_context(&cli.secret_name, &kubeconfig, &cli.primaza_namespace)
        .await?;
    info!(
        "Published kubeconfig of identity {} as {}/{}",
        identity.name(),
        cli.primaza_namespace,
        cli.secret_name
    );

    let agents = plan
        .application
        .iter()
        .map(|ns| (ns, AgentKind::Application))
        .chain(plan.service.iter().map(|ns| (ns, AgentKind::Service)));
    for (namespace, kind) in agents {
        if !worker.is_agent_deployed(namespace, kind).await? {
            warn!("No {} agent deployed in {} yet", kind.name(), namespace);
        }
    }

    Ok(())
}
