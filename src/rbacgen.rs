use clap::Parser;

use trust::rbac::{control_plane_grant, namespace_grant, AgentAccess, AgentKind, Manifest};

/// Prints the RBAC objects of a bootstrap as a multi-document YAML stream.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Namespace hosting an application agent
    #[arg(long = "application")]
    application: Vec<String>,

    /// Namespace hosting a service agent
    #[arg(long = "service")]
    service: Vec<String>,
}

impl Cli {
    fn manifests(&self) -> Vec<Manifest> {
        let agents = self
            .application
            .iter()
            .map(|ns| (ns, AgentKind::Application))
            .chain(self.service.iter().map(|ns| (ns, AgentKind::Service)));

        let mut manifests = control_plane_grant().manifests();
        for (namespace, kind) in agents {
            manifests.extend(AgentAccess::new(kind, namespace).manifests());
            manifests.extend(namespace_grant(namespace).manifests());
        }
        manifests
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    for manifest in cli.manifests() {
        print!("---\n{}", serde_yaml::to_string(&manifest)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_accept_both_flag_forms() {
        let cli = Cli::try_parse_from(["rbacgen", "--application=apps", "--service", "svcs", "--application", "more-apps"])
            .unwrap();
        assert_eq!(cli.application, ["apps", "more-apps"]);
        assert_eq!(cli.service, ["svcs"]);
    }

    #[test]
    fn help_is_not_an_unexpected_argument() {
        let err = Cli::try_parse_from(["rbacgen", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn every_agent_namespace_gets_its_objects() {
        let cli = Cli::try_parse_from(["rbacgen", "--application", "apps", "--service", "svcs"]).unwrap();
        let control_plane = control_plane_grant().manifests().len();
        let per_agent = AgentAccess::new(AgentKind::Application, "apps").manifests().len()
            + namespace_grant("apps").manifests().len();

        assert_eq!(cli.manifests().len(), control_plane + 2 * per_agent);
    }
}
