/*
 * Cluster addons: what gets installed on top of a bare k3s cluster.
 *
 * Every addon is an `AddonAction` with an `up` (install) and a `down`
 * (remove). The built-in ones are mostly declarative `AddonSpec`s; the few
 * steps that do not fit a manifest or a chart are decorators wrapping an
 * inner action.
 */
pub mod extras;
pub mod linkerd;
pub mod spec;

use crate::clusterapi::ClusterApi;
use crate::config::Settings;
use crate::errors::Result;
use crate::tools::ToolRunner;
use k3sd_api::{AddonConfig, Cluster, HelmRepo};

use async_trait::async_trait;
use extras::Ingress;
use linkerd::{CertificateChain, ControlPlane, Multicluster, SharedMesh};
use spec::{AddonSpec, HelmRelease, Readiness, Source};
use std::path::Path;

pub const CERT_MANAGER: &str = "cert-manager";
pub const TRAEFIK: &str = "traefik";
pub const CLUSTER_ISSUER: &str = "cluster-issuer";
pub const GITEA: &str = "gitea";
pub const PROMETHEUS: &str = "prometheus";
pub const LINKERD: &str = "linkerd";
pub const LINKERD_MC: &str = "linkerd-mc";

pub const CERT_MANAGER_RELEASE: &str = "https://github.com/cert-manager/cert-manager/releases/download/v1.17.2";

/*
 * Everything an addon action may need while running against one cluster.
 */
pub struct AddonContext<'a> {
    pub name: &'a str,
    pub cluster: &'a Cluster,

    /* the addon entry of the descriptor, absent for custom addons */
    pub config: Option<&'a AddonConfig>,

    pub kubeconfig: &'a Path,

    /* where per run artifacts (kubeconfigs, certificates) live */
    pub workdir: &'a Path,

    pub api: &'a dyn ClusterApi,
    pub tools: &'a dyn ToolRunner,
    pub settings: &'a Settings,
}

#[async_trait]
pub trait AddonAction: Send + Sync {
    async fn up(&self, ctx: &AddonContext<'_>) -> Result<()>;

    async fn down(&self, ctx: &AddonContext<'_>) -> Result<()>;
}

/*
 * The ordered table of built-in addons. Built once at startup and passed by
 * reference to whoever needs it.
 */
pub struct AddonRegistry {
    entries: Vec<(&'static str, Box<dyn AddonAction>)>,
}

impl AddonRegistry {

    pub fn new() -> Self {
	Self{
	    entries: Vec::new(),
	}
    }

    pub fn register(&mut self, name: &'static str, action: Box<dyn AddonAction>) {
	self.entries.push((name, action));
    }

    pub fn builtin() -> Self {
	let mut registry = Self::new();

	registry.register(CERT_MANAGER, Box::new(AddonSpec{
	    manifests: vec![
		Source::Location(format!("{}/cert-manager.yaml", CERT_MANAGER_RELEASE)),
		Source::Location(format!("{}/cert-manager.crds.yaml", CERT_MANAGER_RELEASE)),
	    ],
	    readiness: vec![
		Readiness::new("cert-manager", "cert-manager"),
		Readiness::new("cert-manager-cainjector", "cert-manager"),
		Readiness::new("cert-manager-webhook", "cert-manager"),
	    ],
	    ..Default::default()
	}));

	registry.register(TRAEFIK, Box::new(AddonSpec{
	    manifests: vec![Source::Asset(String::from("traefik-values.yaml"))],
	    readiness: vec![Readiness::new("traefik", "kube-system")],
	    ..Default::default()
	}));

	registry.register(CLUSTER_ISSUER, Box::new(AddonSpec{
	    manifests: vec![Source::Asset(String::from("clusterissuer.yaml"))],
	    domain_subs: true,
	    ..Default::default()
	}));

	registry.register(GITEA, Box::new(Ingress{
	    inner: Box::new(AddonSpec{
		manifests: vec![Source::Asset(String::from("gitea.yaml"))],
		readiness: vec![Readiness::new("gitea", "default")],
		..Default::default()
	    }),
	    manifest: Source::Asset(String::from("gitea.ingress.yaml")),
	}));

	registry.register(PROMETHEUS, Box::new(AddonSpec{
	    helm: Some(HelmRelease{
		release: String::from("kube-prom-stack"),
		repo: HelmRepo{
		    name: String::from("prometheus-community"),
		    url: String::from("https://prometheus-community.github.io/helm-charts"),
		},
		chart: String::from("kube-prometheus-stack"),
		version: String::from("35.5.1"),
		namespace: String::from("monitoring"),
		values: Some(Source::Asset(String::from("prom-stack-values.yaml"))),
	    }),
	    ..Default::default()
	}));

	registry.register(LINKERD, Box::new(SharedMesh{
	    inner: Box::new(CertificateChain{
		inner: Box::new(ControlPlane),
	    }),
	    peer: LINKERD_MC,
	}));

	registry.register(LINKERD_MC, Box::new(Multicluster{
	    inner: Box::new(CertificateChain{
		inner: Box::new(ControlPlane),
	    }),
	}));

	registry
    }

    pub fn names(&self) -> Vec<&'static str> {
	self.entries.iter().map(|(name, _)| *name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn AddonAction> {
	self.entries.iter()
	    .find(|(entry, _)| *entry == name)
	    .map(|(_, action)| action.as_ref())
    }
}

impl Default for AddonRegistry {
    fn default() -> Self {
	Self::builtin()
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use crate::clusterapi::fake::FakeClusterApi;
    use crate::tools::fake::FakeTools;
    use std::path::PathBuf;

    /*
     * Owns what an AddonContext borrows.
     */
    pub struct Harness {
	pub cluster: Cluster,
	pub config: Option<AddonConfig>,
	pub kubeconfig: PathBuf,
	pub workdir: tempfile::TempDir,
	pub api: FakeClusterApi,
	pub tools: FakeTools,
	pub settings: Settings,
    }

    impl Harness {
	pub fn new(cluster: Cluster) -> Self {
	    let workdir = tempfile::tempdir().unwrap();
	    Self{
		kubeconfig: workdir.path().join(format!("{}.yaml", cluster.node_name())),
		cluster: cluster,
		config: None,
		workdir: workdir,
		api: FakeClusterApi::default(),
		tools: FakeTools::default(),
		settings: Settings{
		    yamls_path: Some(PathBuf::from("assets")),
		    ..Default::default()
		},
	    }
	}

	pub fn ctx<'a>(&'a self, name: &'a str) -> AddonContext<'a> {
	    AddonContext{
		name: name,
		cluster: &self.cluster,
		config: self.config.as_ref(),
		kubeconfig: &self.kubeconfig,
		workdir: self.workdir.path(),
		api: &self.api,
		tools: &self.tools,
		settings: &self.settings,
	    }
	}
    }
}
