use super::{AddonAction, AddonContext};
use crate::config::Settings;
use crate::errors::Result;
use crate::tools::Helm;
use k3sd_api::{CustomAddonConfig, HelmRepo};

use async_trait::async_trait;
use log;
use std::collections::BTreeMap;

/*
 * Where a manifest or a values file comes from.
 */
#[derive(Clone, Debug, PartialEq)]
pub enum Source {
    /* a file shipped with k3sd, looked up in the yamls search path */
    Asset(String),

    /* a file path or an http(s) URL, used as is */
    Location(String),
}

impl Source {

    pub fn resolve(&self, settings: &Settings) -> String {
	match self {
	    Source::Asset(name) => settings.resolve_yaml(name),
	    Source::Location(location) => location.clone(),
	}
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Readiness {
    pub deployment: String,
    pub namespace: String,
}

impl Readiness {

    pub fn new(deployment: &str, namespace: &str) -> Self {
	Self{
	    deployment: deployment.to_string(),
	    namespace: namespace.to_string(),
	}
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HelmRelease {
    pub release: String,
    pub repo: HelmRepo,
    pub chart: String,
    pub version: String,
    pub namespace: String,
    pub values: Option<Source>,
}

/*
 * AddonSpec describes an addon as data: the manifests to apply in order,
 * the substitutions to render them with, an optional Helm release and the
 * deployments that must become available afterwards.
 *
 * The descriptor entry of the addon can tune it: `path` replaces the first
 * manifest (or the Helm values file when there is no manifest) and `subs`
 * are merged over the built-in substitutions.
 */
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AddonSpec {
    pub manifests: Vec<Source>,

    /* substitute ${DOMAIN} and DOMAIN with the cluster domain */
    pub domain_subs: bool,

    pub subs: BTreeMap<String, String>,

    pub helm: Option<HelmRelease>,

    pub readiness: Vec<Readiness>,
}

pub fn domain_substitutions(domain: &str) -> BTreeMap<String, String> {
    let mut subs = BTreeMap::new();
    subs.insert(String::from("${DOMAIN}"), domain.to_string());
    subs.insert(String::from("DOMAIN"), domain.to_string());
    subs
}

impl AddonSpec {

    /*
     * Translates an operator defined addon. Incomplete parts (a manifest
     * without path, a chart without name or repository URL) are left out.
     */
    pub fn from_custom(name: &str, addon: &CustomAddonConfig) -> Self {
	let mut spec = AddonSpec::default();

	if let Some(manifest) = &addon.manifest {
	    if manifest.path.is_empty() {
		log::warn!("Custom addon {} has a manifest without path, ignoring it", name);
	    } else {
		spec.manifests.push(Source::Location(manifest.path.clone()));
		spec.subs = manifest.subs.clone().unwrap_or_default();
	    }
	}

	if let Some(helm) = &addon.helm {
	    if helm.chart.is_empty() || helm.repo.url.is_empty() {
		log::warn!("Custom addon {} has a Helm chart without name or repository URL, ignoring it", name);
	    } else {
		spec.helm = Some(HelmRelease{
		    release: name.to_string(),
		    repo: helm.repo.clone(),
		    chart: helm.chart.clone(),
		    version: helm.version.clone(),
		    namespace: helm.namespace().to_string(),
		    values: match helm.values_file.is_empty() {
			true => None,
			false => Some(Source::Location(helm.values_file.clone())),
		    },
		});
	    }
	}
	spec
    }

    fn path_override<'a>(&self, ctx: &'a AddonContext<'_>) -> Option<&'a str> {
	ctx.config
	    .and_then(|config| config.path.as_deref())
	    .filter(|path| !path.is_empty())
    }

    pub fn sources(&self, ctx: &AddonContext<'_>) -> Vec<String> {
	let mut sources: Vec<String> = self.manifests.iter()
	    .map(|source| source.resolve(ctx.settings))
	    .collect();

	if let (Some(path), Some(first)) = (self.path_override(ctx), sources.first_mut()) {
	    *first = path.to_string();
	}
	sources
    }

    pub fn values_file(&self, ctx: &AddonContext<'_>) -> Option<String> {
	let helm = self.helm.as_ref()?;

	match self.path_override(ctx) {
	    Some(path) if self.manifests.is_empty() => Some(path.to_string()),
	    _ => helm.values.as_ref().map(|source| source.resolve(ctx.settings)),
	}
    }

    pub fn substitutions(&self, ctx: &AddonContext<'_>) -> BTreeMap<String, String> {
	let mut subs = self.subs.clone();
	if self.domain_subs {
	    subs.extend(domain_substitutions(&ctx.cluster.domain));
	}
	if let Some(config) = ctx.config {
	    subs.extend(config.substitutions());
	}
	subs
    }
}

#[async_trait]
impl AddonAction for AddonSpec {
    async fn up(&self, ctx: &AddonContext<'_>) -> Result<()> {
	let subs = self.substitutions(ctx);

	for source in self.sources(ctx) {
	    let report = ctx.api.apply_manifest(ctx.kubeconfig, &source, &subs).await?;
	    log::info!("[{}] {}: {:?}", ctx.name, source, report);
	}

	if let Some(release) = &self.helm {
	    let helm = Helm::new(ctx.tools, ctx.settings.helm_atomic);
	    let values = self.values_file(ctx);

	    helm.repo_add(&release.repo).await?;
	    helm.repo_update().await?;
	    helm.upgrade_install(
		&release.release,
		&format!("{}/{}", release.repo.name, release.chart),
		ctx.kubeconfig,
		&release.namespace,
		&release.version,
		values.as_deref(),
	    ).await?;
	}

	// a slow rollout is reported but does not fail the addon
	for probe in &self.readiness {
	    if let Err(err) = ctx.api.wait_for_deployment(ctx.kubeconfig, &probe.deployment, &probe.namespace).await {
		log::warn!("[{}] {}", ctx.name, err);
	    }
	}
	Ok(())
    }

    async fn down(&self, ctx: &AddonContext<'_>) -> Result<()> {
	if let Some(release) = &self.helm {
	    let helm = Helm::new(ctx.tools, ctx.settings.helm_atomic);
	    helm.uninstall(&release.release, ctx.kubeconfig, &release.namespace).await?;
	}

	let subs = self.substitutions(ctx);
	for source in self.sources(ctx).iter().rev() {
	    let report = ctx.api.delete_manifest(ctx.kubeconfig, source, &subs).await?;
	    log::info!("[{}] {}: {:?}", ctx.name, source, report);
	}
	Ok(())
    }
}
