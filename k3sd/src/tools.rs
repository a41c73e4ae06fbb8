/*
 * Local command line tools (helm, step, linkerd) driven as opaque
 * subprocesses.
 */
use crate::errors::{Error, Result};
use k3sd_api::HelmRepo;

use async_trait::async_trait;
use log;
use std::path::Path;
use tokio::process::Command;

pub const HELM: &str = "helm";
pub const HELM_TIMEOUT: &str = "600s";

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /*
     * Runs `program` to completion and returns its stdout.
     */
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

pub struct SystemTools;

#[async_trait]
impl ToolRunner for SystemTools {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
	log::info!("$ {} {}", program, args.join(" "));

	let output = Command::new(program)
	    .args(args)
	    .output()
	    .await
	    .map_err(|err| Error::Tool{ tool: program.to_string(), output: err.to_string() })?;

	let stdout = String::from_utf8_lossy(&output.stdout).to_string();
	let stderr = String::from_utf8_lossy(&output.stderr).to_string();
	for line in stderr.lines() {
	    log::debug!("[{}] {}", program, line);
	}

	if !output.status.success() {
	    return Err(Error::Tool{
		tool: program.to_string(),
		output: format!("{}{}", stdout, stderr),
	    });
	}
	Ok(stdout)
    }
}

pub fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/*
 * Thin Helm client: repository management and release install/removal.
 */
pub struct Helm<'a> {
    tools: &'a dyn ToolRunner,
    atomic: bool,
}

impl<'a> Helm<'a> {

    pub fn new(tools: &'a dyn ToolRunner, atomic: bool) -> Self {
	Self{
	    tools: tools,
	    atomic: atomic,
	}
    }

    pub async fn repo_add(&self, repo: &HelmRepo) -> Result<()> {
	match self.tools.run(HELM, &args(&["repo", "add", &repo.name, &repo.url])).await {
	    Ok(_) => Ok(()),
	    Err(Error::Tool{ output, .. }) if output.contains("already exists") => {
		log::debug!("Helm repository {} is already known", repo.name);
		Ok(())
	    }
	    Err(err) => Err(err),
	}
    }

    pub async fn repo_update(&self) -> Result<()> {
	self.tools.run(HELM, &args(&["repo", "update"])).await?;
	Ok(())
    }

    /*
     * helm upgrade --install of `repo/chart` as `release`.
     */
    pub async fn upgrade_install(
	&self,
	release: &str,
	chart: &str,
	kubeconfig: &Path,
	namespace: &str,
	version: &str,
	values_file: Option<&str>,
    ) -> Result<()> {
	let kubeconfig = kubeconfig.to_string_lossy();
	let mut argv = args(&[
	    "upgrade", "--install", release, chart,
	    "--kubeconfig", &kubeconfig,
	    "--namespace", namespace,
	]);
	if !version.is_empty() {
	    argv.extend(args(&["--version", version]));
	}
	argv.extend(args(&["--create-namespace", "--wait", "--timeout", HELM_TIMEOUT]));
	if self.atomic {
	    argv.push(String::from("--atomic"));
	}
	if let Some(values) = values_file {
	    argv.extend(args(&["-f", values]));
	}

	self.tools.run(HELM, &argv).await?;
	log::info!("Helm release {} deployed in {}", release, namespace);
	Ok(())
    }

    pub async fn uninstall(&self, release: &str, kubeconfig: &Path, namespace: &str) -> Result<()> {
	let kubeconfig = kubeconfig.to_string_lossy();
	let argv = args(&["uninstall", release, "--kubeconfig", &kubeconfig, "--namespace", namespace]);

	match self.tools.run(HELM, &argv).await {
	    Ok(_) => Ok(()),
	    Err(Error::Tool{ output, .. }) if output.contains("not found") => {
		log::debug!("Helm release {} is not installed", release);
		Ok(())
	    }
	    Err(err) => Err(err),
	}
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::{Arc, Mutex};

    /*
     * Records every invocation as a single "program arg arg ..." line.
     */
    #[derive(Default, Clone)]
    pub struct FakeTools {
	pub log: Arc<Mutex<Vec<String>>>,
	pub responses: BTreeMap<String, String>,
	pub failing: BTreeMap<String, String>,
	pub missing: HashSet<String>,
    }

    impl FakeTools {
	pub fn calls(&self) -> Vec<String> {
	    self.log.lock().unwrap().clone()
	}
    }

    #[async_trait]
    impl ToolRunner for FakeTools {
	async fn run(&self, program: &str, args: &[String]) -> Result<String> {
	    let line = format!("{} {}", program, args.join(" "));
	    self.log.lock().unwrap().push(line.clone());

	    if self.missing.contains(program) {
		return Err(Error::Tool{ tool: program.to_string(), output: String::from("not installed") });
	    }
	    if let Some((_, output)) = self.failing.iter().find(|(prefix, _)| line.starts_with(prefix.as_str())) {
		return Err(Error::Tool{ tool: program.to_string(), output: output.clone() });
	    }
	    Ok(self.responses.iter()
	       .find(|(prefix, _)| line.starts_with(prefix.as_str()))
	       .map(|(_, out)| out.clone())
	       .unwrap_or_default())
	}
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeTools;
    use super::*;

    fn repo() -> HelmRepo {
	HelmRepo{
	    name: String::from("prometheus-community"),
	    url: String::from("https://prometheus-community.github.io/helm-charts"),
	}
    }

    #[tokio::test]
    async fn repo_add_tolerates_known_repositories() {
	let mut tools = FakeTools::default();
	tools.failing.insert(String::from("helm repo add"), String::from("Error: repository name (prometheus-community) already exists"));

	Helm::new(&tools, false).repo_add(&repo()).await.unwrap();

	tools.failing.insert(String::from("helm repo add"), String::from("Error: looks like the url is not valid"));
	assert!(Helm::new(&tools, false).repo_add(&repo()).await.is_err());
    }

    #[tokio::test]
    async fn upgrade_install_arguments() {
	let tools = FakeTools::default();
	let helm = Helm::new(&tools, true);

	helm.upgrade_install(
	    "kube-prom-stack",
	    "prometheus-community/kube-prometheus-stack",
	    Path::new("/tmp/k.yaml"),
	    "monitoring",
	    "35.5.1",
	    Some("values.yaml"),
	).await.unwrap();

	assert_eq!(tools.calls(), vec![
	    "helm upgrade --install kube-prom-stack prometheus-community/kube-prometheus-stack \
	     --kubeconfig /tmp/k.yaml --namespace monitoring --version 35.5.1 \
	     --create-namespace --wait --timeout 600s --atomic -f values.yaml",
	]);
    }

    #[tokio::test]
    async fn uninstall_tolerates_missing_release() {
	let mut tools = FakeTools::default();
	tools.failing.insert(String::from("helm uninstall"), String::from("Error: uninstall: Release not loaded: x: release: not found"));

	Helm::new(&tools, false).uninstall("x", Path::new("/tmp/k.yaml"), "default").await.unwrap();
    }
}
