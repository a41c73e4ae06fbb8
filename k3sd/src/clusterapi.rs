/*
 * Everything k3sd asks from a running cluster, behind one trait so the
 * orchestrator can be exercised without an API server.
 */
use crate::errors::{Error, Result};
use crate::kubeconfig;
use crate::manifest::{self, ApplyReport, KubeTarget, Operation};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment as KubeDeployment;
use k8s_openapi::api::core::v1::Node as KubeNode;
use kube::Api as KubeApi;
use kube::api::Patch as KubePatch;
use kube::api::PatchParams as KubePatchParams;
use log;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /*
     * Renders the manifest at `source` (file or URL) and creates its objects.
     */
    async fn apply_manifest(&self, kubeconfig: &Path, source: &str, subs: &BTreeMap<String, String>) -> Result<ApplyReport>;

    async fn delete_manifest(&self, kubeconfig: &Path, source: &str, subs: &BTreeMap<String, String>) -> Result<ApplyReport>;

    /*
     * Creates the objects printed by a command, as they come.
     */
    async fn apply_command(&self, kubeconfig: &Path, program: &str, args: &[String]) -> Result<ApplyReport>;

    async fn delete_command(&self, kubeconfig: &Path, program: &str, args: &[String]) -> Result<ApplyReport>;

    /*
     * Blocks until the deployment reports Available, or fails with
     * `Error::Timeout`.
     */
    async fn wait_for_deployment(&self, kubeconfig: &Path, name: &str, namespace: &str) -> Result<()>;

    async fn label_node(&self, kubeconfig: &Path, node: &str, labels: &BTreeMap<String, String>) -> Result<()>;
}

/*
 * Polls `check` until it answers true. Errors from `check` are retried.
 */
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();

    loop {
	match check().await {
	    Ok(true) => return Ok(()),
	    Ok(false) => log::debug!("Still waiting for {}", what),
	    Err(err) => log::debug!("Still waiting for {}: {}", what, err),
	}

	if start.elapsed() >= timeout {
	    return Err(Error::Timeout(format!("{} after {:?}", what, timeout)));
	}
	tokio::time::sleep(interval).await;
    }
}

pub fn deployment_ready(deployment: &KubeDeployment) -> bool {
    let conditions = deployment.status.as_ref().and_then(|status| status.conditions.as_ref());

    match conditions {
	Some(conditions) => conditions.iter().any(|c| c.type_ == "Available" && c.status == "True"),
	None => false,
    }
}

/*
 * KubeClusterApi talks to the clusters through their kubeconfig files. One
 * client and one discovery cache are kept per kubeconfig for the whole run.
 */
pub struct KubeClusterApi {
    targets: Mutex<HashMap<PathBuf, Arc<KubeTarget>>>,
    rollout_timeout: Duration,
    poll_interval: Duration,
}

impl KubeClusterApi {

    pub fn new(rollout_timeout: Duration, poll_interval: Duration) -> Self {
	Self{
	    targets: Mutex::new(HashMap::new()),
	    rollout_timeout: rollout_timeout,
	    poll_interval: poll_interval,
	}
    }

    async fn target(&self, kubeconfig: &Path) -> Result<Arc<KubeTarget>> {
	let mut targets = self.targets.lock().await;
	if let Some(target) = targets.get(kubeconfig) {
	    return Ok(target.clone());
	}

	log::debug!("Connecting to the cluster of {}", kubeconfig.display());
	let client = kubeconfig::client_for(kubeconfig).await?;
	let target = Arc::new(KubeTarget::new(client).await?);
	targets.insert(kubeconfig.to_path_buf(), target.clone());

	Ok(target)
    }

    async fn manifest(&self, op: Operation, kubeconfig: &Path, source: &str, subs: &BTreeMap<String, String>) -> Result<ApplyReport> {
	let target = self.target(kubeconfig).await?;
	let docs = manifest::render(source, subs).await?;
	target.begin_manifest();

	log::info!("{:?} {} ({} documents)", op, source, docs.len());
	Ok(manifest::process_documents(target.as_ref(), op, &docs).await)
    }

    async fn command(&self, op: Operation, kubeconfig: &Path, program: &str, args: &[String]) -> Result<ApplyReport> {
	let target = self.target(kubeconfig).await?;
	let tool_error = |output: String| Error::Tool{ tool: program.to_string(), output: output };

	log::info!("$ {} {} ({:?})", program, args.join(" "), op);
	let mut child = Command::new(program)
	    .args(args)
	    .stdout(Stdio::piped())
	    .stderr(Stdio::piped())
	    .kill_on_drop(true)
	    .spawn()
	    .map_err(|err| tool_error(err.to_string()))?;

	let stdout = child.stdout.take().ok_or_else(|| tool_error(String::from("no stdout")))?;
	let stderr = child.stderr.take().ok_or_else(|| tool_error(String::from("no stderr")))?;

	let name = program.to_string();
	let errors = tokio::spawn(async move {
	    let mut collected = String::new();
	    let mut lines = BufReader::new(stderr).lines();
	    while let Ok(Some(line)) = lines.next_line().await {
		log::debug!("[{}] {}", name, line);
		collected.push_str(&line);
		collected.push('\n');
	    }
	    collected
	});

	target.begin_manifest();
	let report = manifest::process_stream(target.as_ref(), op, BufReader::new(stdout)).await?;
	let status = child.wait().await?;
	let errors = errors.await.unwrap_or_default();

	if !status.success() {
	    return Err(tool_error(errors));
	}
	Ok(report)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn apply_manifest(&self, kubeconfig: &Path, source: &str, subs: &BTreeMap<String, String>) -> Result<ApplyReport> {
	self.manifest(Operation::Create, kubeconfig, source, subs).await
    }

    async fn delete_manifest(&self, kubeconfig: &Path, source: &str, subs: &BTreeMap<String, String>) -> Result<ApplyReport> {
	self.manifest(Operation::Delete, kubeconfig, source, subs).await
    }

    async fn apply_command(&self, kubeconfig: &Path, program: &str, args: &[String]) -> Result<ApplyReport> {
	self.command(Operation::Create, kubeconfig, program, args).await
    }

    async fn delete_command(&self, kubeconfig: &Path, program: &str, args: &[String]) -> Result<ApplyReport> {
	self.command(Operation::Delete, kubeconfig, program, args).await
    }

    async fn wait_for_deployment(&self, kubeconfig: &Path, name: &str, namespace: &str) -> Result<()> {
	let target = self.target(kubeconfig).await?;
	let deployments: KubeApi<KubeDeployment> = KubeApi::namespaced(target.client(), namespace);
	let what = format!("deployment {}/{}", namespace, name);

	poll_until(self.rollout_timeout, self.poll_interval, &what, || {
	    let deployments = deployments.clone();
	    async move {
		let ready = match deployments.get_opt(name).await? {
		    Some(deployment) => deployment_ready(&deployment),
		    None => false,
		};
		Ok::<bool, Error>(ready)
	    }
	}).await?;

	log::info!("Deployment {}/{} is available", namespace, name);
	Ok(())
    }

    async fn label_node(&self, kubeconfig: &Path, node: &str, labels: &BTreeMap<String, String>) -> Result<()> {
	if labels.is_empty() {
	    return Ok(());
	}

	let target = self.target(kubeconfig).await?;
	let nodes: KubeApi<KubeNode> = KubeApi::all(target.client());

	// a node that just joined takes a moment to register
	let what = format!("node {}", node);
	poll_until(self.rollout_timeout, self.poll_interval, &what, || {
	    let nodes = nodes.clone();
	    async move { Ok::<bool, Error>(nodes.get_opt(node).await?.is_some()) }
	}).await?;

	let patch = serde_json::json!({
	    "metadata": {
		"labels": labels,
	    }
	});
	nodes.patch(node, &KubePatchParams::default(), &KubePatch::Merge(&patch)).await?;

	log::info!("Labeled node {} with {:?}", node, labels);
	Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /*
     * Records every call as a readable line, e.g.
     * "apply yamls/gitea.yaml" or "wait default/gitea".
     */
    #[derive(Default, Clone)]
    pub struct FakeClusterApi {
	pub log: Arc<StdMutex<Vec<String>>>,
	pub subs: Arc<StdMutex<Vec<BTreeMap<String, String>>>>,
	pub failing: Vec<String>,
    }

    impl FakeClusterApi {
	pub fn calls(&self) -> Vec<String> {
	    self.log.lock().unwrap().clone()
	}

	fn record(&self, line: String) -> Result<()> {
	    self.log.lock().unwrap().push(line.clone());

	    if self.failing.iter().any(|prefix| line.starts_with(prefix.as_str())) {
		return Err(Error::Other(format!("{} failed", line)));
	    }
	    Ok(())
	}
    }

    #[async_trait]
    impl ClusterApi for FakeClusterApi {
	async fn apply_manifest(&self, _kubeconfig: &Path, source: &str, subs: &BTreeMap<String, String>) -> Result<ApplyReport> {
	    self.subs.lock().unwrap().push(subs.clone());
	    self.record(format!("apply {}", source))?;
	    Ok(ApplyReport::default())
	}

	async fn delete_manifest(&self, _kubeconfig: &Path, source: &str, _subs: &BTreeMap<String, String>) -> Result<ApplyReport> {
	    self.record(format!("delete {}", source))?;
	    Ok(ApplyReport::default())
	}

	async fn apply_command(&self, _kubeconfig: &Path, program: &str, args: &[String]) -> Result<ApplyReport> {
	    self.record(format!("apply $ {} {}", program, args.join(" ")))?;
	    Ok(ApplyReport::default())
	}

	async fn delete_command(&self, _kubeconfig: &Path, program: &str, args: &[String]) -> Result<ApplyReport> {
	    self.record(format!("delete $ {} {}", program, args.join(" ")))?;
	    Ok(ApplyReport::default())
	}

	async fn wait_for_deployment(&self, _kubeconfig: &Path, name: &str, namespace: &str) -> Result<()> {
	    self.record(format!("wait {}/{}", namespace, name))
	}

	async fn label_node(&self, _kubeconfig: &Path, node: &str, labels: &BTreeMap<String, String>) -> Result<()> {
	    let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
	    self.record(format!("label {} {}", node, labels.join(",")))
	}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn deployment(conditions: serde_json::Value) -> KubeDeployment {
	serde_json::from_value(serde_json::json!({
	    "metadata": { "name": "gitea", "namespace": "default" },
	    "status": { "conditions": conditions },
	})).unwrap()
    }

    #[test]
    fn deployment_is_ready_when_available() {
	let available = deployment(serde_json::json!([
	    { "type": "Progressing", "status": "True" },
	    { "type": "Available", "status": "True" },
	]));
	let unavailable = deployment(serde_json::json!([
	    { "type": "Available", "status": "False" },
	]));

	assert!(deployment_ready(&available));
	assert!(!deployment_ready(&unavailable));
	assert!(!deployment_ready(&KubeDeployment::default()));
    }

    #[tokio::test]
    async fn poll_until_retries_errors() {
	let attempts = AtomicUsize::new(0);

	poll_until(Duration::from_secs(5), Duration::from_millis(1), "test", || {
	    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
	    async move {
		match attempt {
		    0 => Err(Error::Other(String::from("not yet"))),
		    1 => Ok(false),
		    _ => Ok(true),
		}
	    }
	}).await.unwrap();

	assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_times_out() {
	let result = poll_until(Duration::from_millis(5), Duration::from_millis(1), "never", || async { Ok::<bool, Error>(false) }).await;

	assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
