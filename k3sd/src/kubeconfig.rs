use crate::errors::{Error, Result};
use crate::remote::{self, Session};
use k3sd_api::Cluster;

use kube::Client as KubeClient;
use kube::Config as KubeConfig;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use log;
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};

/* where k3s writes the admin kubeconfig on the master */
pub const REMOTE_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";

/* the API server address embedded by k3s */
pub const LOOPBACK: &str = "127.0.0.1";

/*
 * Reads the kubeconfig generated by k3s on a freshly bootstrapped node.
 */
pub async fn fetch(session: &dyn Session) -> Result<String> {
    let raw = remote::run_quiet(session, &format!("cat {}", REMOTE_KUBECONFIG)).await?;
    if raw.trim().is_empty() {
	return Err(Error::Kubeconfig(format!("{} is empty on {}", REMOTE_KUBECONFIG, session.address())));
    }
    Ok(raw)
}

/*
 * Points the kubeconfig to the node's reachable address instead of the
 * loopback one.
 */
pub fn patch(raw: &str, address: &str) -> String {
    raw.replace(LOOPBACK, address)
}

/*
 * Renames the single cluster, user and context entries of a fresh k3s
 * kubeconfig (all called "default") so several of them can later be merged
 * without collisions.
 */
pub fn rename_context(raw: &str, context: &str) -> Result<String> {
    let mut doc: Value = serde_yaml::from_str(raw)?;

    for section in ["clusters", "users", "contexts"] {
	let entries = match doc.get_mut(section).and_then(|v| v.as_sequence_mut()) {
	    Some(entries) => entries,
	    None => {
		return Err(Error::Kubeconfig(format!("kubeconfig has no `{}` section", section)));
	    }
	};
	if entries.len() != 1 {
	    let errmsg = format!("expected a single entry in `{}`, found {}", section, entries.len());
	    return Err(Error::Kubeconfig(errmsg));
	}
	entries[0]["name"] = Value::from(context);

	if section == "contexts" {
	    if let Some(ctx) = entries[0].get_mut("context") {
		ctx["cluster"] = Value::from(context);
		ctx["user"] = Value::from(context);
	    }
	}
    }
    doc["current-context"] = Value::from(context);

    Ok(serde_yaml::to_string(&doc)?)
}

/*
 * KubeconfigStore keeps the kubeconfigs captured during one run under
 * `<base>/<run id>/<node name>.yaml`.
 */
#[derive(Clone, Debug)]
pub struct KubeconfigStore {
    dir: PathBuf,
}

impl KubeconfigStore {

    pub fn new(base: &Path, run_id: &str) -> Self {
	Self{
	    dir: base.join(run_id),
	}
    }

    pub fn dir(&self) -> &Path {
	self.dir.as_path()
    }

    pub fn path_for(&self, node_name: &str) -> PathBuf {
	self.dir.join(format!("{}.yaml", node_name))
    }

    pub fn save(&self, node_name: &str, content: &str) -> Result<PathBuf> {
	fs::create_dir_all(&self.dir)?;

	let path = self.path_for(node_name);
	fs::write(&path, content)?;
	Ok(path)
    }

    /*
     * Fetches, patches and persists the master kubeconfig of `cluster`,
     * renaming its context when the descriptor asks for one.
     */
    pub async fn capture(&self, session: &dyn Session, cluster: &Cluster) -> Result<PathBuf> {
	let raw = fetch(session).await?;
	let mut kubeconfig = patch(&raw, cluster.address());

	if !cluster.context.is_empty() {
	    kubeconfig = rename_context(&kubeconfig, &cluster.context)?;
	}

	let path = self.save(cluster.node_name(), &kubeconfig)?;
	log::info!("Saved kubeconfig for {} to {}", cluster.address(), path.display());
	Ok(path)
    }
}

/*
 * Builds a kube client out of a kubeconfig file.
 */
pub async fn client_for(path: &Path) -> Result<KubeClient> {
    let content = fs::read_to_string(path)?;
    let kubeconfig = Kubeconfig::from_yaml(&content)
	.map_err(|err| Error::Kubeconfig(format!("{}: {}", path.display(), err)))?;
    let config = KubeConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
	.await
	.map_err(|err| Error::Kubeconfig(format!("{}: {}", path.display(), err)))?;

    Ok(KubeClient::try_from(config)?)
}
