/*
 * Linkerd service mesh: certificate chain, control plane, multicluster
 * extension and the links between clusters. Everything goes through the
 * `step` and `linkerd` CLIs; what `linkerd` prints is applied (or deleted)
 * with the manifest engine.
 */
use super::{AddonAction, AddonContext};
use crate::clusterapi::ClusterApi;
use crate::errors::Result;
use crate::manifest::ApplyReport;
use crate::tools::{args, ToolRunner};

use async_trait::async_trait;
use log;
use std::path::{Path, PathBuf};

pub const LINKERD_CLI: &str = "linkerd";
pub const STEP_CLI: &str = "step";

const IDENTITY: &str = "identity.linkerd.cluster.local";
const CERT_VALIDITY: &str = "438000h";
const API_SERVER_PORT: u16 = 6443;

/* trust anchor shared by every cluster of a run, so linked meshes trust each other */
pub fn root_paths(workdir: &Path) -> (PathBuf, PathBuf) {
    (workdir.join("ca.crt"), workdir.join("ca.key"))
}

pub fn issuer_paths(workdir: &Path, node_name: &str) -> (PathBuf, PathBuf) {
    (
	workdir.join(format!("{}-issuer.crt", node_name)),
	workdir.join(format!("{}-issuer.key", node_name)),
    )
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/*
 * Runs a linkerd health check. Checks only inform: their failure is logged.
 */
async fn check(tools: &dyn ToolRunner, argv: Vec<String>) {
    match tools.run(LINKERD_CLI, &argv).await {
	Ok(output) => {
	    for line in output.lines() {
		log::debug!("[linkerd] {}", line);
	    }
	}
	Err(err) => log::warn!("linkerd {} reported problems: {}", argv.join(" "), err),
    }
}

/*
 * Creates the root CA (once per run directory) and the issuer certificate
 * of the cluster before running the inner action.
 */
pub struct CertificateChain {
    pub inner: Box<dyn AddonAction>,
}

impl CertificateChain {

    async fn ensure_root(&self, ctx: &AddonContext<'_>) -> Result<()> {
	let (crt, key) = root_paths(ctx.workdir);
	if crt.exists() && key.exists() {
	    log::info!("Root CA {} already exists", crt.display());
	    return Ok(());
	}

	let argv = args(&[
	    "certificate", "create", IDENTITY, &display(&crt), &display(&key),
	    "--profile", "root-ca",
	    "--no-password", "--insecure", "--force",
	    "--not-after", CERT_VALIDITY,
	]);
	ctx.tools.run(STEP_CLI, &argv).await?;
	Ok(())
    }

    async fn issue(&self, ctx: &AddonContext<'_>) -> Result<()> {
	let (ca_crt, ca_key) = root_paths(ctx.workdir);
	let (crt, key) = issuer_paths(ctx.workdir, ctx.cluster.node_name());

	let argv = args(&[
	    "certificate", "create", IDENTITY, &display(&crt), &display(&key),
	    "--ca", &display(&ca_crt),
	    "--ca-key", &display(&ca_key),
	    "--profile", "intermediate-ca",
	    "--not-after", CERT_VALIDITY,
	    "--no-password", "--insecure", "--force",
	]);
	ctx.tools.run(STEP_CLI, &argv).await?;
	Ok(())
    }
}

#[async_trait]
impl AddonAction for CertificateChain {
    async fn up(&self, ctx: &AddonContext<'_>) -> Result<()> {
	std::fs::create_dir_all(ctx.workdir)?;
	self.ensure_root(ctx).await?;
	self.issue(ctx).await?;

	self.inner.up(ctx).await
    }

    async fn down(&self, ctx: &AddonContext<'_>) -> Result<()> {
	self.inner.down(ctx).await
    }
}

/*
 * The Linkerd control plane, installed with the certificates of the run
 * directory.
 */
pub struct ControlPlane;

#[async_trait]
impl AddonAction for ControlPlane {
    async fn up(&self, ctx: &AddonContext<'_>) -> Result<()> {
	let kubeconfig = display(ctx.kubeconfig);
	let (ca_crt, _) = root_paths(ctx.workdir);
	let (crt, key) = issuer_paths(ctx.workdir, ctx.cluster.node_name());

	check(ctx.tools, args(&["check", "--pre", "--kubeconfig", &kubeconfig])).await;

	ctx.api.apply_command(ctx.kubeconfig, LINKERD_CLI, &args(&["install", "--crds", "--kubeconfig", &kubeconfig])).await?;

	let install = args(&[
	    "install",
	    "--proxy-log-level=linkerd=debug,warn",
	    "--cluster-domain=cluster.local",
	    "--identity-trust-domain=cluster.local",
	    &format!("--identity-trust-anchors-file={}", display(&ca_crt)),
	    &format!("--identity-issuer-certificate-file={}", display(&crt)),
	    &format!("--identity-issuer-key-file={}", display(&key)),
	    "--kubeconfig", &kubeconfig,
	]);
	let report = ctx.api.apply_command(ctx.kubeconfig, LINKERD_CLI, &install).await?;
	log::info!("[{}] control plane: {:?}", ctx.name, report);

	check(ctx.tools, args(&["check", "--kubeconfig", &kubeconfig])).await;

	ctx.api.apply_command(ctx.kubeconfig, LINKERD_CLI, &args(&["upgrade", "--crds", "--kubeconfig", &kubeconfig])).await?;
	Ok(())
    }

    async fn down(&self, ctx: &AddonContext<'_>) -> Result<()> {
	let kubeconfig = display(ctx.kubeconfig);

	let report = ctx.api.delete_command(ctx.kubeconfig, LINKERD_CLI, &args(&["uninstall", "--kubeconfig", &kubeconfig])).await?;
	log::info!("[{}] control plane removed: {:?}", ctx.name, report);
	Ok(())
    }
}

/*
 * Stands aside while the `peer` mesh entry is enabled: the peer installs
 * the control plane then, and removing this entry must not take it away.
 */
pub struct SharedMesh {
    pub inner: Box<dyn AddonAction>,
    pub peer: &'static str,
}

#[async_trait]
impl AddonAction for SharedMesh {
    async fn up(&self, ctx: &AddonContext<'_>) -> Result<()> {
	if ctx.cluster.addon_enabled(self.peer) {
	    log::info!("[{}] control plane is handled by {}", ctx.name, self.peer);
	    return Ok(());
	}
	self.inner.up(ctx).await
    }

    async fn down(&self, ctx: &AddonContext<'_>) -> Result<()> {
	if ctx.cluster.addon_enabled(self.peer) {
	    log::info!("[{}] keeping the control plane, {} is still enabled", ctx.name, self.peer);
	    return Ok(());
	}
	self.inner.down(ctx).await
    }
}

/*
 * Adds the multicluster extension on top of the inner mesh install. Removal
 * takes the extension away, and the mesh too unless the `linkerd` addon
 * stays enabled.
 */
pub struct Multicluster {
    pub inner: Box<dyn AddonAction>,
}

#[async_trait]
impl AddonAction for Multicluster {
    async fn up(&self, ctx: &AddonContext<'_>) -> Result<()> {
	self.inner.up(ctx).await?;

	let kubeconfig = display(ctx.kubeconfig);
	let report = ctx.api.apply_command(ctx.kubeconfig, LINKERD_CLI, &args(&["multicluster", "install", "--kubeconfig", &kubeconfig])).await?;
	log::info!("[{}] multicluster: {:?}", ctx.name, report);

	check(ctx.tools, args(&["multicluster", "check", "--kubeconfig", &kubeconfig])).await;
	Ok(())
    }

    async fn down(&self, ctx: &AddonContext<'_>) -> Result<()> {
	let kubeconfig = display(ctx.kubeconfig);

	ctx.api.delete_command(ctx.kubeconfig, LINKERD_CLI, &args(&["multicluster", "uninstall", "--kubeconfig", &kubeconfig])).await?;

	if ctx.cluster.addon_enabled(super::LINKERD) {
	    log::info!("[{}] keeping the control plane, {} is still enabled", ctx.name, super::LINKERD);
	    return Ok(());
	}
	self.inner.down(ctx).await
    }
}

/*
 * Links the mesh of the cluster behind `kubeconfig` to a peer: the link
 * resources are generated from the peer's kubeconfig and applied to the
 * source cluster.
 */
pub async fn link(
    api: &dyn ClusterApi,
    kubeconfig: &Path,
    peer_kubeconfig: &Path,
    peer_name: &str,
    peer_address: &str,
) -> Result<ApplyReport> {
    let argv = args(&[
	"multicluster", "link",
	"--kubeconfig", &display(peer_kubeconfig),
	"--set", "enableHeadlessServices=true",
	"--log-level=debug",
	&format!("--cluster-name={}", peer_name),
	&format!("--api-server-address=https://{}:{}", peer_address, API_SERVER_PORT),
    ]);

    api.apply_command(kubeconfig, LINKERD_CLI, &argv).await
}
