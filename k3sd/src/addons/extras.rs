use super::spec::{domain_substitutions, Source};
use super::{AddonAction, AddonContext};
use crate::errors::Result;

use async_trait::async_trait;
use log;

/*
 * Exposes an addon through an ingress manifest rendered with the cluster
 * domain. Without a domain there is nothing to route, so the ingress is
 * skipped.
 */
pub struct Ingress {
    pub inner: Box<dyn AddonAction>,
    pub manifest: Source,
}

#[async_trait]
impl AddonAction for Ingress {
    async fn up(&self, ctx: &AddonContext<'_>) -> Result<()> {
	self.inner.up(ctx).await?;

	if ctx.cluster.domain.is_empty() {
	    log::info!("[{}] no domain set, skipping the ingress", ctx.name);
	    return Ok(());
	}

	let source = self.manifest.resolve(ctx.settings);
	let subs = domain_substitutions(&ctx.cluster.domain);
	let report = ctx.api.apply_manifest(ctx.kubeconfig, &source, &subs).await?;

	log::info!("[{}] ingress {}: {:?}", ctx.name, source, report);
	Ok(())
    }

    async fn down(&self, ctx: &AddonContext<'_>) -> Result<()> {
	if !ctx.cluster.domain.is_empty() {
	    let source = self.manifest.resolve(ctx.settings);
	    let subs = domain_substitutions(&ctx.cluster.domain);
	    ctx.api.delete_manifest(ctx.kubeconfig, &source, &subs).await?;
	}

	self.inner.down(ctx).await
    }
}
