/*
 * Generic manifest application: arbitrary multi-document YAML is split,
 * decoded into dynamic objects and created on (or deleted from) a cluster
 * through API discovery, with no compiled type involved.
 */
use crate::errors::{Error, Result};

use async_trait::async_trait;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::api::DeleteParams as KubeDeleteParams;
use kube::api::DynamicObject;
use kube::api::GroupVersionKind;
use kube::api::PostParams as KubePostParams;
use kube::discovery::ApiCapabilities;
use kube::discovery::ApiResource;
use kube::discovery::Discovery;
use kube::discovery::Scope;
use log;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::RwLock;

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    AlreadyExists,
    Deleted,
    NotFound,
}

/*
 * What happened to the documents of one manifest.
 */
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /* created or deleted */
    pub changed: usize,

    /* already there on create, already gone on delete */
    pub unchanged: usize,

    /* not decodable or not mappable */
    pub skipped: usize,

    /* rejected by the API server */
    pub failed: usize,
}

impl ApplyReport {
    pub fn merge(&mut self, other: &ApplyReport) {
	self.changed += other.changed;
	self.unchanged += other.unchanged;
	self.skipped += other.skipped;
	self.failed += other.failed;
    }
}

/*
 * Something able to create and delete dynamic objects, the cluster in
 * production.
 */
#[async_trait]
pub trait ObjectTarget: Send + Sync {
    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<Outcome>;

    async fn delete(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<Outcome>;
}

pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/*
 * Reads a manifest from a local file or over HTTP(S).
 */
pub async fn read_source(source: &str) -> Result<String> {
    if is_url(source) {
	let response = reqwest::get(source).await?.error_for_status()?;
	return Ok(response.text().await?);
    }
    Ok(tokio::fs::read_to_string(source).await?)
}

/*
 * Literal substitution of every token in `subs`.
 *
 * The text is scanned once from left to right; at each position the longest
 * matching token wins and the inserted value is never scanned again, so a
 * value that looks like another token is left as is:
 *
 *   {"${A}": "${B}", "${B}": "x"} applied to "${A}" gives "${B}"
 */
pub fn substitute(text: &str, subs: &BTreeMap<String, String>) -> String {
    if subs.is_empty() {
	return text.to_string();
    }

    let mut tokens: Vec<(&String, &String)> = subs.iter().filter(|(k, _)| !k.is_empty()).collect();
    tokens.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.0.cmp(b.0)));

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    'scan: while let Some(c) = rest.chars().next() {
	for (token, value) in &tokens {
	    if rest.starts_with(token.as_str()) {
		out.push_str(value);
		rest = &rest[token.len()..];
		continue 'scan;
	    }
	}
	out.push(c);
	rest = &rest[c.len_utf8()..];
    }
    out
}

/*
 * A document made only of blank and comment lines carries no object.
 */
pub fn is_blank_or_comment(doc: &str) -> bool {
    doc.lines()
	.map(|line| line.trim())
	.all(|line| line.is_empty() || line.starts_with('#'))
}

/*
 * Incremental splitter on the `\n---` document boundary, fed line by line so
 * documents coming out of a running process can be applied as soon as they
 * are complete.
 */
#[derive(Debug, Default)]
pub struct DocumentSplitter {
    current: String,
}

impl DocumentSplitter {

    pub fn push_line(&mut self, line: &str) -> Option<String> {
	match line.strip_prefix("---") {
	    Some(rest) => {
		let done = std::mem::take(&mut self.current);
		self.current.push_str(rest);
		self.current.push('\n');

		keep_document(done)
	    }
	    None => {
		self.current.push_str(line);
		self.current.push('\n');
		None
	    }
	}
    }

    pub fn finish(&mut self) -> Option<String> {
	keep_document(std::mem::take(&mut self.current))
    }
}

/*
 * Drops leading blank lines and trailing whitespace only: the indentation of
 * the first line is part of the document.
 */
fn keep_document(doc: String) -> Option<String> {
    let doc = doc.trim_end()
	.lines()
	.skip_while(|line| line.trim().is_empty())
	.collect::<Vec<&str>>()
	.join("\n");

    if is_blank_or_comment(&doc) {
	return None;
    }
    Some(doc)
}

pub fn split_documents(text: &str) -> Vec<String> {
    let mut splitter = DocumentSplitter::default();
    let mut docs: Vec<String> = text.lines()
	.filter_map(|line| splitter.push_line(line))
	.collect();

    if let Some(doc) = splitter.finish() {
	docs.push(doc);
    }
    docs
}

/*
 * Decodes one YAML document into a dynamic object and its type identity.
 */
pub fn decode_document(doc: &str) -> Result<(GroupVersionKind, DynamicObject)> {
    let value: serde_json::Value = serde_yaml::from_str(doc)
	.map_err(|err| Error::Decode(err.to_string()))?;
    let obj: DynamicObject = serde_json::from_value(value)
	.map_err(|err| Error::Decode(err.to_string()))?;

    let types = match &obj.types {
	Some(types) => types,
	None => {
	    return Err(Error::Decode(String::from("document has no apiVersion/kind")));
	}
    };
    let (group, version) = match types.api_version.split_once('/') {
	Some((group, version)) => (group, version),
	None => ("", types.api_version.as_str()),
    };
    if version.is_empty() || types.kind.is_empty() {
	let errmsg = format!("invalid apiVersion/kind: {:?}/{:?}", types.api_version, types.kind);
	return Err(Error::Decode(errmsg));
    }

    let gvk = GroupVersionKind::gvk(group, version, &types.kind);
    Ok((gvk, obj))
}

fn describe(gvk: &GroupVersionKind, obj: &DynamicObject) -> String {
    let name = obj.metadata.name.clone().unwrap_or_default();
    match &obj.metadata.namespace {
	Some(ns) => format!("{} {}/{}", gvk.kind, ns, name),
	None => format!("{} {}", gvk.kind, name),
    }
}

/*
 * Creates or deletes the object of one document. Problems are contained to
 * the document: they are logged and counted in `report`.
 */
pub async fn process_document(target: &dyn ObjectTarget, op: Operation, doc: &str, report: &mut ApplyReport) {
    let (gvk, obj) = match decode_document(doc) {
	Ok(decoded) => decoded,
	Err(err) => {
	    log::error!("Skipping manifest document: {}\n---\n{}", err, doc);
	    report.skipped += 1;
	    return;
	}
    };

    let result = match op {
	Operation::Create => target.create(&gvk, &obj).await,
	Operation::Delete => target.delete(&gvk, &obj).await,
    };

    match result {
	Ok(Outcome::Created) | Ok(Outcome::Deleted) => {
	    log::info!("{:?} {}", op, describe(&gvk, &obj));
	    report.changed += 1;
	}
	Ok(outcome) => {
	    log::debug!("{} is {:?}, nothing to do", describe(&gvk, &obj), outcome);
	    report.unchanged += 1;
	}
	Err(Error::Mapping(msg)) => {
	    log::error!("Skipping {}: {}", describe(&gvk, &obj), msg);
	    report.skipped += 1;
	}
	Err(err) => {
	    log::error!("Unable to {:?} {}: {}", op, describe(&gvk, &obj), err);
	    report.failed += 1;
	}
    }
}

pub async fn process_documents(target: &dyn ObjectTarget, op: Operation, docs: &[String]) -> ApplyReport {
    let mut report = ApplyReport::default();
    for doc in docs {
	process_document(target, op, doc, &mut report).await;
    }
    report
}

/*
 * Same pipeline fed from a live stream, typically a child's stdout.
 */
pub async fn process_stream<R>(target: &dyn ObjectTarget, op: Operation, reader: R) -> Result<ApplyReport>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut report = ApplyReport::default();
    let mut splitter = DocumentSplitter::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
	if let Some(doc) = splitter.push_line(&line) {
	    process_document(target, op, &doc, &mut report).await;
	}
    }
    if let Some(doc) = splitter.finish() {
	process_document(target, op, &doc, &mut report).await;
    }
    Ok(report)
}

/*
 * Reads, renders and splits a manifest source.
 */
pub async fn render(source: &str, subs: &BTreeMap<String, String>) -> Result<Vec<String>> {
    let raw = read_source(source).await?;
    Ok(split_documents(&substitute(&raw, subs)))
}

/*
 * One discovery refresh may be spent per manifest, and one more after each
 * CRD the manifest created.
 */
#[derive(Debug, Default)]
pub struct RefreshBudget {
    spent: AtomicBool,
}

impl RefreshBudget {

    pub fn renew(&self) {
	self.spent.store(false, Ordering::SeqCst);
    }

    /* true when a refresh is still allowed, which also spends it */
    pub fn take(&self) -> bool {
	!self.spent.swap(true, Ordering::SeqCst)
    }
}

pub fn defines_kinds(gvk: &GroupVersionKind) -> bool {
    gvk.group == "apiextensions.k8s.io" && gvk.kind == "CustomResourceDefinition"
}

/*
 * KubeTarget resolves object types through API discovery. The discovery
 * result is fetched once and refreshed only when a type is unknown, which
 * happens after a manifest installed new CRDs.
 */
pub struct KubeTarget {
    client: KubeClient,
    discovery: RwLock<Discovery>,
    refresh: RefreshBudget,
}

impl KubeTarget {

    pub async fn new(client: KubeClient) -> Result<Self> {
	let discovery = Discovery::new(client.clone()).run().await?;

	Ok(Self{
	    client: client,
	    discovery: RwLock::new(discovery),
	    refresh: RefreshBudget::default(),
	})
    }

    pub fn client(&self) -> KubeClient {
	self.client.clone()
    }

    /*
     * Called before each manifest or command output is processed.
     */
    pub fn begin_manifest(&self) {
	self.refresh.renew();
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities)> {
	if let Some(found) = self.discovery.read().await.resolve_gvk(gvk) {
	    return Ok(found);
	}

	if !self.refresh.take() {
	    return Err(Error::Mapping(format!("no resource for {}/{} {}", gvk.group, gvk.version, gvk.kind)));
	}

	log::debug!("{}/{} {} is unknown, refreshing discovery", gvk.group, gvk.version, gvk.kind);
	let fresh = Discovery::new(self.client.clone()).run().await?;
	let found = fresh.resolve_gvk(gvk);
	*self.discovery.write().await = fresh;

	found.ok_or_else(|| Error::Mapping(format!("no resource for {}/{} {}", gvk.group, gvk.version, gvk.kind)))
    }

    async fn api_for(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<KubeApi<DynamicObject>> {
	let (resource, caps) = self.resolve(gvk).await?;

	let api = match caps.scope {
	    Scope::Namespaced => {
		let namespace = obj.metadata.namespace.clone().unwrap_or(DEFAULT_NAMESPACE.to_string());
		KubeApi::namespaced_with(self.client.clone(), &namespace, &resource)
	    }
	    Scope::Cluster => KubeApi::all_with(self.client.clone(), &resource),
	};
	Ok(api)
    }
}

#[async_trait]
impl ObjectTarget for KubeTarget {
    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<Outcome> {
	let api = self.api_for(gvk, obj).await?;

	match api.create(&KubePostParams::default(), obj).await {
	    Ok(_) => {
		if defines_kinds(gvk) {
		    self.refresh.renew();
		}
		Ok(Outcome::Created)
	    }
	    Err(kube::Error::Api(err)) if err.code == 409 => Ok(Outcome::AlreadyExists),
	    Err(err) => Err(Error::Kube(err)),
	}
    }

    async fn delete(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<Outcome> {
	let api = self.api_for(gvk, obj).await?;
	let name = match &obj.metadata.name {
	    Some(name) => name.clone(),
	    None => {
		return Err(Error::Decode(format!("{} has no metadata.name", gvk.kind)));
	    }
	};

	match api.delete(&name, &KubeDeleteParams::default()).await {
	    Ok(_) => Ok(Outcome::Deleted),
	    Err(kube::Error::Api(err)) if err.code == 404 => Ok(Outcome::NotFound),
	    Err(err) => Err(Error::Kube(err)),
	}
    }
}
