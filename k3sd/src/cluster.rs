/*
 * Provisioner drives a whole run: bring the nodes up, persist the new
 * descriptor, migrate the addons, then link the service meshes.
 */
use crate::addons::spec::AddonSpec;
use crate::addons::{self, linkerd, AddonAction, AddonContext, AddonRegistry};
use crate::clusterapi::ClusterApi;
use crate::config::Settings;
use crate::errors::{Error, Result};
use crate::kubeconfig::KubeconfigStore;
use crate::migration::{self, MigrationStatus, Target};
use crate::remote::{self, Connector, Session, SessionScope};
use crate::store::StateStore;
use crate::tools::ToolRunner;
use k3sd_api::{Cluster, Node};

use log;
use std::path::{Path, PathBuf};

pub const K3S_INSTALL_URL: &str = "https://get.k3s.io";
pub const K3S_API_PORT: u16 = 6443;

const TOKEN_COMMAND: &str = "echo $(k3s token create)";
const SERVER_UNINSTALL: &str = "k3s-uninstall.sh";
const AGENT_UNINSTALL: &str = "k3s-agent-uninstall.sh";

/*
 * The commands turning a bare host into a k3s server. Traefik is disabled
 * since it is managed as an addon.
 */
pub fn bootstrap_commands(master: &Node, settings: &Settings) -> Vec<String> {
    let mut commands = vec![
	String::from("sudo apt-get update -y"),
	String::from("sudo apt-get install curl wget zip unzip -y"),
	format!(
	    "sudo sh -c \"curl -sfL {} | INSTALL_K3S_VERSION='{}' INSTALL_K3S_EXEC='--disable traefik --node-name {}' K3S_KUBECONFIG_MODE='644' sh -\"",
	    K3S_INSTALL_URL, settings.k3s_version, master.node_name,
	),
	String::from("sleep 10"),
    ];
    commands.extend(settings.additional_commands.iter().cloned());
    commands
}

pub fn join_commands(master_address: &str, token: &str, worker: &Node, settings: &Settings) -> Vec<String> {
    vec![
	String::from("sudo apt update && sudo apt install -y curl"),
	format!(
	    "curl -sfL {} | K3S_URL=https://{}:{} K3S_TOKEN='{}' INSTALL_K3S_VERSION='{}' INSTALL_K3S_EXEC='--node-name {}' sh -",
	    K3S_INSTALL_URL, master_address, K3S_API_PORT, token, settings.k3s_version, worker.node_name,
	),
    ]
}

/*
 * Wraps a command so that the master runs it on a worker it alone can
 * reach.
 */
pub fn through_master(worker: &Node, command: &str) -> String {
    format!("ssh {}@{} \"{}\"", worker.user, worker.address, command)
}

pub struct Provisioner<'a> {
    connector: &'a dyn Connector,
    store: &'a StateStore,
    registry: &'a AddonRegistry,
    api: &'a dyn ClusterApi,
    tools: &'a dyn ToolRunner,
    kubeconfigs: &'a KubeconfigStore,
    settings: &'a Settings,
}

impl<'a> Provisioner<'a> {

    pub fn new(
	connector: &'a dyn Connector,
	store: &'a StateStore,
	registry: &'a AddonRegistry,
	api: &'a dyn ClusterApi,
	tools: &'a dyn ToolRunner,
	kubeconfigs: &'a KubeconfigStore,
	settings: &'a Settings,
    ) -> Self {
	Self{
	    connector: connector,
	    store: store,
	    registry: registry,
	    api: api,
	    tools: tools,
	    kubeconfigs: kubeconfigs,
	    settings: settings,
	}
    }

    /*
     * Provisions every cluster in turn. A failing cluster is logged and
     * skipped; the done flags of `clusters` reflect what actually happened.
     * Mesh links are made once every cluster has been processed.
     */
    pub async fn create(&self, clusters: &mut [Cluster]) {
	let mut meshed: Vec<usize> = Vec::new();

	for (index, cluster) in clusters.iter_mut().enumerate() {
	    log::info!("Provisioning cluster {} ({})", cluster.address(), cluster.node_name());

	    match self.provision(cluster).await {
		Ok(()) if cluster.addon_enabled(addons::LINKERD_MC) => meshed.push(index),
		Ok(()) => {}
		Err(err) => log::error!("Cluster {} was not provisioned: {}", cluster.address(), err),
	    }
	}

	for index in meshed {
	    self.link(&clusters[index], &*clusters).await;
	}
    }

    async fn provision(&self, cluster: &mut Cluster) -> Result<()> {
	let mut scope = SessionScope::new(self.connector);
	let master = scope.open(&cluster.master).await?;

	if !cluster.master.done {
	    log::info!("Bootstrapping master {}", cluster.address());
	    remote::run_all(master.as_ref(), &bootstrap_commands(&cluster.master, self.settings)).await?;
	    cluster.master.done = true;
	}

	let kubeconfig = self.kubeconfigs.capture(master.as_ref(), cluster).await?;
	self.label(&kubeconfig, &cluster.master).await;

	self.join_workers(&mut scope, master.as_ref(), cluster, &kubeconfig).await;

	let previous = self.store.insert(cluster)?;
	let previous = self.store.get_version(cluster, previous)?;
	self.migrate(cluster, previous.as_ref(), &kubeconfig).await;

	Ok(())
    }

    async fn label(&self, kubeconfig: &Path, node: &Node) {
	if node.labels.is_empty() {
	    return;
	}
	if let Err(err) = self.api.label_node(kubeconfig, &node.node_name, &node.labels).await {
	    log::error!("Unable to label node {} with {}: {}", node.node_name, node.labels_string(), err);
	}
    }

    async fn join_workers(&self, scope: &mut SessionScope<'_>, master: &dyn Session, cluster: &mut Cluster, kubeconfig: &Path) {
	let master_address = cluster.address().to_string();
	let private_net = cluster.private_net;

	for worker in cluster.workers.iter_mut().filter(|worker| !worker.done) {
	    log::info!("Joining worker {} ({})", worker.address, worker.node_name);

	    match self.join(scope, master, &master_address, private_net, worker).await {
		Ok(()) => {
		    worker.done = true;
		    self.label(kubeconfig, worker).await;
		}
		Err(err) => log::error!("Worker {} did not join, it will be retried on the next run: {}", worker.address, err),
	    }
	}
    }

    async fn join(&self, scope: &mut SessionScope<'_>, master: &dyn Session, master_address: &str, private_net: bool, worker: &Node) -> Result<()> {
	let token = remote::run_quiet(master, TOKEN_COMMAND).await?;
	let token = token.trim();
	if token.is_empty() {
	    return Err(Error::Other(format!("{} returned an empty token", master.address())));
	}

	let commands = join_commands(master_address, token, worker, self.settings);
	if private_net {
	    let commands: Vec<String> = commands.iter()
		.map(|command| through_master(worker, command))
		.collect();
	    return remote::run_all(master, &commands).await;
	}

	let session = scope.open(worker).await?;
	remote::run_all(session.as_ref(), &commands).await
    }

    /*
     * Runs the decision of every addon. Failures are contained to their
     * addon.
     */
    async fn migrate(&self, cluster: &Cluster, previous: Option<&Cluster>, kubeconfig: &Path) {
	let workdir = self.kubeconfigs.dir();

	for decision in migration::plan(cluster, previous, &self.registry.names()) {
	    if decision.status == MigrationStatus::Noop {
		log::debug!("Addon {} is unchanged", decision.name);
		continue;
	    }

	    let custom;
	    let (action, config): (&dyn AddonAction, _) = match &decision.target {
		Target::Builtin(config) => match self.registry.get(&decision.name) {
		    Some(action) => (action, config.as_ref()),
		    None => continue,
		},
		Target::Custom(addon) => {
		    custom = AddonSpec::from_custom(&decision.name, addon);
		    (&custom as &dyn AddonAction, None)
		}
	    };

	    let ctx = AddonContext{
		name: &decision.name,
		cluster: cluster,
		config: config,
		kubeconfig: kubeconfig,
		workdir: workdir,
		api: self.api,
		tools: self.tools,
		settings: self.settings,
	    };

	    log::info!("Addon {}: {:?}", decision.name, decision.status);
	    let result = match decision.status {
		MigrationStatus::Apply => action.up(&ctx).await,
		_ => action.down(&ctx).await,
	    };
	    if let Err(err) = result {
		log::error!("Addon {} failed on {}: {}", decision.name, cluster.address(), err);
	    }
	}
    }

    /*
     * Links the mesh of `cluster` to each of its peers.
     */
    async fn link(&self, cluster: &Cluster, clusters: &[Cluster]) {
	let kubeconfig = self.kubeconfigs.path_for(cluster.node_name());

	for address in &cluster.links_to {
	    let peer = match clusters.iter().find(|peer| peer.address() == address) {
		Some(peer) => peer,
		None => {
		    log::error!("Cluster {} links to unknown cluster {}", cluster.address(), address);
		    continue;
		}
	    };

	    let peer_kubeconfig: PathBuf = self.kubeconfigs.path_for(peer.node_name());
	    if !peer_kubeconfig.exists() {
		log::error!("No kubeconfig for {} in this run, not linking {} to it", address, cluster.address());
		continue;
	    }

	    let peer_name = match peer.context.is_empty() {
		true => peer.node_name(),
		false => peer.context.as_str(),
	    };
	    match linkerd::link(self.api, &kubeconfig, &peer_kubeconfig, peer_name, address).await {
		Ok(report) => log::info!("Linked {} to {}: {:?}", cluster.address(), address, report),
		Err(err) => log::error!("Unable to link {} to {}: {}", cluster.address(), address, err),
	    }
	}
    }

    /*
     * Removes k3s from every node and forgets the stored history, so the
     * next run starts from scratch.
     */
    pub async fn uninstall(&self, clusters: &mut [Cluster]) {
	for cluster in clusters.iter_mut() {
	    log::info!("Uninstalling cluster {} ({})", cluster.address(), cluster.node_name());

	    if let Err(err) = self.store.delete(cluster) {
		log::error!("Unable to forget the history of {}: {}", cluster.address(), err);
	    }
	    if let Err(err) = self.teardown(cluster).await {
		log::error!("Cluster {} was not uninstalled: {}", cluster.address(), err);
	    }
	}
    }

    async fn teardown(&self, cluster: &mut Cluster) -> Result<()> {
	let mut scope = SessionScope::new(self.connector);
	let master = scope.open(&cluster.master).await?;
	let private_net = cluster.private_net;

	for worker in cluster.workers.iter_mut().filter(|worker| worker.done) {
	    let result = match private_net {
		true => remote::run(master.as_ref(), &through_master(worker, AGENT_UNINSTALL)).await,
		false => match scope.open(worker).await {
		    Ok(session) => remote::run(session.as_ref(), AGENT_UNINSTALL).await,
		    Err(err) => Err(err),
		},
	    };

	    match result {
		Ok(_) => worker.done = false,
		Err(err) => log::error!("Unable to uninstall worker {}: {}", worker.address, err),
	    }
	}

	if cluster.master.done {
	    remote::run(master.as_ref(), SERVER_UNINSTALL).await?;
	    cluster.master.done = false;
	}
	Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusterapi::fake::FakeClusterApi;
    use crate::kubeconfig::testdata::K3S_KUBECONFIG;
    use crate::kubeconfig::REMOTE_KUBECONFIG;
    use crate::remote::fake::FakeConnector;
    use crate::tools::fake::FakeTools;
    use k3sd_api::{AddonConfig, CustomAddonConfig, ManifestConfig};

    struct World {
	connector: FakeConnector,
	store: StateStore,
	registry: AddonRegistry,
	api: FakeClusterApi,
	tools: FakeTools,
	kubeconfigs: KubeconfigStore,
	settings: Settings,
	_tmp: tempfile::TempDir,
    }

    impl World {
	fn new() -> Self {
	    let tmp = tempfile::tempdir().unwrap();

	    let mut connector = FakeConnector::default();
	    connector.responses.insert(format!("cat {}", REMOTE_KUBECONFIG), K3S_KUBECONFIG.to_string());
	    connector.responses.insert(TOKEN_COMMAND.to_string(), String::from("K10secret::server:abc\n"));

	    Self{
		connector: connector,
		store: StateStore::open_in_memory().unwrap(),
		registry: AddonRegistry::builtin(),
		api: FakeClusterApi::default(),
		tools: FakeTools::default(),
		kubeconfigs: KubeconfigStore::new(tmp.path(), "run-1"),
		settings: Settings{
		    yamls_path: Some(PathBuf::from("assets")),
		    ..Default::default()
		},
		_tmp: tmp,
	    }
	}

	fn provisioner(&self) -> Provisioner<'_> {
	    Provisioner::new(
		&self.connector,
		&self.store,
		&self.registry,
		&self.api,
		&self.tools,
		&self.kubeconfigs,
		&self.settings,
	    )
	}

	fn reset(&self) {
	    self.connector.log.lock().unwrap().clear();
	    self.connector.quiet.lock().unwrap().clear();
	    self.api.log.lock().unwrap().clear();
	    self.tools.log.lock().unwrap().clear();
	}
    }

    fn cluster(address: &str, name: &str) -> Cluster {
	let mut master = Node::new(address, "root", "secret", name);
	master.labels.insert(String::from("role"), String::from("control"));

	let mut cluster = Cluster::new(master);
	let mut worker = Node::new(&address.replace(".1", ".2"), "root", "secret", &format!("{}-w1", name));
	worker.labels.insert(String::from("zone"), String::from("a"));
	cluster.workers.push(worker);
	cluster.addons.insert(String::from("gitea"), AddonConfig::enabled());
	cluster
    }

    #[test]
    fn bootstrap_pins_the_release() {
	let settings = Settings{
	    additional_commands: vec![String::from("echo done")],
	    ..Default::default()
	};
	let commands = bootstrap_commands(&Node::new("10.0.0.1", "root", "p", "m1"), &settings);

	assert_eq!(commands.len(), 5);
	assert!(commands[2].contains("INSTALL_K3S_EXEC='--disable traefik --node-name m1'"));
	assert!(commands[2].contains(&settings.k3s_version));
	assert_eq!(commands[4], "echo done");
    }

    #[tokio::test]
    async fn fresh_apply() {
	let world = World::new();
	let mut clusters = vec![cluster("10.0.0.1", "east")];
	clusters[0].addons.clear();
	clusters[0].addons.insert(String::from("cert-manager"), AddonConfig::enabled());

	world.provisioner().create(&mut clusters).await;

	assert!(clusters[0].master.done);
	assert!(clusters[0].workers[0].done);

	let master = world.connector.commands_for("10.0.0.1");
	assert_eq!(master[0], "sudo apt-get update -y");
	assert_eq!(master[3], "sleep 10");
	assert_eq!(master[4], format!("cat {}", REMOTE_KUBECONFIG));
	assert_eq!(master[5], TOKEN_COMMAND);

	// credentials are fetched without echoing them
	assert_eq!(*world.connector.quiet.lock().unwrap(), vec![format!("cat {}", REMOTE_KUBECONFIG), TOKEN_COMMAND.to_string()]);

	let worker = world.connector.commands_for("10.0.0.2");
	assert_eq!(worker.len(), 2);
	assert!(worker[1].contains("K3S_URL=https://10.0.0.1:6443 K3S_TOKEN='K10secret::server:abc'"));
	assert!(worker[1].contains("--node-name east-w1"));

	let calls = world.api.calls();
	assert_eq!(calls[0], "label east role=control");
	assert_eq!(calls[1], "label east-w1 zone=a");

	let applied: Vec<String> = calls.iter().filter(|call| call.starts_with("apply")).cloned().collect();
	assert_eq!(applied, vec![
	    format!("apply {}/cert-manager.yaml", addons::CERT_MANAGER_RELEASE),
	    format!("apply {}/cert-manager.crds.yaml", addons::CERT_MANAGER_RELEASE),
	]);
	assert!(world.api.subs.lock().unwrap().iter().all(|subs| subs.is_empty()));
	assert!(calls.contains(&String::from("wait cert-manager/cert-manager-webhook")));

	// disabled addons are cleaned up on the first run
	assert!(calls.contains(&String::from("delete assets/gitea.yaml")));

	assert_eq!(world.store.latest(&clusters[0]).unwrap().map(|(v, _)| v), Some(1));
	assert!(world.kubeconfigs.path_for("east").exists());

	// both sessions were released
	assert_eq!(world.connector.closed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
	let world = World::new();
	let mut clusters = vec![cluster("10.0.0.1", "east")];

	world.provisioner().create(&mut clusters).await;
	world.reset();
	world.provisioner().create(&mut clusters).await;

	assert_eq!(world.connector.all_commands(), vec![format!("cat {}", REMOTE_KUBECONFIG)]);
	assert_eq!(world.api.calls(), vec!["label east role=control"]);
	assert!(world.tools.calls().is_empty());
	assert_eq!(world.store.latest(&clusters[0]).unwrap().map(|(v, _)| v), Some(2));
    }

    #[tokio::test]
    async fn toggled_addon_is_removed() {
	let world = World::new();
	let mut clusters = vec![cluster("10.0.0.1", "east")];

	world.provisioner().create(&mut clusters).await;
	world.reset();
	clusters[0].addons.insert(String::from("gitea"), AddonConfig::disabled());
	world.provisioner().create(&mut clusters).await;

	assert_eq!(world.api.calls(), vec!["label east role=control", "delete assets/gitea.yaml"]);
    }

    #[tokio::test]
    async fn private_workers_join_through_the_master() {
	let world = World::new();
	let mut clusters = vec![cluster("10.0.0.1", "east")];
	clusters[0].private_net = true;

	world.provisioner().create(&mut clusters).await;

	assert!(clusters[0].workers[0].done);
	assert!(world.connector.commands_for("10.0.0.2").is_empty());

	let master = world.connector.commands_for("10.0.0.1");
	assert_eq!(master[6], "ssh root@10.0.0.2 \"sudo apt update && sudo apt install -y curl\"");
	assert!(master[7].starts_with("ssh root@10.0.0.2 \"curl -sfL https://get.k3s.io | K3S_URL=https://10.0.0.1:6443"));
    }

    #[tokio::test]
    async fn failed_token_leaves_the_worker_for_the_next_run() {
	let mut world = World::new();
	world.connector.failing.insert(TOKEN_COMMAND.to_string());
	let mut clusters = vec![cluster("10.0.0.1", "east")];

	world.provisioner().create(&mut clusters).await;

	assert!(clusters[0].master.done);
	assert!(!clusters[0].workers[0].done);
	assert!(world.connector.commands_for("10.0.0.2").is_empty());

	// addons still ran
	assert!(world.api.calls().contains(&String::from("apply assets/gitea.yaml")));
    }

    #[tokio::test]
    async fn unreachable_cluster_does_not_block_the_others() {
	let mut world = World::new();
	world.connector.unreachable.insert(String::from("10.0.0.1"));
	let mut clusters = vec![cluster("10.0.0.1", "east"), cluster("10.0.1.1", "west")];

	world.provisioner().create(&mut clusters).await;

	assert!(!clusters[0].master.done);
	assert!(clusters[1].master.done);
	assert!(clusters[1].workers[0].done);
	assert_eq!(world.store.latest(&clusters[0]).unwrap(), None);
    }

    #[tokio::test]
    async fn failing_addon_does_not_block_the_others() {
	let mut world = World::new();
	world.api.failing.push(String::from("apply assets/gitea.yaml"));
	let mut clusters = vec![cluster("10.0.0.1", "east")];
	clusters[0].addons.insert(String::from("traefik"), AddonConfig::enabled());

	world.provisioner().create(&mut clusters).await;

	let calls = world.api.calls();
	assert!(calls.contains(&String::from("apply assets/traefik-values.yaml")));
	assert!(calls.contains(&String::from("delete assets/clusterissuer.yaml")));
    }

    #[tokio::test]
    async fn meshes_are_linked_after_every_cluster_is_up() {
	let world = World::new();
	let mut east = cluster("10.0.0.1", "east");
	let mut west = cluster("10.0.1.1", "west");
	west.context = String::from("west-ctx");
	east.addons.insert(String::from("linkerd-mc"), AddonConfig::enabled());
	east.links_to = vec![String::from("10.0.1.1"), String::from("10.9.9.9")];
	let mut clusters = vec![east, west];

	world.provisioner().create(&mut clusters).await;

	let links: Vec<String> = world.api.calls().into_iter()
	    .filter(|call| call.contains("multicluster link"))
	    .collect();
	assert_eq!(links.len(), 1);
	assert!(links[0].contains(&format!("--kubeconfig {}", world.kubeconfigs.path_for("west").display())));
	assert!(links[0].contains("--cluster-name=west-ctx"));
	assert!(links[0].contains("--api-server-address=https://10.0.1.1:6443"));

	// the link comes after the second cluster was provisioned
	let calls = world.api.calls();
	let last_west = calls.iter().rposition(|call| call.starts_with("label west")).unwrap();
	let link = calls.iter().position(|call| call.contains("multicluster link")).unwrap();
	assert!(link > last_west);
    }

    #[tokio::test]
    async fn full_uninstall() {
	let world = World::new();
	let mut clusters = vec![cluster("10.0.0.1", "east")];

	world.provisioner().create(&mut clusters).await;
	world.provisioner().create(&mut clusters).await;
	assert!(clusters[0].master.done && clusters[0].workers[0].done);
	assert_eq!(world.store.latest(&clusters[0]).unwrap().map(|(v, c)| (v, c.addon_enabled("gitea"))), Some((2, true)));

	world.reset();
	world.provisioner().uninstall(&mut clusters).await;

	assert!(!clusters[0].master.done);
	assert!(!clusters[0].workers[0].done);
	assert_eq!(world.connector.commands_for("10.0.0.2"), vec![AGENT_UNINSTALL]);
	assert_eq!(world.connector.commands_for("10.0.0.1"), vec![SERVER_UNINSTALL]);
	assert_eq!(world.store.get_version(&clusters[0], 1).unwrap(), None);
	assert_eq!(world.store.get_version(&clusters[0], 2).unwrap(), None);
	assert_eq!(world.store.insert(&clusters[0]).unwrap(), 0);
    }

    #[tokio::test]
    async fn custom_addon_losing_its_payload_is_uninstalled() {
	let world = World::new();
	let mut clusters = vec![cluster("10.0.0.1", "east")];
	clusters[0].custom_addons.insert(String::from("extra"), CustomAddonConfig{
	    enabled: true,
	    helm: None,
	    manifest: Some(ManifestConfig{ path: String::from("extra.yaml"), subs: None }),
	});

	world.provisioner().create(&mut clusters).await;
	assert!(world.api.calls().contains(&String::from("apply extra.yaml")));

	world.reset();
	clusters[0].custom_addons.get_mut("extra").unwrap().manifest = None;
	world.provisioner().create(&mut clusters).await;

	assert_eq!(world.api.calls(), vec!["label east role=control", "delete extra.yaml"]);
    }

    #[tokio::test]
    async fn mesh_entries_share_one_control_plane() {
	let world = World::new();
	let mut clusters = vec![cluster("10.0.0.1", "east")];
	clusters[0].addons.insert(String::from("linkerd"), AddonConfig::enabled());
	clusters[0].addons.insert(String::from("linkerd-mc"), AddonConfig::enabled());

	world.provisioner().create(&mut clusters).await;

	let installs = world.api.calls().iter().filter(|call| call.starts_with("apply $ linkerd install --crds")).count();
	assert_eq!(installs, 1);
	let issuers = world.tools.calls().iter().filter(|call| call.contains("east-issuer.crt")).count();
	assert_eq!(issuers, 1);
	assert!(world.api.calls().iter().any(|call| call.starts_with("apply $ linkerd multicluster install")));

	// dropping linkerd while the multicluster entry stays keeps the mesh
	world.reset();
	clusters[0].addons.insert(String::from("linkerd"), AddonConfig::disabled());
	world.provisioner().create(&mut clusters).await;

	assert_eq!(world.api.calls(), vec!["label east role=control"]);
	assert!(world.tools.calls().is_empty());
    }

    #[tokio::test]
    async fn private_uninstall_goes_through_the_master() {
	let world = World::new();
	let mut clusters = vec![cluster("10.0.0.1", "east")];
	clusters[0].private_net = true;
	clusters[0].master.done = true;
	clusters[0].workers[0].done = true;

	world.provisioner().uninstall(&mut clusters).await;

	assert_eq!(world.connector.commands_for("10.0.0.1"), vec![
	    String::from("ssh root@10.0.0.2 \"k3s-agent-uninstall.sh\""),
	    String::from(SERVER_UNINSTALL),
	]);
	assert!(!clusters[0].workers[0].done);
    }
}
