use k3sd::addons::AddonRegistry;
use k3sd::cluster::Provisioner;
use k3sd::clusterapi::KubeClusterApi;
use k3sd::config::{self, Settings};
use k3sd::errors::{Error, Result};
use k3sd::kubeconfig::KubeconfigStore;
use k3sd::remote::SshConnector;
use k3sd::store::StateStore;
use k3sd::tools::SystemTools;
use k3sd_api::Cluster;

use clap::Parser;
use log;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "k3sd", version, about = "Provision K3s clusters over SSH and manage their addons")]
struct Args {
    /// Cluster descriptor file (JSON list of clusters)
    #[arg(long = "config-path", env = "K3SD_CONFIG_PATH", required_unless_present = "print_schema")]
    config_path: Option<PathBuf>,

    /// State database, ~/.k3sd/k3sd.db by default
    #[arg(long = "db-path", env = "K3SD_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Directory holding the bundled addon manifests
    #[arg(long = "yamls-path", env = "K3SD_YAMLS_PATH")]
    yamls_path: Option<PathBuf>,

    /// Where the kubeconfigs of each run are written
    #[arg(long = "kubeconfig-dir", env = "K3SD_KUBECONFIG_DIR", default_value = "./kubeconfigs")]
    kubeconfig_dir: PathBuf,

    /// Remove k3s from every node instead of provisioning
    #[arg(long)]
    uninstall: bool,

    /// Roll Helm releases back when their install fails
    #[arg(long = "helm-atomic")]
    helm_atomic: bool,

    #[arg(long = "k3s-version", env = "K3SD_K3S_VERSION", default_value = config::DEFAULT_K3S_VERSION)]
    k3s_version: String,

    /// Extra command run on a freshly bootstrapped master (repeatable)
    #[arg(long = "command")]
    commands: Vec<String>,

    /// Print the JSON schema of the descriptor file and exit
    #[arg(long = "print-schema")]
    print_schema: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn load(path: &Path) -> Result<Vec<Cluster>> {
    let content = fs::read_to_string(path)
	.map_err(|err| Error::Other(format!("unable to read {}: {}", path.display(), err)))?;

    Ok(serde_json::from_str(&content)?)
}

fn save(path: &Path, clusters: &[Cluster]) -> Result<()> {
    let content = serde_json::to_string_pretty(clusters)?;
    fs::write(path, content)?;

    log::info!("Wrote {} clusters back to {}", clusters.len(), path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if args.print_schema {
	let schema = schemars::schema_for!(Vec<Cluster>);
	println!("{}", serde_json::to_string_pretty(&schema)?);
	return Ok(());
    }

    let config_path = match &args.config_path {
	Some(path) => path.clone(),
	None => {
	    return Err(Error::Other(String::from("--config-path is required")));
	}
    };
    let mut clusters = load(&config_path)?;

    let db_path = args.db_path.clone().unwrap_or_else(config::default_db_path);
    let store = StateStore::open(&db_path)?;

    let settings = Settings{
	yamls_path: args.yamls_path.clone(),
	helm_atomic: args.helm_atomic,
	k3s_version: args.k3s_version.clone(),
	additional_commands: args.commands.clone(),
	..Default::default()
    };

    let run_id = uuid::Uuid::new_v4().to_string();
    log::info!("Starting run {} for {} clusters", run_id, clusters.len());

    let kubeconfigs = KubeconfigStore::new(&args.kubeconfig_dir, &run_id);
    let connector = SshConnector;
    let api = KubeClusterApi::new(settings.rollout_timeout, settings.poll_interval);
    let tools = SystemTools;
    let registry = AddonRegistry::builtin();

    let provisioner = Provisioner::new(&connector, &store, &registry, &api, &tools, &kubeconfigs, &settings);
    match args.uninstall {
	true => provisioner.uninstall(&mut clusters).await,
	false => provisioner.create(&mut clusters).await,
    }

    save(&config_path, &clusters)
}
