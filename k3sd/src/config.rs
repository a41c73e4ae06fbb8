use std::path::{Path, PathBuf};
use std::time::Duration;

/* the K3s release installed on new nodes */
pub const DEFAULT_K3S_VERSION: &str = "v1.31.4+k3s1";

/* how long a deployment may take to become ready after an addon install */
pub const DEFAULT_ROLLOUT_TIMEOUT: Duration = Duration::from_secs(120);

/* how often readiness is polled */
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/*
 * Run wide settings, built from the command line in main.rs.
 */
#[derive(Clone, Debug)]
pub struct Settings {
    /* prefix for the YAML assets used by the built-in addons */
    pub yamls_path: Option<PathBuf>,

    pub helm_atomic: bool,

    pub k3s_version: String,

    /* extra commands run on the master right after bootstrap */
    pub additional_commands: Vec<String>,

    pub rollout_timeout: Duration,

    pub poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
	Self{
	    yamls_path: None,
	    helm_atomic: false,
	    k3s_version: DEFAULT_K3S_VERSION.to_string(),
	    additional_commands: Vec::new(),
	    rollout_timeout: DEFAULT_ROLLOUT_TIMEOUT,
	    poll_interval: DEFAULT_POLL_INTERVAL,
	}
    }
}

impl Settings {

    /*
     * Resolves a bundled YAML asset: the configured prefix wins, then
     * ./yamls, then ~/.k3sd/yamls. The bare name is returned when nothing
     * matches so the read error names the file.
     */
    pub fn resolve_yaml(&self, name: &str) -> String {
	if let Some(prefix) = &self.yamls_path {
	    return prefix.join(name).to_string_lossy().to_string();
	}

	let local = Path::new("yamls").join(name);
	if local.exists() {
	    return local.to_string_lossy().to_string();
	}

	if let Some(home) = dirs::home_dir() {
	    let candidate = home.join(".k3sd").join("yamls").join(name);
	    if candidate.exists() {
		return candidate.to_string_lossy().to_string();
	    }
	}
	name.to_string()
    }
}

/*
 * Default location of the state store: ~/.k3sd/k3sd.db
 */
pub fn default_db_path() -> PathBuf {
    match dirs::home_dir() {
	Some(home) => home.join(".k3sd").join("k3sd.db"),
	None => PathBuf::from("k3sd.db"),
    }
}
