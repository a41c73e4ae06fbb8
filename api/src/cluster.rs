use crate::addon::{AddonConfig, CustomAddonConfig};

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/*
 * Older descriptors write empty lists and maps as `null`.
 */
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/*
 * A host taking part in a cluster, either the master or a worker.
 */
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /* IP or hostname reachable over SSH */
    pub address: String,

    pub user: String,

    pub password: String,

    /* the Kubernetes node name */
    pub node_name: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,

    /*
     * Set once the node has been bootstrapped (master) or joined (worker).
     * Nodes marked done are never touched again by a provisioning run.
     */
    #[serde(default)]
    pub done: bool,
}

impl Node {

    pub fn new(address: &str, user: &str, password: &str, node_name: &str) -> Self {
	Self{
	    address: address.to_string(),
	    user: user.to_string(),
	    password: password.to_string(),
	    node_name: node_name.to_string(),
	    labels: BTreeMap::new(),
	    done: false,
	}
    }

    /*
     * Returns the labels as a comma separated list of key=value pairs,
     * ordered by key.
     */
    pub fn labels_string(&self) -> String {
	self.labels.iter()
	    .map(|(k, v)| format!("{}={}", k, v))
	    .collect::<Vec<String>>()
	    .join(",")
    }
}

/*
 * The desired state of one K3s cluster.
 *
 * The master node is kept as its own field but serialized flat, so a
 * descriptor reads as:
 *
 *   [
 *     {
 *       "address": "10.0.0.1",
 *       "user": "root",
 *       "password": "...",
 *       "nodeName": "master",
 *       "done": false,
 *       "domain": "example.com",
 *       "workers": [ { "address": "10.0.0.2", ... } ],
 *       "addons": { "cert-manager": { "enabled": true } }
 *     }
 *   ]
 */
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(flatten)]
    pub master: Node,

    /* used by the cluster issuer and ingress addons */
    #[serde(default)]
    pub domain: String,

    /* kubeconfig context name, the k3s default is kept when empty */
    #[serde(default)]
    pub context: String,

    /* workers are only reachable from the master */
    #[serde(default)]
    pub private_net: bool,

    #[serde(default, deserialize_with = "null_as_default")]
    pub workers: Vec<Node>,

    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "BTreeMap::is_empty")]
    pub addons: BTreeMap<String, AddonConfig>,

    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_addons: BTreeMap<String, CustomAddonConfig>,

    /* addresses of peer clusters to link the service mesh with */
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub links_to: Vec<String>,
}

impl Cluster {

    pub fn new(master: Node) -> Self {
	Self{
	    master: master,
	    ..Default::default()
	}
    }

    pub fn address(&self) -> &str {
	self.master.address.as_str()
    }

    pub fn node_name(&self) -> &str {
	self.master.node_name.as_str()
    }

    /*
     * Whether the built-in addon `name` is present and enabled.
     */
    pub fn addon_enabled(&self, name: &str) -> bool {
	match self.addons.get(name) {
	    Some(addon) => addon.enabled,
	    None => false,
	}
    }
}
