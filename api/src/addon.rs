use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/*
 * Settings of a built-in addon. `enabled` alone decides whether the addon
 * should be installed; `path` and `subs` only feed the rendering step.
 */
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonConfig {
    #[serde(default)]
    pub enabled: bool,

    /* optional manifest or values file overriding the bundled one */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /* literal token -> value substitutions applied before the manifest is decoded */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subs: Option<BTreeMap<String, String>>,
}

impl AddonConfig {

    pub fn enabled() -> Self {
	Self{
	    enabled: true,
	    path: None,
	    subs: None,
	}
    }

    pub fn disabled() -> Self {
	Self{
	    enabled: false,
	    path: None,
	    subs: None,
	}
    }

    /*
     * Returns a copy of the substitutions, empty when none were given.
     */
    pub fn substitutions(&self) -> BTreeMap<String, String> {
	self.subs.clone().unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HelmRepo {
    pub name: String,
    pub url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmConfig {
    pub chart: String,

    pub repo: HelmRepo,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub values_file: String,

    /* release namespace, "default" when empty */
    #[serde(default)]
    pub namespace: String,
}

impl HelmConfig {

    pub fn namespace(&self) -> &str {
	if self.namespace.is_empty() {
	    "default"
	} else {
	    self.namespace.as_str()
	}
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ManifestConfig {
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subs: Option<BTreeMap<String, String>>,
}

/*
 * An operator defined addon, described only by data: a manifest with
 * substitutions, a Helm chart, or both.
 */
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CustomAddonConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ManifestConfig>,
}

impl CustomAddonConfig {

    /*
     * A custom addon can only be installed when it carries something to
     * install.
     */
    pub fn has_payload(&self) -> bool {
	self.helm.is_some() || self.manifest.is_some()
    }
}
