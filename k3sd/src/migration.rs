/*
 * Decides, per addon, what a run has to do by comparing the descriptor
 * being applied with the one stored by the previous run.
 */
use k3sd_api::{AddonConfig, Cluster, CustomAddonConfig};

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Noop,
    Apply,
    Delete,
}

/*
 * The transition table. `previous` is None when no earlier snapshot exists,
 * Some(None) when the snapshot exists but lacks the addon. The booleans are
 * the effective enabled flags.
 */
pub fn transition(previous: Option<Option<bool>>, current: Option<bool>) -> MigrationStatus {
    let toggle = |enabled: bool| match enabled {
	true => MigrationStatus::Apply,
	false => MigrationStatus::Delete,
    };

    match (previous, current) {
	(None, current) => toggle(current.unwrap_or(false)),
	(Some(Some(_)), None) => MigrationStatus::Delete,
	(Some(None), None) => MigrationStatus::Noop,
	(Some(None), Some(now)) => toggle(now),
	(Some(Some(before)), Some(now)) if before == now => MigrationStatus::Noop,
	(Some(Some(_)), Some(now)) => toggle(now),
    }
}

pub fn addon_status(current: Option<&AddonConfig>, previous: Option<Option<&AddonConfig>>) -> MigrationStatus {
    transition(
	previous.map(|snapshot| snapshot.map(|addon| addon.enabled)),
	current.map(|addon| addon.enabled),
    )
}

/*
 * Same table for custom addons, where being enabled only counts when the
 * addon carries a Helm chart or a manifest.
 */
pub fn custom_addon_status(current: Option<&CustomAddonConfig>, previous: Option<Option<&CustomAddonConfig>>) -> MigrationStatus {
    let effective = |addon: &CustomAddonConfig| addon.enabled && addon.has_payload();

    transition(
	previous.map(|snapshot| snapshot.map(effective)),
	current.map(effective),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /* a built-in addon with its settings, when the descriptor has any */
    Builtin(Option<AddonConfig>),

    /* a custom addon with the payload to install or remove */
    Custom(CustomAddonConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub name: String,
    pub status: MigrationStatus,
    pub target: Target,
}

/*
 * Plans the built-in addons named in `builtins` (in that order), then every
 * custom addon known to either descriptor. A built-in removal uses the
 * current settings when there are some, the previous ones otherwise. A
 * custom removal uninstalls what the previous snapshot carried, even when
 * the addon is still listed but lost its chart or manifest.
 */
pub fn plan(current: &Cluster, previous: Option<&Cluster>, builtins: &[&str]) -> Vec<Decision> {
    let mut decisions = Vec::new();

    for name in builtins {
	let now = current.addons.get(*name);
	let before = previous.map(|snapshot| snapshot.addons.get(*name));
	let config = now.or(before.flatten()).cloned();

	decisions.push(Decision{
	    name: name.to_string(),
	    status: addon_status(now, before),
	    target: Target::Builtin(config),
	});
    }

    let mut names: BTreeSet<&String> = current.custom_addons.keys().collect();
    if let Some(snapshot) = previous {
	names.extend(snapshot.custom_addons.keys());
    }

    for name in names {
	let now = current.custom_addons.get(name);
	let before = previous.map(|snapshot| snapshot.custom_addons.get(name));
	let status = custom_addon_status(now, before);

	let installed = before.flatten().filter(|addon| addon.has_payload());
	let chosen = match status {
	    MigrationStatus::Delete => installed.or(now),
	    _ => now.or(installed),
	};
	let payload = match chosen.or(before.flatten()) {
	    Some(payload) => payload.clone(),
	    None => continue,
	};

	decisions.push(Decision{
	    name: name.clone(),
	    status: status,
	    target: Target::Custom(payload),
	});
    }
    decisions
}
