/*
 * k3sd/api - the declarative cluster descriptor shared by every part of k3sd.
 *
 * The descriptor file is a JSON list of `Cluster` objects; it is read once
 * per run and written back with the updated `done` flags.
 */

pub mod addon;
pub use addon::AddonConfig;
pub use addon::CustomAddonConfig;
pub use addon::HelmConfig;
pub use addon::HelmRepo;
pub use addon::ManifestConfig;

pub mod cluster;
pub use cluster::Cluster;
pub use cluster::Node;
