/*
 * k3sd provisions K3s clusters over SSH and keeps their addons in line with
 * a declarative descriptor file.
 */
pub mod addons;
pub mod cluster;
pub mod clusterapi;
pub mod config;
pub mod errors;
pub mod kubeconfig;
pub mod manifest;
pub mod migration;
pub mod remote;
pub mod store;
pub mod tools;
