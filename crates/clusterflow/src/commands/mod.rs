pub mod create;
pub mod delete;
pub mod kubeconfig;
pub mod list;
