//! AWS EC2 provider for ClusterFlow
//!
//! Implements [`clusterflow_cloud::CloudProvider`] on top of `aws-sdk-ec2`.
//! Credentials and region resolution follow the standard AWS SDK chain
//! (environment, profile, instance metadata).

pub mod error;
pub mod provider;

pub use provider::Ec2Provider;
