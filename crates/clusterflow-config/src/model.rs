//! クラスタ設定ファイルのモデル

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// クラスタの宣言的な定義 (`cluster-config.json`)
///
/// ワーカー数は符号付き。負の値はパース時ではなくプラン検証で弾く。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub region: String,

    /// AMI ID を解決する SSM パラメータ名
    pub ami_ssm_parameter: String,

    /// SSH と Kubernetes API への接続を許可する CIDR
    pub allowed_ingress: String,

    pub key_name: String,

    /// SSH 接続に使う秘密鍵のパス
    pub key_path: PathBuf,

    pub vpc_cidr_block: String,

    pub main_instance_type: String,
    pub worker_instance_type: String,
    pub gpu_instance_type: String,

    #[serde(default)]
    pub num_gpu_workers: i32,

    #[serde(default)]
    pub num_cpu_workers: i32,

    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// インポートする公開鍵 (省略時は `<key_path>.pub`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_path: Option<PathBuf>,

    /// 省略時は `<region>a`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,

    /// 指定するとスポットインスタンスとして起動する (上限価格)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_max_price: Option<String>,

    #[serde(default = "default_pod_network_cidr")]
    pub pod_network_cidr: String,

    #[serde(default = "default_max_parallel_bootstraps")]
    pub max_parallel_bootstraps: usize,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

fn default_pod_network_cidr() -> String {
    "10.244.0.0/16".to_string()
}

fn default_max_parallel_bootstraps() -> usize {
    8
}

impl ClusterConfig {
    /// 設定ファイルを読み込む (拡張子で JSON/YAML を判定)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::MissingFile {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("json")
            .to_ascii_lowercase();

        let config: Self = match extension.as_str() {
            "json" => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            "yaml" | "yml" => serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        tracing::debug!("Loaded cluster config from {}", path.display());
        Ok(config)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.public_key_path.clone().unwrap_or_else(|| {
            let mut path = self.key_path.clone().into_os_string();
            path.push(".pub");
            PathBuf::from(path)
        })
    }

    pub fn availability_zone(&self) -> String {
        self.availability_zone
            .clone()
            .unwrap_or_else(|| format!("{}a", self.region))
    }

    /// メインノードを含むインスタンス総数
    pub fn instance_count(&self) -> usize {
        1 + self.num_cpu_workers.max(0) as usize + self.num_gpu_workers.max(0) as usize
    }
}

/// create 中の各待機処理のタイムアウト (秒)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub instance_running_secs: u64,
    pub ssh_secs: u64,
    pub ssh_retry_interval_secs: u64,
    pub control_plane_secs: u64,
    pub join_credential_secs: u64,
    pub worker_ready_secs: u64,
    pub join_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            instance_running_secs: 600,
            ssh_secs: 300,
            ssh_retry_interval_secs: 5,
            control_plane_secs: 900,
            join_credential_secs: 120,
            worker_ready_secs: 900,
            join_secs: 600,
        }
    }
}

impl TimeoutConfig {
    pub fn instance_running(&self) -> Duration {
        Duration::from_secs(self.instance_running_secs)
    }

    pub fn ssh(&self) -> Duration {
        Duration::from_secs(self.ssh_secs)
    }

    pub fn ssh_retry_interval(&self) -> Duration {
        Duration::from_secs(self.ssh_retry_interval_secs)
    }

    pub fn control_plane(&self) -> Duration {
        Duration::from_secs(self.control_plane_secs)
    }

    pub fn join_credential(&self) -> Duration {
        Duration::from_secs(self.join_credential_secs)
    }

    pub fn worker_ready(&self) -> Duration {
        Duration::from_secs(self.worker_ready_secs)
    }

    pub fn join(&self) -> Duration {
        Duration::from_secs(self.join_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const MINIMAL_JSON: &str = r#"{
        "region": "us-east-1",
        "ami_ssm_parameter": "/aws/service/canonical/ubuntu/server/24.04/stable/current/amd64/hvm/ebs-gp3/ami-id",
        "allowed_ingress": "203.0.113.0/24",
        "key_name": "k8s",
        "key_path": "/home/me/.ssh/k8s",
        "vpc_cidr_block": "10.0.0.0/16",
        "main_instance_type": "t3.large",
        "worker_instance_type": "t3.large",
        "gpu_instance_type": "g4dn.xlarge"
    }"#;

    #[test]
    fn test_load_json_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster-config.json");
        fs::write(&path, MINIMAL_JSON).unwrap();

        let config = ClusterConfig::load(&path).unwrap();
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.num_cpu_workers, 0);
        assert_eq!(config.num_gpu_workers, 0);
        assert_eq!(config.ssh_user, "ubuntu");
        assert_eq!(config.timeouts, TimeoutConfig::default());
        assert_eq!(config.instance_count(), 1);
        assert_eq!(config.availability_zone(), "us-east-1a");
        assert_eq!(
            config.public_key_path(),
            PathBuf::from("/home/me/.ssh/k8s.pub")
        );
    }

    #[test]
    fn test_yaml_matches_json() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("cluster-config.json");
        fs::write(&json_path, MINIMAL_JSON).unwrap();

        let yaml_path = dir.path().join("cluster-config.yaml");
        fs::write(
            &yaml_path,
            r#"
region: us-east-1
ami_ssm_parameter: /aws/service/canonical/ubuntu/server/24.04/stable/current/amd64/hvm/ebs-gp3/ami-id
allowed_ingress: 203.0.113.0/24
key_name: k8s
key_path: /home/me/.ssh/k8s
vpc_cidr_block: 10.0.0.0/16
main_instance_type: t3.large
worker_instance_type: t3.large
gpu_instance_type: g4dn.xlarge
"#,
        )
        .unwrap();

        assert_eq!(
            ClusterConfig::load(&json_path).unwrap(),
            ClusterConfig::load(&yaml_path).unwrap()
        );
    }

    #[test]
    fn test_missing_required_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster-config.json");
        fs::write(&path, r#"{"region": "us-east-1"}"#).unwrap();

        let err = ClusterConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = ClusterConfig::load("/nonexistent/cluster-config.json").unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile { .. }));
    }

    #[test]
    fn test_partial_timeouts_keep_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster-config.json");
        let mut value: serde_json::Value = serde_json::from_str(MINIMAL_JSON).unwrap();
        value["timeouts"] = serde_json::json!({ "ssh_secs": 42 });
        value["num_cpu_workers"] = serde_json::json!(2);
        fs::write(&path, value.to_string()).unwrap();

        let config = ClusterConfig::load(&path).unwrap();
        assert_eq!(config.timeouts.ssh(), Duration::from_secs(42));
        assert_eq!(config.timeouts.control_plane_secs, 900);
        assert_eq!(config.instance_count(), 3);
    }
}
