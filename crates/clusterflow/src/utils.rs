use crate::backend::AwsBackend;
use clusterflow_cloud::StateStore;
use clusterflow_config::{ClusterConfig, ConfigError};
use clusterflow_registry::ClusterRegistry;
use colored::Colorize;
use std::path::{Path, PathBuf};

pub type Registry = ClusterRegistry<AwsBackend>;

/// 状態ディレクトリを決めてレジストリを開く
pub fn open_registry(state_dir: Option<&Path>) -> Result<Registry, ConfigError> {
    let state_dir = clusterflow_config::resolve_state_dir(state_dir)?;
    tracing::debug!("State directory: {}", state_dir.display());
    Ok(ClusterRegistry::new(AwsBackend, StateStore::new(state_dir)))
}

/// クラスタ設定を読み込む (明示指定がなければ自動検出)
pub fn load_config(config_file: Option<PathBuf>) -> Result<(ClusterConfig, PathBuf), ConfigError> {
    let path = match config_file {
        Some(path) => path,
        None => clusterflow_config::find_config_file()?,
    };
    let config = ClusterConfig::load(&path)?;
    Ok((config, path))
}

/// 読み込んだ設定ファイルを表示
pub fn print_loaded_config_file(path: &Path) {
    println!("📄 読み込んだ設定ファイル:");
    println!("  • {}", path.display().to_string().cyan());
}

/// ノード数の表示用
pub fn describe_nodes(config: &ClusterConfig) -> String {
    format!(
        "main 1 / CPU worker {} / GPU worker {}",
        config.num_cpu_workers.max(0),
        config.num_gpu_workers.max(0)
    )
}
