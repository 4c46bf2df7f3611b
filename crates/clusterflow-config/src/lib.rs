pub mod error;
pub mod model;

pub use error::*;
pub use model::{ClusterConfig, TimeoutConfig};

use std::path::{Path, PathBuf};

/// 設定ファイル名の候補 (優先順)
const CONFIG_CANDIDATES: [&str; 4] = [
    "cluster-config.local.json",
    "cluster-config.json",
    "cluster-config.yaml",
    "cluster-config.yml",
];

/// プロジェクトローカルのディレクトリ名
pub const PROJECT_DIR: &str = ".clusterflow";

/// ClusterFlowのグローバル設定ディレクトリを取得
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("clusterflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// クラスタ設定ファイルを探す
///
/// 以下の優先順位で設定ファイルを検索:
/// 1. 環境変数 CLUSTERFLOW_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: cluster-config.local.json, cluster-config.json, cluster-config.yaml, cluster-config.yml
/// 3. ./.clusterflow/ ディレクトリ内: 同様の順序
/// 4. ~/.config/clusterflow/cluster-config.json (グローバル設定)
pub fn find_config_file() -> Result<PathBuf> {
    // 1. 環境変数で直接指定
    if let Ok(config_path) = std::env::var("CLUSTERFLOW_CONFIG_PATH") {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            "CLUSTERFLOW_CONFIG_PATH が存在しないファイルを指しています: {}",
            path.display()
        );
    }

    let current_dir = std::env::current_dir()?;

    // 2. カレントディレクトリで検索
    if let Some(path) = first_existing(&current_dir) {
        return Ok(path);
    }

    // 3. ./.clusterflow/ ディレクトリで検索
    let project_dir = current_dir.join(PROJECT_DIR);
    if project_dir.is_dir()
        && let Some(path) = first_existing(&project_dir)
    {
        return Ok(path);
    }

    // 4. グローバル設定ファイル
    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("clusterflow").join("cluster-config.json");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// 状態ディレクトリを決定する
///
/// 明示指定 > CLUSTERFLOW_STATE_DIR > ./.clusterflow
pub fn resolve_state_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }

    if let Ok(dir) = std::env::var("CLUSTERFLOW_STATE_DIR")
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }

    Ok(std::env::current_dir()?.join(PROJECT_DIR))
}
