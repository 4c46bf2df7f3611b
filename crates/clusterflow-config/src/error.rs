use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "クラスタ設定ファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: cluster-config.local.json, cluster-config.json, cluster-config.yaml, cluster-config.yml\n\
        - ./.clusterflow/ ディレクトリ\n\
        - ~/.config/clusterflow/cluster-config.json\n\
        または --config-file / CLUSTERFLOW_CONFIG_PATH 環境変数で直接指定できます"
    )]
    ConfigFileNotFound,

    #[error("設定ファイルが存在しません: {path}")]
    MissingFile { path: PathBuf },

    #[error("設定ファイルの解析に失敗しました ({path}): {message}")]
    Parse { path: PathBuf, message: String },

    #[error("未対応の拡張子です: {0} (.json, .yaml, .yml のいずれか)")]
    UnsupportedFormat(String),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
