mod backend;
mod commands;
mod utils;

use clap::{Parser, Subcommand};
use clusterflow_config::ConfigError;
use clusterflow_registry::{ErrorKind, RegistryError};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clusterflow")]
#[command(about = "設定ファイルひとつで、AWS上にKubernetesクラスタを。", long_about = None)]
struct Cli {
    /// 状態ディレクトリ (state.json, kubeconfig, ロックファイル)
    #[arg(long, global = true, env = "CLUSTERFLOW_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// 詳細ログを出力
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// クラスタを作成
    Create {
        /// クラスタ名
        name: String,
        /// 設定ファイル (省略時は自動検出)
        #[arg(short = 'c', long)]
        config_file: Option<PathBuf>,
        /// 途中で止まったクラスタの作成を再開
        #[arg(long)]
        resume: bool,
        /// 作成せずにリソースプランだけを表示
        #[arg(long)]
        dry_run: bool,
    },
    /// クラスタを削除
    Delete {
        /// クラスタ名
        name: String,
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// 登録済みクラスタの一覧を表示
    List {
        /// JSONで出力
        #[arg(long)]
        json: bool,
    },
    /// kubeconfig のパスを表示
    Kubeconfig {
        /// クラスタ名
        name: String,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // 進捗はstdout、ログはstderr
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if matches!(cli.command, Commands::Version) {
        println!("clusterflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let registry = utils::open_registry(cli.state_dir.as_deref())?;

    match cli.command {
        Commands::Create {
            name,
            config_file,
            resume,
            dry_run,
        } => {
            commands::create::handle(&registry, &name, config_file, resume, dry_run).await?;
        }
        Commands::Delete { name, yes } => {
            commands::delete::handle(&registry, &name, yes).await?;
        }
        Commands::List { json } => {
            commands::list::handle(&registry, json).await?;
        }
        Commands::Kubeconfig { name } => {
            commands::kubeconfig::handle(&registry, &name).await?;
        }
        Commands::Version => {
            unreachable!("Version is handled before the registry is opened");
        }
    }

    Ok(())
}

/// エラー種別ごとの終了コードで終了する
fn report(err: &anyhow::Error) -> ExitCode {
    // RegistryError のメッセージは原因を含んでいる
    let (kind, message) = if let Some(e) = err.downcast_ref::<RegistryError>() {
        (Some(e.kind()), e.to_string())
    } else if err.downcast_ref::<ConfigError>().is_some() {
        (Some(ErrorKind::ConfigError), format!("{:#}", err))
    } else {
        (None, format!("{:#}", err))
    };

    let code = match kind {
        Some(kind) => {
            eprintln!("{} {}", format!("Error [{}]:", kind).red().bold(), message);
            kind.exit_code()
        }
        None => {
            eprintln!("{} {}", "Error:".red().bold(), message);
            1
        }
    };

    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
