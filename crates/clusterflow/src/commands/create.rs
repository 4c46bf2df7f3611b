use crate::backend::AwsBackend;
use crate::utils::{self, Registry};
use clusterflow_cloud::{CloudProvider, ResourceSpec};
use clusterflow_registry::{Backend, CreateOptions};
use colored::Colorize;
use std::path::PathBuf;

pub async fn handle(
    registry: &Registry,
    name: &str,
    config_file: Option<PathBuf>,
    resume: bool,
    dry_run: bool,
) -> anyhow::Result<()> {
    let (config, path) = utils::load_config(config_file)?;
    utils::print_loaded_config_file(&path);
    println!("クラスタ: {}", name.cyan());
    println!("リージョン: {}", config.region.cyan());
    println!("ノード: {}", utils::describe_nodes(&config));

    // 設定の誤りはここで検出される (クラウドには触れない)
    let (plan, summary) = registry.plan(name, &config).await?;

    if dry_run {
        println!();
        println!(
            "{}",
            format!("リソースプラン ({} 個):", plan.steps.len()).bold()
        );
        for step in &plan.steps {
            println!(
                "  • {:<22} {}",
                step.role.to_string().cyan(),
                describe_spec(&step.spec).dimmed()
            );
        }
        println!();
        println!("{}", summary.to_string().bold());
        println!("{}", "  --dry-run のため何も作成していません".dimmed());
        return Ok(());
    }

    println!();
    println!("{}", "AWSに接続中...".blue());
    let provider = AwsBackend.provider(&config.region).await;
    match provider.check_auth().await {
        Ok(status) if status.authenticated => {
            println!(
                "  ✓ 認証OK ({})",
                status.account_info.unwrap_or_default().dimmed()
            );
        }
        Ok(status) => {
            println!(
                "  ⚠ 認証を確認できません: {}",
                status.error.unwrap_or_default()
            );
        }
        Err(e) => println!("  ⚠ 認証を確認できません: {}", e),
    }

    println!();
    if resume {
        println!("{}", format!("クラスタ {} の作成を再開します...", name).yellow().bold());
    } else {
        println!("{}", format!("クラスタ {} を作成中...", name).yellow().bold());
    }
    println!("  {}", summary.to_string().dimmed());

    let report = registry
        .create(name, &config, CreateOptions { resume })
        .await?;

    println!();
    println!("{}", format!("ノード ({} 台):", report.nodes.len()).bold());
    for (role, status) in &report.nodes {
        println!("  ✓ {:<20} {}", role.to_string().cyan(), status);
    }

    println!();
    println!(
        "{}",
        format!("✓ クラスタ {} を作成しました！", name).green().bold()
    );
    println!(
        "kubeconfig: {}",
        report.kubeconfig_path.display().to_string().cyan()
    );
    println!();
    println!("{}", "次のコマンドでクラスタを操作できます:".bold());
    println!(
        "  export KUBECONFIG={}",
        report.kubeconfig_path.display()
    );
    println!("  {} get nodes", "kubectl".cyan());

    Ok(())
}

/// プラン表示用の短い説明
fn describe_spec(spec: &ResourceSpec) -> String {
    match spec {
        ResourceSpec::Vpc { cidr_block } => cidr_block.clone(),
        ResourceSpec::Subnet {
            cidr_block,
            availability_zone,
        } => format!("{} ({})", cidr_block, availability_zone),
        ResourceSpec::InternetGateway => "-".to_string(),
        ResourceSpec::RouteTable { destination } => format!("{} → igw", destination),
        ResourceSpec::SecurityGroup { ingress, .. } => format!("{} ingress rules", ingress.len()),
        ResourceSpec::KeyPair { key_name, .. } => key_name.clone(),
        ResourceSpec::Instance(instance) => {
            format!("{} {}", instance.instance_type, instance.node_role)
        }
    }
}
