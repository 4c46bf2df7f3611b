use crate::utils::Registry;
use clusterflow_registry::ClusterStatus;
use colored::Colorize;

pub async fn handle(registry: &Registry, json: bool) -> anyhow::Result<()> {
    let clusters = registry.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&clusters)?);
        return Ok(());
    }

    println!("{}", "Clusters:".bold());
    if clusters.is_empty() {
        println!("  {}", "(なし)".dimmed());
        return Ok(());
    }

    for cluster in &clusters {
        let status = match cluster.status {
            ClusterStatus::Ready => cluster.status.to_string().green(),
            ClusterStatus::Degraded => cluster.status.to_string().red(),
            ClusterStatus::Provisioning | ClusterStatus::Deleting => {
                cluster.status.to_string().yellow()
            }
        };
        println!(
            "  {:<16} {:<14} {:<14} {:<16} {}",
            cluster.name.cyan(),
            status,
            cluster.region,
            cluster.main_ip.as_deref().unwrap_or("-"),
            format!(
                "{} resources, {} nodes, {}",
                cluster.resources,
                cluster.instances,
                cluster.created_at.format("%Y-%m-%d %H:%M")
            )
            .dimmed()
        );
    }

    Ok(())
}
