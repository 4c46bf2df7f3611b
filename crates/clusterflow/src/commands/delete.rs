use crate::utils::Registry;
use clusterflow_registry::RegistryError;
use colored::Colorize;

pub async fn handle(registry: &Registry, name: &str, yes: bool) -> anyhow::Result<()> {
    let descriptor = registry
        .store()
        .descriptor(name)
        .await
        .map_err(|e| RegistryError::State(e.to_string()))?
        .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

    println!("クラスタ: {}", name.cyan());
    println!("リージョン: {}", descriptor.region.cyan());
    println!();

    let order = descriptor.teardown_order();
    println!(
        "{}",
        format!("削除するリソース ({} 個、この順に削除):", order.len()).bold()
    );
    for role in &order {
        if let Some(record) = descriptor.get(*role) {
            let note = if record.managed { "" } else { " (既存のため削除しない)" };
            println!(
                "  • {:<22} {}{}",
                role.to_string().cyan(),
                record.id.dimmed(),
                note
            );
        }
    }

    // 確認（--yesが指定されていない場合）
    if !yes {
        println!();
        println!(
            "{}",
            "警告: クラスタのすべてのリソースを削除します。".yellow()
        );
        println!("実行するには --yes オプションを指定してください");
        return Ok(());
    }

    println!();
    println!("{}", format!("クラスタ {} を削除中...", name).yellow().bold());
    let report = registry.delete(name).await?;

    for role in &report.removed {
        println!("  ✓ {} 削除完了", role);
    }
    println!();
    println!(
        "{}",
        format!("✓ クラスタ {} を削除しました！", report.name).green().bold()
    );

    Ok(())
}
