use crate::utils::Registry;

/// パスだけを出力する (`export KUBECONFIG=$(clusterflow kubeconfig NAME)`)
pub async fn handle(registry: &Registry, name: &str) -> anyhow::Result<()> {
    let path = registry.kubeconfig(name).await?;
    println!("{}", path.display());
    Ok(())
}
