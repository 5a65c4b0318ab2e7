use anyhow::Result;
use kairo_kernel::kernel::services::resolve_start_order;
use std::path::PathBuf;

pub(crate) fn cmd_services(config_path: Option<PathBuf>) -> Result<()> {
    let config = super::load_config(config_path)?;

    if config.services.is_empty() {
        println!("No services configured");
        return Ok(());
    }

    let order = resolve_start_order(&config.services)?;
    println!("Start order:");
    for (i, id) in order.iter().enumerate() {
        let deps = config
            .services
            .iter()
            .find(|s| &s.id == id)
            .map(|s| s.dependencies.join(", "))
            .unwrap_or_default();
        if deps.is_empty() {
            println!("  {}. {}", i + 1, id);
        } else {
            println!("  {}. {} (after {})", i + 1, id, deps);
        }
    }
    Ok(())
}
