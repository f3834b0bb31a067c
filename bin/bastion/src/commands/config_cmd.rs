use bastion_core::{Config, Paths};
use std::path::PathBuf;

/// Show the effective configuration as pretty-printed JSON.
pub async fn show(paths: &Paths) -> anyhow::Result<()> {
    let config = super::load_config(paths)?;
    println!("# {}", paths.config_file().display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Load a config file through the same path startup uses, so every error
/// reported here would also stop the runtime.
pub async fn validate(paths: &Paths, path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(|| paths.config_file());
    if !path.exists() {
        anyhow::bail!("{} does not exist", path.display());
    }
    let config = Config::load(&path)?;
    println!("✓ {} is valid", path.display());
    println!(
        "  {} provider(s), {} policy rule(s), default runtime '{}'",
        config.providers.len(),
        config.policy.rules.len(),
        config.sandbox.default_runtime
    );
    Ok(())
}

pub fn path(paths: &Paths) {
    println!("{}", paths.config_file().display());
}
