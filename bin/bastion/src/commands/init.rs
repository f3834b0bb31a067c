use bastion_core::config::{PolicyRuleConfig, RuleEffect};
use bastion_core::types::Constraints;
use bastion_core::{Config, Paths};

/// Config written by `bastion init`: the defaults plus a small rule set so
/// the CLI user can read and write inside the workspace. Everything else
/// stays denied until a rule allows it.
pub fn starter_config(paths: &Paths) -> Config {
    let mut config = Config::default();
    config.policy.rules = vec![
        PolicyRuleConfig {
            id: Some("cli-files".to_string()),
            subject: "cli:*".to_string(),
            action: "fs.*".to_string(),
            effect: RuleEffect::AllowWithConstraints,
            constraints: Some(Constraints {
                path_prefixes: vec![paths.workspace()],
                ..Constraints::default()
            }),
        },
        PolicyRuleConfig {
            id: Some("cli-fetch".to_string()),
            subject: "cli:*".to_string(),
            action: "net.fetch".to_string(),
            effect: RuleEffect::Allow,
            constraints: None,
        },
        PolicyRuleConfig {
            id: Some("no-shell".to_string()),
            subject: "*".to_string(),
            action: "shell.exec".to_string(),
            effect: RuleEffect::Deny,
            constraints: None,
        },
    ];
    config
}

pub async fn run(paths: &Paths, force: bool) -> anyhow::Result<()> {
    let config_path = paths.config_file();
    if config_path.exists() && !force {
        println!("Config already exists at {}", config_path.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }

    paths.ensure_dirs()?;
    let config = starter_config(paths);
    config.validate()?;
    config.save(&config_path)?;

    println!("Created config:    {}", config_path.display());
    println!("Created workspace: {}", paths.workspace().display());
    println!("Plugin tools dir:  {}", paths.plugins_dir().display());
    println!();
    println!("Next steps:");
    println!("  1. Export OPENAI_API_KEY (or edit the providers section)");
    println!("  2. Review the policy rules; unmatched actions are denied");
    println!("  3. Run `bastion agent -m \"hello\"`");
    Ok(())
}
