use bastion_core::{CapabilityKind, Paths};

pub async fn run(paths: &Paths) -> anyhow::Result<()> {
    let config_path = paths.config_file();
    println!("bastion status");
    println!("==============");
    println!();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_path.exists() { "✓" } else { "✗ (defaults)" }
    );
    println!("Workspace: {}", paths.workspace().display());
    println!();

    let config = super::load_config(paths)?;
    let (runtime, report) = super::start_runtime(paths, &config)?;

    for kind in [
        CapabilityKind::Policy,
        CapabilityKind::Runtime,
        CapabilityKind::Provider,
        CapabilityKind::Tool,
        CapabilityKind::Memory,
        CapabilityKind::Channel,
    ] {
        let names = report.loaded_names(kind);
        let shown = if names.is_empty() {
            "-".to_string()
        } else {
            names.join(", ")
        };
        println!("{:<16} {}", format!("{}:", kind), shown);
    }

    if !report.is_clean() {
        println!();
        println!("Failed to load:");
        for failure in &report.failures {
            println!("  ✗ {} '{}': {}", failure.kind, failure.name, failure.reason);
        }
    }

    println!();
    println!("Policy: {} v{}", runtime.policy.name(), runtime.policy.version());
    println!("Circuits:");
    for circuit in runtime.router.circuit_snapshot() {
        let retry = circuit
            .retry_in_ms
            .map(|ms| format!(" (retry in {}s)", ms / 1000))
            .unwrap_or_default();
        println!(
            "  {:<14} {:<10} failures={}{}",
            circuit.provider,
            circuit.status.as_str(),
            circuit.consecutive_failures,
            retry
        );
    }
    Ok(())
}
