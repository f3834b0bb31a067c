use bastion_core::Paths;
use bastion_policy::PolicyContext;

/// Evaluate without executing anything. The decision is printed, not audited.
pub async fn check(paths: &Paths, subject: &str, action: &str) -> anyhow::Result<()> {
    let config = super::load_config(paths)?;
    let (runtime, _) = super::start_runtime(paths, &config)?;
    let subject = super::parse_subject(subject);

    let decision = runtime
        .policy
        .evaluate(&subject, action, &PolicyContext::default());
    println!("{}", decision.explain());
    println!("  reason: {}", decision.reason.as_str());
    if let Some(constraints) = decision.constraints() {
        println!("  constraints: {}", serde_json::to_string(constraints)?);
    }
    Ok(())
}

pub async fn rules(paths: &Paths) -> anyhow::Result<()> {
    let config = super::load_config(paths)?;
    let (runtime, _) = super::start_runtime(paths, &config)?;
    let rules = runtime.policy.describe();

    println!(
        "Policy engine '{}' v{}: {} rule(s), evaluated top to bottom, first match wins",
        runtime.policy.name(),
        runtime.policy.version(),
        rules.len()
    );
    println!();
    for (i, rule) in rules.iter().enumerate() {
        println!(
            "  {:>3}. {:<20} {:<24} {:<24} {}",
            i + 1,
            rule.id,
            rule.subject,
            rule.action,
            rule.effect
        );
    }
    println!("  ---  anything else is denied");
    Ok(())
}
