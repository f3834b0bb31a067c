use bastion_core::types::{ToolCallRequest, ToolInvocation};
use bastion_core::{Paths, Subject};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// List every registered tool with the action policy rules must name.
pub async fn list(paths: &Paths) -> anyhow::Result<()> {
    let config = super::load_config(paths)?;
    let (runtime, _) = super::start_runtime(paths, &config)?;
    let tools = runtime.sandbox.tools();

    println!();
    println!("🔧 Registered tools ({} total)", tools.len());
    println!();
    println!("  {:<16} {:<12} {:<10} DESCRIPTION", "NAME", "ACTION", "RUNTIME");
    for name in tools.tool_names() {
        let Some(tool) = tools.get(&name) else {
            continue;
        };
        let schema = tool.schema();
        let short_desc: String = schema.description.chars().take(50).collect();
        let ellipsis = if schema.description.chars().count() > 50 { "..." } else { "" };
        println!(
            "  {:<16} {:<12} {:<10} {}{}",
            name,
            tool.action(),
            tool.runtime().unwrap_or("-"),
            short_desc,
            ellipsis
        );
    }
    println!();
    println!("Runtimes: {}", runtime.sandbox.runtime_names().join(", "));
    Ok(())
}

/// Run one invocation through the full sandbox pipeline: validation, policy,
/// audit, runtime. Ctrl-C cancels it.
pub async fn call(paths: &Paths, name: &str, params: &str, user: &str) -> anyhow::Result<()> {
    let params: Value = serde_json::from_str(params)
        .map_err(|e| anyhow::anyhow!("parameters must be a JSON object: {}", e))?;

    let config = super::load_config(paths)?;
    let (runtime, _) = super::start_runtime(paths, &config)?;

    let request = ToolCallRequest {
        id: format!("cli_{}", uuid::Uuid::new_v4().simple()),
        name: name.to_string(),
        arguments: params,
    };
    let turn_id = uuid::Uuid::new_v4().to_string();
    let invocation = ToolInvocation::new(&turn_id, &request);
    let subject = Subject::new("cli", user);
    let session_key = format!("cli:{}", user);

    let cancel = CancellationToken::new();
    let invoke = runtime
        .sandbox
        .invoke(&invocation, &subject, Some(&session_key), &cancel);
    tokio::pin!(invoke);
    let result = tokio::select! {
        result = &mut invoke => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            invoke.await
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    if let Some(kind) = result.error_kind() {
        anyhow::bail!("{} failed: {}", name, kind);
    }
    Ok(())
}
