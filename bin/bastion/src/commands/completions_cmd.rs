use clap::CommandFactory;
use clap_complete::{generate, Shell};

/// Generate shell completion scripts from the real CLI definition.
pub fn run(shell: &str) -> anyhow::Result<()> {
    let shell = match shell.to_lowercase().as_str() {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" | "ps" => Shell::PowerShell,
        "elvish" => Shell::Elvish,
        _ => {
            anyhow::bail!(
                "Unsupported shell: {}. Options: bash, zsh, fish, powershell, elvish",
                shell
            );
        }
    };

    let mut cmd = crate::Cli::command();
    generate(shell, &mut cmd, "bastion", &mut std::io::stdout());

    eprintln!();
    eprintln!("# Usage:");
    match shell {
        Shell::Bash => {
            eprintln!("#   bastion completions bash > ~/.local/share/bash-completion/completions/bastion");
            eprintln!("#   or: eval \"$(bastion completions bash)\"");
        }
        Shell::Zsh => {
            eprintln!("#   bastion completions zsh > ~/.zfunc/_bastion");
            eprintln!("#   Make sure fpath includes ~/.zfunc and run compinit");
        }
        Shell::Fish => {
            eprintln!("#   bastion completions fish > ~/.config/fish/completions/bastion.fish");
        }
        _ => {}
    }

    Ok(())
}
