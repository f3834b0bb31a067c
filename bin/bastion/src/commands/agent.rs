use bastion_agent::SessionManager;
use bastion_core::{Error, InboundMessage, Paths};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Run one turn. Ctrl-C while it runs cancels the turn, including any tool
/// still executing, and leaves the session usable.
async fn turn(sessions: &SessionManager, msg: &InboundMessage) -> anyhow::Result<Option<String>> {
    let key = msg.session_key();
    let handle = sessions.handle(msg);
    tokio::pin!(handle);

    let outcome = tokio::select! {
        outcome = &mut handle => outcome,
        _ = tokio::signal::ctrl_c() => {
            sessions.cancel(&key);
            handle.await
        }
    };
    match outcome {
        Ok(reply) => Ok(Some(reply.content)),
        Err(Error::Cancelled) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn run(
    paths: &Paths,
    message: Option<String>,
    user: &str,
    chat: &str,
) -> anyhow::Result<()> {
    let config = super::load_config(paths)?;
    let (runtime, _report) = super::start_runtime(paths, &config)?;
    let sessions = runtime.sessions.clone();

    if let Some(message) = message {
        let msg = InboundMessage::new("cli", user, chat, &message);
        match turn(&sessions, &msg).await? {
            Some(reply) => println!("{}", reply),
            None => eprintln!("(cancelled)"),
        }
        return Ok(());
    }

    println!("bastion interactive mode. /new starts over, /exit quits, Ctrl-C cancels a running turn.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            "/exit" | "/quit" => break,
            "/new" => {
                let key = InboundMessage::new("cli", user, chat, "").session_key();
                sessions.close(&key).await;
                println!("Started a new session.");
                continue;
            }
            _ => {}
        }

        let msg = InboundMessage::new("cli", user, chat, input);
        match turn(&sessions, &msg).await {
            Ok(Some(reply)) => println!("\n{}\n", reply),
            Ok(None) => println!("(cancelled)"),
            Err(e) => eprintln!("error: {:#}", e),
        }
    }

    sessions.shutdown();
    Ok(())
}
