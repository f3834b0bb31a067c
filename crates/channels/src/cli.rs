use async_trait::async_trait;
use bastion_core::{Error, InboundMessage, OutboundMessage, Result};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{Channel, ChannelHealth};

type Input = Lines<Box<dyn AsyncBufRead + Send + Unpin>>;
type Output = Box<dyn AsyncWrite + Send + Unpin>;

/// Line-oriented channel over a reader and a writer (stdin/stdout by default).
/// Every line is one inbound message from the configured user.
pub struct CliChannel {
    user: String,
    chat_id: String,
    input: Mutex<Option<Input>>,
    output: Mutex<Output>,
}

impl CliChannel {
    pub fn new(
        user: &str,
        chat_id: &str,
        input: Box<dyn AsyncBufRead + Send + Unpin>,
        output: Output,
    ) -> Self {
        Self {
            user: user.to_string(),
            chat_id: chat_id.to_string(),
            input: Mutex::new(Some(input.lines())),
            output: Mutex::new(output),
        }
    }

    pub fn stdio(user: &str, chat_id: &str) -> Self {
        Self::new(
            user,
            chat_id,
            Box::new(BufReader::new(tokio::io::stdin())),
            Box::new(tokio::io::stdout()),
        )
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let mut out = self.output.lock().await;
        out.write_all(msg.content.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await.map_err(|e| Error::Channel(format!("cli write failed: {}", e)))
    }

    /// Input can be read once. After end of input, and on later calls, the
    /// stream stays pending instead of ending so the manager does not spin.
    async fn listen(&self) -> Result<BoxStream<'static, InboundMessage>> {
        let Some(lines) = self.input.lock().await.take() else {
            return Ok(stream::pending().boxed());
        };
        let user = self.user.clone();
        let chat_id = self.chat_id.clone();
        let messages = stream::unfold(lines, move |mut lines| {
            let user = user.clone();
            let chat_id = chat_id.clone();
            async move {
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let text = line.trim();
                            if text.is_empty() {
                                continue;
                            }
                            return Some((InboundMessage::new("cli", &user, &chat_id, text), lines));
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            warn!(error = %e, "cli input failed");
                            return None;
                        }
                    }
                }
            }
        });
        Ok(messages.chain(stream::pending()).boxed())
    }

    async fn health_check(&self) -> ChannelHealth {
        ChannelHealth::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lines_become_messages() {
        let input: &'static [u8] = b"hello\n\n  second  \n";
        let channel = CliChannel::new("alice", "term", Box::new(BufReader::new(input)), Box::new(tokio::io::sink()));
        let mut stream = channel.listen().await.unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.content, "hello");
        assert_eq!(first.session_key(), "cli:term");
        assert_eq!(first.subject().id(), "cli:alice");
        assert_eq!(stream.next().await.unwrap().content, "second");

        // End of input does not end the stream.
        let next = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_send_writes_line() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let channel = CliChannel::new("u", "c", Box::new(BufReader::new(&b""[..])), Box::new(writer));
        channel.send(&OutboundMessage::new("cli", "c", "reply")).await.unwrap();
        let mut buf = vec![0u8; 6];
        tokio::io::AsyncReadExt::read_exact(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf, b"reply\n");
    }
}
