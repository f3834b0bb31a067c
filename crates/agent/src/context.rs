use bastion_core::config::AgentDefaults;
use bastion_core::types::{ChatMessage, ToolRound, Turn};
use serde_json::Value;

/// Rough token count: about one token per four ASCII word characters, one per
/// separator, one per non-ASCII character. Good enough for budgeting history.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let mut tokens = 0usize;
    let mut word_chars = 0usize;
    for ch in text.chars() {
        if ch.is_ascii() && !ch.is_ascii_whitespace() && !ch.is_ascii_punctuation() {
            word_chars += 1;
            continue;
        }
        if word_chars > 0 {
            tokens += 1 + word_chars / 4;
            word_chars = 0;
        }
        tokens += 1;
    }
    if word_chars > 0 {
        tokens += 1 + word_chars / 4;
    }
    tokens
}

pub fn estimate_message_tokens(msg: &ChatMessage) -> usize {
    let content = match &msg.content {
        Value::String(s) => estimate_tokens(s),
        Value::Null => 0,
        other => estimate_tokens(&other.to_string()),
    };
    let calls = msg.tool_calls.as_ref().map_or(0, |calls| {
        calls
            .iter()
            .map(|c| estimate_tokens(&c.name) + estimate_tokens(&c.arguments.to_string()) + 10)
            .sum()
    });
    // role markers
    content + calls + 4
}

fn estimate_all(messages: &[ChatMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Assembles the model context for one generation step.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    system_prompt: String,
    max_context_tokens: usize,
    recent_turns: usize,
}

impl ContextBuilder {
    pub fn new(system_prompt: &str, max_context_tokens: usize, recent_turns: usize) -> Self {
        Self {
            system_prompt: system_prompt.to_string(),
            max_context_tokens,
            recent_turns,
        }
    }

    pub fn from_defaults(defaults: &AgentDefaults) -> Self {
        Self::new(
            &defaults.system_prompt,
            defaults.max_context_tokens as usize,
            defaults.recent_turns,
        )
    }

    /// System prompt and recalled memory, then as many recent turns as fit,
    /// then the current input with the rounds executed so far.
    ///
    /// History is trimmed a whole turn at a time so tool calls never lose
    /// their results. A turn that does not fit in full is replaced by its
    /// input and reply alone.
    pub fn build(
        &self,
        history: &[Turn],
        recalled: &[String],
        input: &str,
        rounds: &[ToolRound],
    ) -> Vec<ChatMessage> {
        let mut system = self.system_prompt.clone();
        if !recalled.is_empty() {
            system.push_str("\n\n## Relevant memory\n");
            for item in recalled {
                system.push_str("- ");
                system.push_str(item);
                system.push('\n');
            }
        }

        let mut current = vec![ChatMessage::user(input)];
        for round in rounds {
            current.extend(round.to_messages());
        }

        let fixed = estimate_message_tokens(&ChatMessage::system(&system)) + estimate_all(&current);
        let mut remaining = self.max_context_tokens.saturating_sub(fixed);

        let start = history.len().saturating_sub(self.recent_turns);
        let mut kept: Vec<Vec<ChatMessage>> = Vec::new();
        for turn in history[start..].iter().rev() {
            let full = turn.to_messages();
            let cost = estimate_all(&full);
            if cost <= remaining {
                remaining -= cost;
                kept.push(full);
                continue;
            }
            let compact = vec![ChatMessage::user(&turn.input), ChatMessage::assistant(&turn.reply)];
            let cost = estimate_all(&compact);
            if cost > remaining {
                break;
            }
            remaining -= cost;
            kept.push(compact);
        }

        let mut messages = vec![ChatMessage::system(&system)];
        for turn in kept.into_iter().rev() {
            messages.extend(turn);
        }
        messages.extend(current);
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::types::{ToolCallRequest, ToolInvocation, ToolResult};
    use serde_json::json;

    fn turn(i: usize, with_tool: bool) -> Turn {
        let rounds = if with_tool {
            let call = ToolCallRequest {
                id: format!("call-{}", i),
                name: "read_file".into(),
                arguments: json!({"path": "notes.txt"}),
            };
            let inv = ToolInvocation::new(&format!("t{}", i), &call);
            let result = ToolResult::success(&inv, json!("x".repeat(400)));
            vec![ToolRound {
                assistant_content: None,
                invocations: vec![inv],
                results: vec![result],
            }]
        } else {
            Vec::new()
        };
        Turn {
            id: format!("t{}", i),
            input: format!("question {}", i),
            rounds,
            reply: format!("answer {}", i),
            started_at_ms: 0,
            finished_at_ms: 0,
            budget_exhausted: false,
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert!(estimate_tokens("hello world") >= 2);
        assert_eq!(estimate_tokens("你好"), 2);
    }

    #[test]
    fn test_layout_order() {
        let b = ContextBuilder::new("sys", 10_000, 10);
        let history = vec![turn(1, false)];
        let msgs = b.build(&history, &["likes tea".to_string()], "now", &[]);
        assert_eq!(msgs[0].role, "system");
        assert!(msgs[0].text_content().contains("likes tea"));
        assert_eq!(msgs[1].text_content(), "question 1");
        assert_eq!(msgs[2].text_content(), "answer 1");
        assert_eq!(msgs.last().unwrap().text_content(), "now");
    }

    #[test]
    fn test_recent_turns_cap() {
        let b = ContextBuilder::new("sys", 100_000, 2);
        let history: Vec<Turn> = (0..5).map(|i| turn(i, false)).collect();
        let msgs = b.build(&history, &[], "now", &[]);
        // system + 2 turns * 2 + input
        assert_eq!(msgs.len(), 6);
        assert_eq!(msgs[1].text_content(), "question 3");
    }

    #[test]
    fn test_oversized_turn_compacted_without_orphans() {
        let b = ContextBuilder::new("sys", 80, 10);
        let history = vec![turn(1, true)];
        let msgs = b.build(&history, &[], "now", &[]);
        assert!(msgs.iter().all(|m| m.role != "tool"));
        assert!(msgs.iter().all(|m| m.tool_calls.is_none()));
        assert_eq!(msgs[1].text_content(), "question 1");
    }

    #[test]
    fn test_current_rounds_always_included() {
        let b = ContextBuilder::new("sys", 10, 10);
        let current = turn(9, true).rounds;
        let msgs = b.build(&[turn(1, false)], &[], "now", &current);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[1].text_content(), "now");
        assert_eq!(msgs[3].role, "tool");
    }
}
