use bastion_core::config::{AgentDefaults, MemoryConfig};
use bastion_core::types::{
    GenerationParams, ProviderRequest, ProviderResponse, ToolCallRequest, ToolInvocation, ToolResult,
    ToolRound, Turn,
};
use bastion_core::{Error, MemoryError, Result, RouterError, Subject, ToolError, ToolErrorKind};
use bastion_providers::ProviderRouter;
use bastion_storage::{MemoryStore, WriteMode};
use bastion_tools::ToolSandbox;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::ContextBuilder;
use crate::session::{AgentSession, Phase};

pub const PROVIDER_UNAVAILABLE_REPLY: &str =
    "Sorry, I could not reach a language model right now. Please try again in a moment.";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Provider names in preference order. Empty uses the router default.
    pub preference: Vec<String>,
    pub params: GenerationParams,
    pub recall_k: usize,
    pub memory_timeout: Duration,
    pub remember_turns: bool,
    pub write_mode: WriteMode,
}

impl OrchestratorSettings {
    pub fn new(defaults: &AgentDefaults, memory: &MemoryConfig, preference: Vec<String>) -> Self {
        Self {
            preference,
            params: GenerationParams {
                model: defaults.model.clone(),
                max_tokens: defaults.max_tokens,
                temperature: defaults.temperature,
            },
            recall_k: defaults.recall_k,
            memory_timeout: Duration::from_millis(defaults.memory_timeout_ms),
            remember_turns: defaults.remember_turns,
            write_mode: if memory.allow_eviction {
                WriteMode::AllowEviction
            } else {
                WriteMode::Strict
            },
        }
    }
}

/// Drives one session through generation and tool rounds until a reply.
pub struct Orchestrator {
    router: Arc<ProviderRouter>,
    sandbox: Arc<ToolSandbox>,
    memory: Option<MemoryStore>,
    context: ContextBuilder,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        router: Arc<ProviderRouter>,
        sandbox: Arc<ToolSandbox>,
        memory: Option<MemoryStore>,
        context: ContextBuilder,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            router,
            sandbox,
            memory,
            context,
            settings,
        }
    }

    pub fn sandbox(&self) -> &Arc<ToolSandbox> {
        &self.sandbox
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    /// Answer one inbound message. On success the turn is appended to the
    /// session and the session is left in `Responding` until delivery.
    ///
    /// Tool calls are authorized as `subject`, the sender of this message,
    /// which need not be whoever opened the session.
    ///
    /// Cancellation abandons the turn: nothing is appended and in-flight tools
    /// and memory calls are stopped.
    pub async fn handle_turn(
        &self,
        session: &mut AgentSession,
        subject: &Subject,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<Turn> {
        session.enter(Phase::Generating)?;
        session.touch();

        let budget = session.budget();
        let turn_id = uuid::Uuid::new_v4().to_string();
        let started_at_ms = chrono::Utc::now().timestamp_millis();
        let deadline = Instant::now() + budget.max_wall_clock;
        let turn_cancel = cancel.child_token();

        let Some(recalled) = self.recall(session.key(), input, &turn_cancel).await else {
            session.abort_turn();
            return Err(Error::Cancelled);
        };
        let tools = self.sandbox.tools().get_tool_schemas();

        let mut rounds: Vec<ToolRound> = Vec::new();
        let mut calls_used: u32 = 0;
        let mut budget_exhausted = false;

        let reply = loop {
            let request = ProviderRequest {
                messages: self.context.build(session.turns(), &recalled, input, &rounds),
                tools: tools.clone(),
                params: self.settings.params.clone(),
            };

            let routed = tokio::time::timeout_at(
                deadline,
                self.router.send(&request, &self.settings.preference, &turn_cancel),
            )
            .await;
            let routed = match routed {
                Err(_) => {
                    turn_cancel.cancel();
                    warn!(session = %session.key(), "Turn exceeded its wall-clock budget while generating");
                    session.enter(Phase::Responding)?;
                    break wall_clock_notice(budget.max_wall_clock, rounds.last());
                }
                Ok(Err(RouterError::Cancelled)) => {
                    session.abort_turn();
                    return Err(Error::Cancelled);
                }
                Ok(Err(e)) => {
                    error!(session = %session.key(), error = %e, "No provider could answer");
                    session.enter(Phase::Responding)?;
                    break PROVIDER_UNAVAILABLE_REPLY.to_string();
                }
                Ok(Ok(routed)) => routed,
            };
            debug!(session = %session.key(), provider = %routed.provider, attempts = routed.attempts, "Provider responded");

            let (content, calls) = match routed.response {
                ProviderResponse::Reply { content, .. } => {
                    session.enter(Phase::Responding)?;
                    break content;
                }
                ProviderResponse::ToolCalls { content, calls, .. } if calls.is_empty() => {
                    session.enter(Phase::Responding)?;
                    break content.unwrap_or_default();
                }
                ProviderResponse::ToolCalls { content, calls, .. } => (content, calls),
            };

            session.enter(Phase::ExecutingTools)?;
            let remaining = budget.max_tool_calls.saturating_sub(calls_used) as usize;
            let (round, timed_out) = self
                .execute_round(session, subject, &turn_id, content, &calls, remaining, deadline, &turn_cancel)
                .await;
            if cancel.is_cancelled() {
                session.abort_turn();
                return Err(Error::Cancelled);
            }

            calls_used += round.invocations.len().min(remaining) as u32;
            let notice_source = round.assistant_content.clone();
            rounds.push(round);

            if timed_out {
                warn!(session = %session.key(), "Turn exceeded its wall-clock budget while running tools");
                session.enter(Phase::Responding)?;
                break wall_clock_notice(budget.max_wall_clock, rounds.last());
            }
            if calls.len() > remaining || calls_used >= budget.max_tool_calls {
                budget_exhausted = true;
                warn!(session = %session.key(), calls_used, limit = budget.max_tool_calls, "Tool-call budget exhausted");
                session.enter(Phase::Responding)?;
                break budget_notice(budget.max_tool_calls, notice_source.as_deref());
            }
            session.enter(Phase::Generating)?;
        };

        let turn = Turn {
            id: turn_id,
            input: input.to_string(),
            rounds,
            reply,
            started_at_ms,
            finished_at_ms: chrono::Utc::now().timestamp_millis(),
            budget_exhausted,
        };
        if !self.remember(session.key(), &turn, cancel).await {
            session.abort_turn();
            return Err(Error::Cancelled);
        }
        info!(
            session = %session.key(),
            turn = %turn.id,
            tool_calls = turn.tool_calls(),
            budget_exhausted,
            "Turn complete"
        );
        session.append_turn(turn.clone());
        Ok(turn)
    }

    /// Run the calls that fit the budget concurrently. Calls past the budget
    /// get a synthesized result so every provider call is answered. Results
    /// come back in call order.
    #[allow(clippy::too_many_arguments)]
    async fn execute_round(
        &self,
        session: &AgentSession,
        subject: &Subject,
        turn_id: &str,
        content: Option<String>,
        calls: &[ToolCallRequest],
        remaining: usize,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> (ToolRound, bool) {
        let invocations: Vec<ToolInvocation> =
            calls.iter().map(|c| ToolInvocation::new(turn_id, c)).collect();
        let runnable = invocations.len().min(remaining);
        debug!(session = %session.key(), calls = invocations.len(), runnable, "Executing tool round");

        let (mut results, timed_out) = {
            let batch = join_all(
                invocations[..runnable]
                    .iter()
                    .map(|inv| self.sandbox.invoke(inv, subject, Some(session.key()), cancel)),
            );
            tokio::pin!(batch);
            tokio::select! {
                results = &mut batch => (results, false),
                _ = tokio::time::sleep_until(deadline) => {
                    cancel.cancel();
                    (batch.await, true)
                }
            }
        };

        for inv in &invocations[runnable..] {
            results.push(ToolResult::failure(
                inv,
                ToolError::new(
                    ToolErrorKind::ResourceLimitExceeded,
                    "tool-call budget for this message is exhausted",
                ),
            ));
        }

        (
            ToolRound {
                assistant_content: content,
                invocations,
                results,
            },
            timed_out,
        )
    }

    /// Records from this session and unscoped ones. `None` when the turn was
    /// cancelled before recall finished.
    async fn recall(
        &self,
        session_key: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> Option<Vec<String>> {
        let Some(store) = &self.memory else {
            return Some(Vec::new());
        };
        if self.settings.recall_k == 0 {
            return Some(Vec::new());
        }
        let k = self.settings.recall_k;
        let recall = tokio::time::timeout(self.settings.memory_timeout, async {
            let recall = store.recall_text(input, k, Some(session_key)).await?;
            Ok::<_, MemoryError>(recall.map(|scored| scored.record.text).collect::<Vec<_>>())
        });
        let recalled = tokio::select! {
            recalled = recall => recalled,
            _ = cancel.cancelled() => {
                debug!(session = %session_key, "Memory recall abandoned by cancellation");
                return None;
            }
        };
        Some(match recalled {
            Ok(Ok(texts)) => texts,
            Ok(Err(e)) => {
                warn!(error = %e, "Memory recall failed; continuing without it");
                Vec::new()
            }
            Err(_) => {
                warn!(timeout_ms = self.settings.memory_timeout.as_millis() as u64, "Memory recall timed out");
                Vec::new()
            }
        })
    }

    /// Write failures are logged and swallowed. Returns false only when the
    /// turn was cancelled during the write.
    async fn remember(&self, session_key: &str, turn: &Turn, cancel: &CancellationToken) -> bool {
        let Some(store) = &self.memory else {
            return true;
        };
        if !self.settings.remember_turns {
            return true;
        }
        let text = format!("User: {}\nAssistant: {}", turn.input, turn.reply);
        let metadata = json!({ "turnId": turn.id });
        let write = tokio::time::timeout(
            self.settings.memory_timeout,
            store.remember_text(&text, Some(session_key), metadata, self.settings.write_mode),
        );
        let written = tokio::select! {
            written = write => written,
            _ = cancel.cancelled() => {
                debug!(session = %session_key, "Memory write abandoned by cancellation");
                return false;
            }
        };
        match written {
            Ok(Ok(id)) => debug!(session = %session_key, record = %id, "Turn remembered"),
            Ok(Err(MemoryError::CapacityExceeded { capacity })) => {
                warn!(session = %session_key, capacity, "Memory full; turn not remembered")
            }
            Ok(Err(e)) => warn!(session = %session_key, error = %e, "Failed to remember turn"),
            Err(_) => warn!(session = %session_key, "Memory write timed out"),
        }
        true
    }
}

fn budget_notice(limit: u32, content: Option<&str>) -> String {
    let notice = format!(
        "I reached the limit of {} tool calls for this message and stopped. Ask me to continue if you want me to keep going.",
        limit
    );
    match content.map(str::trim).filter(|c| !c.is_empty()) {
        Some(text) => format!("{}\n\n{}", text, notice),
        None => notice,
    }
}

fn wall_clock_notice(limit: Duration, last: Option<&ToolRound>) -> String {
    let notice = format!(
        "I ran out of time ({}s) while working on this message and stopped.",
        limit.as_secs()
    );
    match last.and_then(|r| r.assistant_content.as_deref()).map(str::trim).filter(|c| !c.is_empty()) {
        Some(text) => format!("{}\n\n{}", text, notice),
        None => notice,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::session::Budget;
    use async_trait::async_trait;
    use bastion_core::types::ToolOutcome;
    use bastion_storage::{
        AuditEvent, EvictionPolicy, HashingEmbedder, InMemoryBackend, MemoryBackend, MemoryRecord, Recall,
    };
    use std::sync::atomic::Ordering;

    fn user() -> Subject {
        Subject::new("cli", "user")
    }

    fn session(max_tool_calls: u32, wall_clock_secs: u64) -> AgentSession {
        AgentSession::new(
            "cli:default",
            user(),
            Budget {
                max_tool_calls,
                max_wall_clock: Duration::from_secs(wall_clock_secs),
            },
        )
    }

    #[tokio::test]
    async fn test_plain_reply() {
        let provider = ScriptedProvider::new(vec![ProviderResponse::reply("hello")]);
        let f = fixture(provider.clone(), None);
        let mut s = session(5, 60);
        let turn = f.orchestrator.handle_turn(&mut s, &user(), "hi", &CancellationToken::new()).await.unwrap();
        assert_eq!(turn.reply, "hello");
        assert!(turn.rounds.is_empty());
        assert_eq!(s.phase(), Phase::Responding);
        assert_eq!(s.turns().len(), 1);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_merge_in_invocation_order() {
        let provider = ScriptedProvider::new(vec![
            tool_calls(&[
                ("c1", "delay", json!({"ms": 300, "tag": "first"})),
                ("c2", "delay", json!({"ms": 10, "tag": "second"})),
                ("c3", "delay", json!({"ms": 100, "tag": "third"})),
            ]),
            ProviderResponse::reply("done"),
        ]);
        let f = fixture(provider.clone(), None);
        let mut s = session(10, 60);
        let turn = f.orchestrator.handle_turn(&mut s, &user(), "go", &CancellationToken::new()).await.unwrap();

        let round = &turn.rounds[0];
        let tags: Vec<_> = round.results.iter().map(|r| r.output.as_str().unwrap().to_string()).collect();
        assert_eq!(tags, vec!["first", "second", "third"]);
        for (inv, res) in round.invocations.iter().zip(&round.results) {
            assert_eq!(inv.id, res.invocation_id);
            assert_eq!(inv.turn_id, turn.id);
        }

        // The second generation saw the tool results, paired by call id.
        let requests = provider.requests.lock().unwrap();
        let tool_msgs: Vec<_> = requests[1].messages.iter().filter(|m| m.role == "tool").collect();
        assert_eq!(tool_msgs.len(), 3);
        assert_eq!(tool_msgs[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tool_msgs[2].tool_call_id.as_deref(), Some("c3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_runs_concurrently() {
        let provider = ScriptedProvider::new(vec![
            tool_calls(&[
                ("c1", "delay", json!({"ms": 1000, "tag": "a"})),
                ("c2", "delay", json!({"ms": 1000, "tag": "b"})),
            ]),
            ProviderResponse::reply("done"),
        ]);
        let f = fixture(provider, None);
        let mut s = session(10, 60);
        let started = Instant::now();
        f.orchestrator.handle_turn(&mut s, &user(), "go", &CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_forces_responding() {
        // The model asks for tools forever.
        let provider = ScriptedProvider::new(vec![tool_calls(&[("c", "delay", json!({"ms": 1, "tag": "x"}))])]);
        let f = fixture(provider.clone(), None);
        let mut s = session(3, 600);
        let turn = f.orchestrator.handle_turn(&mut s, &user(), "loop", &CancellationToken::new()).await.unwrap();

        assert!(turn.budget_exhausted);
        assert_eq!(turn.tool_calls(), 3);
        assert_eq!(f.delay.runs.load(Ordering::SeqCst), 3);
        assert_eq!(provider.calls(), 3);
        assert!(turn.reply.contains("limit of 3 tool calls"));
        assert_eq!(s.phase(), Phase::Responding);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_past_budget_get_synthesized_results() {
        let provider = ScriptedProvider::new(vec![tool_calls(&[
            ("c1", "delay", json!({"ms": 1, "tag": "a"})),
            ("c2", "delay", json!({"ms": 1, "tag": "b"})),
            ("c3", "delay", json!({"ms": 1, "tag": "c"})),
        ])]);
        let f = fixture(provider, None);
        let mut s = session(2, 600);
        let turn = f.orchestrator.handle_turn(&mut s, &user(), "go", &CancellationToken::new()).await.unwrap();

        let round = &turn.rounds[0];
        assert_eq!(round.results.len(), 3);
        assert!(round.results[0].is_success());
        assert!(round.results[1].is_success());
        assert_eq!(round.results[2].error_kind(), Some(ToolErrorKind::ResourceLimitExceeded));
        assert_eq!(f.delay.runs.load(Ordering::SeqCst), 2);
        assert!(turn.budget_exhausted);
    }

    #[tokio::test]
    async fn test_router_exhaustion_yields_apology() {
        let f = fixture(Arc::new(DownProvider), None);
        let mut s = session(5, 60);
        let turn = f.orchestrator.handle_turn(&mut s, &user(), "hi", &CancellationToken::new()).await.unwrap();
        assert_eq!(turn.reply, PROVIDER_UNAVAILABLE_REPLY);
        assert_eq!(s.turns().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_tools_and_appends_nothing() {
        let provider = ScriptedProvider::new(vec![
            tool_calls(&[("c1", "delay", json!({"ms": 3_600_000, "tag": "slow"}))]),
            ProviderResponse::reply("never"),
        ]);
        let f = fixture(provider, None);
        let mut s = session(5, 7200);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = f.orchestrator.handle_turn(&mut s, &user(), "go", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(s.turns().is_empty());
        assert_eq!(s.phase(), Phase::AwaitingInput);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_budget_cancels_tools() {
        let provider = ScriptedProvider::new(vec![
            tool_calls(&[("c1", "delay", json!({"ms": 3_600_000, "tag": "slow"}))]),
            ProviderResponse::reply("never"),
        ]);
        let f = fixture(provider.clone(), None);
        let mut s = session(5, 10);
        let turn = f.orchestrator.handle_turn(&mut s, &user(), "go", &CancellationToken::new()).await.unwrap();
        assert!(turn.reply.contains("ran out of time"));
        assert!(matches!(turn.rounds[0].results[0].outcome, ToolOutcome::Failure { .. }));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_budget_bounds_generation() {
        let provider = ScriptedProvider::with_delay(vec![ProviderResponse::reply("late")], Duration::from_secs(30));
        let f = fixture(provider, None);
        let mut s = session(5, 5);
        let turn = f.orchestrator.handle_turn(&mut s, &user(), "go", &CancellationToken::new()).await.unwrap();
        assert!(turn.reply.contains("ran out of time"));
    }

    #[tokio::test]
    async fn test_turns_are_remembered_and_recalled() {
        let store = MemoryStore::new(
            Arc::new(InMemoryBackend::new(100, EvictionPolicy::Lru)),
            Arc::new(HashingEmbedder::new(64)),
        );
        let provider = ScriptedProvider::new(vec![ProviderResponse::reply("noted, you like green tea")]);
        let f = fixture(provider.clone(), Some(store.clone()));
        let mut s = session(5, 60);
        f.orchestrator
            .handle_turn(&mut s, &user(), "remember that I like green tea", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.len().await.unwrap(), 1);

        s.enter(Phase::AwaitingInput).unwrap();
        f.orchestrator
            .handle_turn(&mut s, &user(), "what tea do I like", &CancellationToken::new())
            .await
            .unwrap();
        let requests = provider.requests.lock().unwrap();
        assert!(requests[1].messages[0].text_content().contains("green tea"));
    }

    #[tokio::test]
    async fn test_tool_decisions_are_audited() {
        let provider = ScriptedProvider::new(vec![
            tool_calls(&[("c1", "delay", json!({"ms": 1, "tag": "a"}))]),
            ProviderResponse::reply("done"),
        ]);
        let f = fixture(provider, None);
        let mut s = session(5, 60);
        let turn = f.orchestrator.handle_turn(&mut s, &user(), "go", &CancellationToken::new()).await.unwrap();
        let inv = &turn.rounds[0].invocations[0];
        let events = f.audit.events();
        let decision = bastion_storage::authorizing_decision(&events, &inv.id).unwrap();
        assert_eq!(turn.rounds[0].results[0].decision_id.as_deref(), Some(decision.id.as_str()));
    }

    #[tokio::test]
    async fn test_tools_run_as_the_message_sender() {
        let provider = ScriptedProvider::new(vec![
            tool_calls(&[("c1", "delay", json!({"ms": 1, "tag": "a"}))]),
            ProviderResponse::reply("done"),
        ]);
        let f = fixture(provider, None);
        // Opened by cli:user, but this message comes from someone the rules do not cover.
        let mut s = session(5, 60);
        let guest = Subject::new("web", "guest");
        let turn = f.orchestrator.handle_turn(&mut s, &guest, "go", &CancellationToken::new()).await.unwrap();

        let result = &turn.rounds[0].results[0];
        assert_eq!(result.error_kind(), Some(ToolErrorKind::PolicyDenied));
        assert_eq!(f.delay.runs.load(Ordering::SeqCst), 0);
        let inv = &turn.rounds[0].invocations[0];
        let subjects: Vec<String> = f
            .audit
            .events()
            .iter()
            .filter_map(|e| match e {
                AuditEvent::PolicyDecision {
                    decision,
                    invocation_id: Some(id),
                    ..
                } if id == &inv.id => Some(decision.subject.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(subjects, vec!["web:guest".to_string()]);
    }

    #[tokio::test]
    async fn test_recall_does_not_cross_sessions() {
        let store = MemoryStore::new(
            Arc::new(InMemoryBackend::new(100, EvictionPolicy::Lru)),
            Arc::new(HashingEmbedder::new(64)),
        );
        let provider = ScriptedProvider::new(vec![ProviderResponse::reply("ok")]);
        let f = fixture(provider.clone(), Some(store.clone()));

        let budget = Budget {
            max_tool_calls: 5,
            max_wall_clock: Duration::from_secs(60),
        };
        let alice = Subject::new("telegram", "alice");
        let mut first = AgentSession::new("telegram:1", alice.clone(), budget);
        f.orchestrator
            .handle_turn(&mut first, &alice, "my locker code is 4471", &CancellationToken::new())
            .await
            .unwrap();

        let bob = Subject::new("telegram", "bob");
        let mut second = AgentSession::new("telegram:2", bob.clone(), budget);
        f.orchestrator
            .handle_turn(&mut second, &bob, "what is my locker code", &CancellationToken::new())
            .await
            .unwrap();

        let requests = provider.requests.lock().unwrap();
        assert!(!requests[1].messages[0].text_content().contains("4471"));
    }

    /// Backend whose every call hangs until dropped.
    struct StalledBackend {
        stall_recall: bool,
    }

    #[async_trait]
    impl MemoryBackend for StalledBackend {
        fn name(&self) -> &str {
            "stalled"
        }

        fn capacity(&self) -> usize {
            10
        }

        async fn remember(&self, _record: MemoryRecord, _mode: WriteMode) -> std::result::Result<(), MemoryError> {
            std::future::pending().await
        }

        async fn recall(
            &self,
            _query: &[f32],
            _k: usize,
            _scope: Option<&str>,
        ) -> std::result::Result<Recall, MemoryError> {
            if self.stall_recall {
                std::future::pending::<()>().await;
            }
            Ok(Box::new(std::iter::empty()))
        }

        async fn len(&self) -> std::result::Result<usize, MemoryError> {
            Ok(0)
        }
    }

    fn stalled_store(stall_recall: bool) -> MemoryStore {
        MemoryStore::new(Arc::new(StalledBackend { stall_recall }), Arc::new(HashingEmbedder::new(16)))
    }

    fn cancel_after(secs: u64) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            trigger.cancel();
        });
        cancel
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_memory_recall() {
        let provider = ScriptedProvider::new(vec![ProviderResponse::reply("never")]);
        let mut f = fixture(provider.clone(), Some(stalled_store(true)));
        f.orchestrator.settings.memory_timeout = Duration::from_secs(3600);
        let mut s = session(5, 7200);

        let err = f.orchestrator.handle_turn(&mut s, &user(), "hi", &cancel_after(1)).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(provider.calls(), 0);
        assert!(s.turns().is_empty());
        assert_eq!(s.phase(), Phase::AwaitingInput);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_memory_write() {
        let provider = ScriptedProvider::new(vec![ProviderResponse::reply("hello")]);
        let mut f = fixture(provider.clone(), Some(stalled_store(false)));
        f.orchestrator.settings.memory_timeout = Duration::from_secs(3600);
        let mut s = session(5, 7200);

        let err = f.orchestrator.handle_turn(&mut s, &user(), "hi", &cancel_after(1)).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(provider.calls(), 1);
        assert!(s.turns().is_empty());
        assert_eq!(s.phase(), Phase::AwaitingInput);
    }
}
