use std::collections::HashMap;
use std::sync::Arc;

use prechat_core::admission::CoalescedBatch;
use prechat_core::config::ClassificationConfig;
use prechat_core::domain::{IntentSource, PurchaseIntent, SenderId};
use prechat_core::tokens::TokenEstimator;
use prechat_core::{AdmissionCoordinator, Decision, Gate};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::classification::ModelClassifier;
use crate::conversation::{Classification, KeywordClassifier};
use crate::llm::{ChatMessage, ModelInvoker, ModelOutcome, ModelParams};
use crate::replies::CannedReplies;

const SYSTEM_PROMPT: &str = "You are the pre-sales assistant of a company. \
Reply in the customer's language, cordial and professional.\n\
If the intent is \"curious\": answer in an educational, informative way without being pushy.\n\
If the intent is \"interested\": give detailed information about products and services; do not hand off to a human yet.\n\
If the intent is \"buyer\": thank them for their interest, ask for name and phone, and say a specialist will contact them shortly.";

/// What the transport should send back for one inbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssistantReply {
    pub sender: String,
    pub decision: &'static str,
    pub intent: PurchaseIntent,
    pub text: String,
    /// Follow-up notice once a buyer is handed to the sales team.
    pub handoff: Option<String>,
}

pub struct AssistantRuntime {
    coordinator: Arc<AdmissionCoordinator>,
    model: Arc<dyn ModelInvoker>,
    estimator: Arc<dyn TokenEstimator>,
    params: ModelParams,
    classifier: KeywordClassifier,
    model_classifier: Option<ModelClassifier>,
    replies: CannedReplies,
    /// One turn at a time per sender, so each `commit` settles the request it admitted.
    sender_turns: Mutex<HashMap<SenderId, Arc<Mutex<()>>>>,
}

impl AssistantRuntime {
    pub fn new(
        coordinator: Arc<AdmissionCoordinator>,
        model: Arc<dyn ModelInvoker>,
        estimator: Arc<dyn TokenEstimator>,
        params: ModelParams,
    ) -> Self {
        Self {
            coordinator,
            model,
            estimator,
            params,
            classifier: KeywordClassifier::new(),
            model_classifier: None,
            replies: CannedReplies::default(),
            sender_turns: Mutex::new(HashMap::new()),
        }
    }

    /// Classifies free text with the model when `config.use_model` is set.
    pub fn with_model_classification(mut self, config: &ClassificationConfig) -> Self {
        self.model_classifier = config.use_model.then(|| {
            ModelClassifier::new(Arc::clone(&self.model), Arc::clone(&self.estimator), config)
        });
        self
    }

    pub fn coordinator(&self) -> &Arc<AdmissionCoordinator> {
        &self.coordinator
    }

    pub async fn handle_message(
        &self,
        sender: &SenderId,
        text: &str,
        menu_choice: Option<&str>,
    ) -> AssistantReply {
        let turn = self.sender_turn(sender).await;
        let reply = {
            let _guard = turn.lock().await;
            let preliminary = self.classifier.classify(text, menu_choice);
            match self.coordinator.gate(sender, text, Some(preliminary.intent)).await {
                Gate::Settled(decision) => self.resolve(sender, decision, preliminary).await,
                Gate::Ready(prompt) => {
                    let classification = if preliminary.source == IntentSource::Menu {
                        preliminary
                    } else {
                        self.classify_prompt(&prompt).await
                    };
                    let decision =
                        self.coordinator.admit(sender, prompt, Some(classification.intent)).await;
                    self.resolve(sender, decision, classification).await
                }
            }
        };
        self.end_turn(sender, turn).await;
        reply
    }

    /// Answers a batch the coalescing timer released while the sender was silent.
    pub async fn handle_flushed(&self, batch: CoalescedBatch) -> AssistantReply {
        let sender = batch.sender.clone();
        let turn = self.sender_turn(&sender).await;
        let reply = {
            let _guard = turn.lock().await;
            let classification = self.classify_prompt(&batch.merged).await;
            let decision = self.coordinator.handle_flushed(batch, Some(classification.intent)).await;
            self.resolve(&sender, decision, classification).await
        };
        self.end_turn(&sender, turn).await;
        reply
    }

    async fn sender_turn(&self, sender: &SenderId) -> Arc<Mutex<()>> {
        Arc::clone(self.sender_turns.lock().await.entry(sender.clone()).or_default())
    }

    async fn end_turn(&self, sender: &SenderId, turn: Arc<Mutex<()>>) {
        let mut turns = self.sender_turns.lock().await;
        drop(turn);
        if turns.get(sender).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            turns.remove(sender);
        }
    }

    /// Intent of the prompt that will actually be answered, which may merge several messages.
    async fn classify_prompt(&self, prompt: &str) -> Classification {
        match &self.model_classifier {
            Some(classifier) => classifier.classify(&self.coordinator, prompt).await,
            None => self.classifier.classify_text(prompt),
        }
    }

    async fn resolve(
        &self,
        sender: &SenderId,
        decision: Decision,
        classification: Classification,
    ) -> AssistantReply {
        let label = decision.as_str();
        let intent = classification.intent;

        let (text, delivered) = match decision {
            Decision::UseCache(answer) => (answer, true),
            Decision::StillCoalescing => {
                (self.coordinator.templates().received().to_string(), false)
            }
            Decision::Blocked(message)
            | Decision::ThrottleExceeded(message)
            | Decision::BudgetExceeded(message) => (message, false),
            Decision::ProceedToModel(prompt) => {
                (self.answer_with_model(sender, &prompt, intent).await, true)
            }
        };

        let handoff = if delivered && intent == PurchaseIntent::Buyer {
            self.coordinator.record_purchase_decision(sender, classification.source).await;
            info!(
                event_name = "agent.handoff.buyer",
                sender = %sender,
                source = classification.source.as_str(),
                "buyer handed to sales team"
            );
            Some(self.replies.handoff().to_string())
        } else {
            None
        };

        AssistantReply { sender: sender.to_string(), decision: label, intent, text, handoff }
    }

    async fn answer_with_model(
        &self,
        sender: &SenderId,
        prompt: &str,
        intent: PurchaseIntent,
    ) -> String {
        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!("Intent: {}\nMessage: {prompt}", intent.as_str())),
        ];

        let (text, tokens_spent, success) = match self.model.invoke(&messages, &self.params).await {
            ModelOutcome::Success { text, total_tokens } => {
                let spent = total_tokens.unwrap_or_else(|| {
                    self.estimator.estimate(prompt) + self.estimator.estimate(&text)
                });
                (text, spent, true)
            }
            ModelOutcome::Failure { http_status, detail } => {
                warn!(
                    event_name = "agent.reply.canned_fallback",
                    sender = %sender,
                    http_status,
                    detail = %detail,
                    "model call failed; sending canned reply"
                );
                (self.replies.for_intent(intent), self.estimator.estimate(prompt), false)
            }
        };

        let outcome = self.coordinator.commit(sender, tokens_spent, &text, success).await;
        info!(
            event_name = "agent.reply.committed",
            sender = %sender,
            intent = intent.as_str(),
            tokens_spent,
            cached = outcome.cached,
            response_count = outcome.response_count,
            "model reply committed"
        );
        text
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use prechat_core::config::AppConfig;
    use prechat_core::domain::{PurchaseIntent, SenderId};
    use prechat_core::{CharRatioEstimator, InMemoryStateStore, ManualClock};

    use super::AssistantRuntime;
    use crate::llm::{ChatMessage, ModelInvoker, ModelOutcome, ModelParams};
    use crate::replies::CannedReplies;

    struct ScriptedModel {
        outcome: ModelOutcome,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        fn new(outcome: ModelOutcome) -> Arc<Self> {
            Arc::new(Self { outcome, calls: Mutex::new(Vec::new()) })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().expect("calls lock").len()
        }
    }

    #[async_trait]
    impl ModelInvoker for ScriptedModel {
        async fn invoke(&self, messages: &[ChatMessage], _params: &ModelParams) -> ModelOutcome {
            self.calls.lock().expect("calls lock").push(messages.to_vec());
            self.outcome.clone()
        }
    }

    fn sender(raw: &str) -> SenderId {
        SenderId::parse(raw).expect("sender")
    }

    async fn runtime(config: AppConfig, model: Arc<ScriptedModel>) -> (AssistantRuntime, ManualClock) {
        runtime_with(config, model).await
    }

    fn immediate() -> AppConfig {
        let mut config = AppConfig::default();
        config.coalescing.enabled = false;
        config
    }

    #[tokio::test]
    async fn model_answer_is_committed_and_cached() {
        let model = ScriptedModel::new(ModelOutcome::Success {
            text: "Abrimos às 9h.".to_string(),
            total_tokens: Some(40),
        });
        let (runtime, _clock) = runtime(immediate(), Arc::clone(&model)).await;
        let alice = sender("5511900000001");

        let first = runtime.handle_message(&alice, "que horas abrem?", None).await;
        assert_eq!(first.decision, "proceed_to_model");
        assert_eq!(first.text, "Abrimos às 9h.");
        assert_eq!(first.intent, PurchaseIntent::Curious);
        assert!(first.handoff.is_none());

        let second = runtime.handle_message(&alice, "Que horas abrem?", None).await;
        assert_eq!(second.decision, "use_cache");
        assert_eq!(second.text, "Abrimos às 9h.");
        assert_eq!(model.call_count(), 1);

        let status = runtime.coordinator().budget().status().await;
        assert_eq!(status.tokens_per_minute.used, 40);
        assert_eq!(status.requests_per_minute.used, 1);

        let state = runtime.coordinator().throttle().state_of(&alice).await.expect("tracked");
        assert_eq!(state.response_count, 2);
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_canned_reply() {
        let model = ScriptedModel::new(ModelOutcome::Failure {
            http_status: Some(503),
            detail: "unavailable".to_string(),
        });
        let (runtime, _clock) = runtime(immediate(), Arc::clone(&model)).await;
        let bob = sender("5511900000002");

        let reply = runtime.handle_message(&bob, "como funciona o plano?", None).await;
        assert_eq!(reply.intent, PurchaseIntent::Interested);
        assert_eq!(reply.decision, "proceed_to_model");

        let canned = CannedReplies::default();
        assert!(canned.candidates(PurchaseIntent::Interested).contains(&reply.text));
        assert_eq!(runtime.coordinator().cache().stats().await.size, 0);
    }

    #[tokio::test]
    async fn buyer_reply_hands_off_and_blocks_further_automation() {
        let model = ScriptedModel::new(ModelOutcome::Success {
            text: "Um especialista vai te chamar.".to_string(),
            total_tokens: None,
        });
        let (runtime, _clock) = runtime(immediate(), Arc::clone(&model)).await;
        let carol = sender("5511900000003");

        let reply = runtime.handle_message(&carol, "quero comprar o plano anual", None).await;
        assert_eq!(reply.intent, PurchaseIntent::Buyer);
        assert!(reply.handoff.is_some());

        let next = runtime.handle_message(&carol, "oi?", None).await;
        assert_eq!(next.decision, "blocked");
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn menu_choice_drives_intent_and_source() {
        let model = ScriptedModel::new(ModelOutcome::Success {
            text: "Anotado!".to_string(),
            total_tokens: Some(10),
        });
        let (runtime, _clock) = runtime(immediate(), Arc::clone(&model)).await;
        let dave = sender("5511900000004");

        let reply = runtime.handle_message(&dave, "3", Some("3")).await;
        assert_eq!(reply.intent, PurchaseIntent::Buyer);
        assert!(reply.handoff.is_some());

        let blocked = runtime.coordinator().throttle().blocked_senders().await;
        assert_eq!(blocked.len(), 1);
    }

    #[tokio::test]
    async fn coalesced_messages_reach_the_model_once_after_the_timer() {
        let model = ScriptedModel::new(ModelOutcome::Success {
            text: "Temos garantia de 1 ano.".to_string(),
            total_tokens: Some(30),
        });
        let (runtime, clock) = runtime(AppConfig::default(), Arc::clone(&model)).await;
        let erin = sender("5511900000005");

        for text in ["oi", "tudo bem?", "tem garantia?"] {
            let reply = runtime.handle_message(&erin, text, None).await;
            assert_eq!(reply.decision, "still_coalescing");
        }
        assert_eq!(model.call_count(), 0);

        clock.advance(chrono::Duration::seconds(31));
        let batches = runtime.coordinator().drain_due().await;
        assert_eq!(batches.len(), 1);

        let reply = runtime.handle_flushed(batches.into_iter().next().expect("batch")).await;
        assert_eq!(reply.decision, "proceed_to_model");
        assert_eq!(reply.intent, PurchaseIntent::Interested);
        assert_eq!(model.call_count(), 1);

        let calls = model.calls.lock().expect("calls lock");
        assert!(calls[0][1].content.contains("oi | tudo bem? | tem garantia?"));
    }

    /// Answers by question; the opening-hours answer is slow.
    struct SlowHoursModel;

    #[async_trait]
    impl ModelInvoker for SlowHoursModel {
        async fn invoke(&self, messages: &[ChatMessage], params: &ModelParams) -> ModelOutcome {
            let question = messages.last().map(|message| message.content.clone()).unwrap_or_default();
            if params.max_tokens == 20 {
                return ModelOutcome::Success { text: "INTERESSADO".to_string(), total_tokens: Some(15) };
            }
            if question.contains("horario") {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                return ModelOutcome::Success { text: "Abrimos às 9h.".to_string(), total_tokens: Some(20) };
            }
            ModelOutcome::Success { text: "Sim, aceitamos PIX.".to_string(), total_tokens: Some(20) }
        }
    }

    async fn runtime_with(config: AppConfig, model: Arc<dyn ModelInvoker>) -> (AssistantRuntime, ManualClock) {
        let clock =
            ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 14, 0, 0).single().expect("timestamp"));
        let coordinator = prechat_core::AdmissionCoordinator::restore(
            &config,
            Arc::new(clock.clone()),
            Arc::new(InMemoryStateStore::new()),
            Arc::new(CharRatioEstimator::default()),
        )
        .await;
        let runtime = AssistantRuntime::new(
            Arc::new(coordinator),
            model,
            Arc::new(CharRatioEstimator::default()),
            ModelParams { temperature: 0.7, max_tokens: 500 },
        )
        .with_model_classification(&config.classification);
        (runtime, clock)
    }

    #[tokio::test]
    async fn overlapping_messages_from_one_sender_cache_their_own_answers() {
        let (runtime, _clock) = runtime_with(immediate(), Arc::new(SlowHoursModel)).await;
        let frank = sender("5511900000007");

        let (hours, pix) = tokio::join!(
            runtime.handle_message(&frank, "qual o horario?", None),
            runtime.handle_message(&frank, "aceitam pix?", None),
        );
        assert_eq!(hours.text, "Abrimos às 9h.");
        assert_eq!(pix.text, "Sim, aceitamos PIX.");

        let cache = runtime.coordinator().cache();
        assert_eq!(cache.lookup("qual o horario?", "curious").await.as_deref(), Some("Abrimos às 9h."));
        assert_eq!(cache.lookup("aceitam pix?", "curious").await.as_deref(), Some("Sim, aceitamos PIX."));
        assert_eq!(runtime.coordinator().snapshot().await.in_flight, 0);
    }

    #[tokio::test]
    async fn lazily_flushed_group_is_answered_under_the_merged_intent() {
        let model = ScriptedModel::new(ModelOutcome::Success {
            text: "O plano custa R$ 99.".to_string(),
            total_tokens: Some(30),
        });
        let (runtime, clock) = runtime(AppConfig::default(), Arc::clone(&model)).await;
        let grace = sender("5511900000008");

        let held = runtime.handle_message(&grace, "quanto custa o plano?", None).await;
        assert_eq!(held.decision, "still_coalescing");
        clock.advance(chrono::Duration::seconds(30));

        let reply = runtime.handle_message(&grace, "ok", None).await;
        assert_eq!(reply.decision, "proceed_to_model");
        assert_eq!(reply.intent, PurchaseIntent::Buyer);
        assert!(reply.handoff.is_some());

        let calls = model.calls.lock().expect("calls lock");
        assert!(calls[0][1].content.starts_with("Intent: buyer\n"));
        drop(calls);

        let cache = runtime.coordinator().cache();
        let merged = "quanto custa o plano? | ok";
        assert_eq!(cache.lookup(merged, "buyer").await.as_deref(), Some("O plano custa R$ 99."));
        assert_eq!(cache.lookup(merged, "curious").await, None);
    }

    #[tokio::test]
    async fn model_classification_settles_intent_when_enabled() {
        let mut config = immediate();
        config.classification.use_model = true;
        let (runtime, _clock) = runtime_with(config, Arc::new(SlowHoursModel)).await;
        let heidi = sender("5511900000009");

        let reply = runtime.handle_message(&heidi, "me fala do plano anual", None).await;
        assert_eq!(reply.intent, PurchaseIntent::Interested);
        assert_eq!(reply.text, "Sim, aceitamos PIX.");

        let status = runtime.coordinator().budget().status().await;
        assert_eq!(status.requests_per_minute.used, 2);
        assert_eq!(status.tokens_per_minute.used, 35);

        let menu = runtime.handle_message(&heidi, "1", Some("1")).await;
        assert_eq!(menu.intent, PurchaseIntent::Curious);
        assert_eq!(runtime.coordinator().budget().status().await.requests_per_minute.used, 3);
    }

    #[tokio::test]
    async fn budget_exhaustion_skips_the_model() {
        let mut config = immediate();
        config.budget.requests_per_minute = 1;
        let model = ScriptedModel::new(ModelOutcome::Success {
            text: "ok".to_string(),
            total_tokens: Some(5),
        });
        let (runtime, _clock) = runtime(config, Arc::clone(&model)).await;

        let reply = runtime.handle_message(&sender("5511900000006"), "qual o horário?", None).await;
        assert_eq!(reply.decision, "budget_exceeded");
        assert_eq!(model.call_count(), 0);
        assert!(!runtime.coordinator().budget().is_active().await);
    }
}
