use std::sync::Arc;

use prechat_core::config::ClassificationConfig;
use prechat_core::domain::{IntentSource, PurchaseIntent};
use prechat_core::tokens::TokenEstimator;
use prechat_core::{AdmissionCoordinator, BudgetAdmission};
use tracing::{debug, info, warn};

use crate::conversation::{Classification, KeywordClassifier};
use crate::llm::{ChatMessage, ModelInvoker, ModelOutcome, ModelParams};

/// Cache category for classification answers, kept apart from reply categories.
pub const CACHE_CATEGORY: &str = "classification";

const CLASSIFICATION_PROMPT: &str = "You classify the purchase intent of a customer message. \
Answer with exactly one word:\n\
CURIOUS - general questions with no sign of buying\n\
INTERESTED - wants details about products, services, how they work or what they include\n\
BUYER - asks about price, payment, discounts or says they want to buy";

const FILLER_PHRASES: &[&str] = &[
    "oi",
    "olá",
    "ola",
    "bom dia",
    "boa tarde",
    "boa noite",
    "por favor",
    "obrigado",
    "obrigada",
    "valeu",
    "tudo bem",
    "tudo bom",
    "beleza",
];

/// Classifies intent with the chat model under the shared budget. Cached answers are
/// reused; a denied, failed or unreadable call falls back to keyword matching.
pub struct ModelClassifier {
    model: Arc<dyn ModelInvoker>,
    estimator: Arc<dyn TokenEstimator>,
    params: ModelParams,
    max_prompt_chars: usize,
    fallback: KeywordClassifier,
}

impl ModelClassifier {
    pub fn new(
        model: Arc<dyn ModelInvoker>,
        estimator: Arc<dyn TokenEstimator>,
        config: &ClassificationConfig,
    ) -> Self {
        Self {
            model,
            estimator,
            params: ModelParams { temperature: config.temperature, max_tokens: config.max_tokens },
            max_prompt_chars: config.max_prompt_chars,
            fallback: KeywordClassifier::new(),
        }
    }

    pub async fn classify(&self, coordinator: &AdmissionCoordinator, text: &str) -> Classification {
        let cached = coordinator.cache().lookup(text, CACHE_CATEGORY).await;
        if let Some(intent) = cached.as_deref().and_then(parse_label) {
            debug!(event_name = "agent.intent.cache_hit", intent = intent.as_str(), "cached intent reused");
            return model_classification(intent);
        }

        let optimized = optimize_for_classification(text, self.max_prompt_chars);
        let estimated =
            self.estimator.estimate(&optimized).saturating_add(u64::from(self.params.max_tokens));
        let reservation = match coordinator.budget().check_admission(estimated).await {
            BudgetAdmission::Admitted(reservation) => reservation,
            BudgetAdmission::Denied { reason } => {
                debug!(
                    event_name = "agent.intent.budget_denied",
                    reason = reason.as_str(),
                    "model classification skipped; using keywords"
                );
                return self.fallback.classify_text(text);
            }
        };

        let messages = [ChatMessage::system(CLASSIFICATION_PROMPT), ChatMessage::user(optimized.clone())];
        match self.model.invoke(&messages, &self.params).await {
            ModelOutcome::Success { text: answer, total_tokens } => {
                let spent = total_tokens.unwrap_or_else(|| {
                    self.estimator.estimate(&optimized) + self.estimator.estimate(&answer)
                });
                coordinator.budget().commit_usage(&reservation, spent).await;

                let Some(intent) = parse_label(&answer) else {
                    warn!(
                        event_name = "agent.intent.unreadable_label",
                        answer = %answer,
                        "model answered outside the label set; using keywords"
                    );
                    return self.fallback.classify_text(text);
                };
                coordinator.cache().store(text, CACHE_CATEGORY, intent.as_str()).await;
                info!(
                    event_name = "agent.intent.model_classified",
                    intent = intent.as_str(),
                    tokens_spent = spent,
                    "model intent classification"
                );
                model_classification(intent)
            }
            ModelOutcome::Failure { http_status, detail } => {
                coordinator
                    .budget()
                    .commit_usage(&reservation, self.estimator.estimate(&optimized))
                    .await;
                warn!(
                    event_name = "agent.intent.model_failed",
                    http_status,
                    detail = %detail,
                    "model classification failed; using keywords"
                );
                self.fallback.classify_text(text)
            }
        }
    }
}

fn model_classification(intent: PurchaseIntent) -> Classification {
    Classification { intent, source: IntentSource::Classifier, matched_keyword: None }
}

/// Reads the first recognised label in the answer, English or Portuguese.
fn parse_label(answer: &str) -> Option<PurchaseIntent> {
    answer.split(|character: char| !character.is_alphabetic()).find_map(|word| {
        match word.to_uppercase().as_str() {
            "CURIOUS" | "CURIOSO" => Some(PurchaseIntent::Curious),
            "INTERESTED" | "INTERESSADO" => Some(PurchaseIntent::Interested),
            "BUYER" | "COMPRADOR" => Some(PurchaseIntent::Buyer),
            _ => None,
        }
    })
}

/// Shrinks a message before it is sent for classification: collapses whitespace, drops
/// symbols, cuts long text at its first sentence and removes greetings and thanks.
pub fn optimize_for_classification(text: &str, max_chars: usize) -> String {
    let cleaned: String = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .filter(|character| {
            character.is_alphanumeric()
                || character.is_whitespace()
                || ".,!?@#$%&*()-+=".contains(*character)
        })
        .collect();
    let shortened = shorten(cleaned.trim(), max_chars);

    let lowered = shortened.to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    let mut kept = Vec::with_capacity(words.len());
    let mut index = 0;
    while index < words.len() {
        match filler_at(&words[index..]) {
            Some(length) => index += length,
            None => {
                kept.push(words[index]);
                index += 1;
            }
        }
    }

    if kept.is_empty() {
        shortened
    } else {
        kept.join(" ")
    }
}

fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if let Some((first, _)) = text.split_once(['.', '!', '?']) {
        let first = first.trim();
        if !first.is_empty() && first.chars().count() <= max_chars {
            return format!("{first}.");
        }
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

/// Number of words a filler phrase covers at the start of `words`.
fn filler_at(words: &[&str]) -> Option<usize> {
    FILLER_PHRASES.iter().find_map(|phrase| {
        let parts: Vec<&str> = phrase.split(' ').collect();
        let matches = parts.len() <= words.len()
            && parts.iter().zip(words).all(|(part, word)| {
                word.trim_matches(|character: char| !character.is_alphanumeric()) == *part
            });
        matches.then_some(parts.len())
    })
}
