//! Assistant runtime - intent classification, model calls and reply selection
//!
//! This crate sits between a messaging transport and the admission layer in
//! `prechat-core`:
//! - Classifies inbound text into a purchase intent by keywords (`conversation`)
//!   or, when enabled, with the model under the shared budget (`classification`)
//! - Calls an OpenAI-compatible chat model behind the `ModelInvoker` port (`llm`)
//! - Falls back to canned replies when the model is unavailable (`replies`)
//! - Drives one message end to end through admission (`runtime`)
//!
//! # Flow
//!
//! 1. **Gate** - throttle and coalescing decide whether a prompt is ready
//! 2. **Classify** - menu choice if the sender picked one, otherwise the ready prompt
//!    is classified as a whole
//! 3. **Admit** - the settled intent picks the reply ceiling and cache category
//! 4. **Invoke** - only on `ProceedToModel`; failures degrade to canned text
//! 5. **Commit** - reconcile the reservation and count the delivered reply
//!
//! Turns are serialized per sender so every commit settles the request it admitted.
//!
//! The model only writes prose. It never decides admission, throttling or handoff.

pub mod classification;
pub mod conversation;
pub mod llm;
pub mod replies;
pub mod runtime;

pub use classification::ModelClassifier;
pub use conversation::{Classification, KeywordClassifier};
pub use llm::{ChatMessage, LlmError, ModelInvoker, ModelOutcome, ModelParams, OpenAiCompatibleClient};
pub use replies::CannedReplies;
pub use runtime::{AssistantReply, AssistantRuntime};
