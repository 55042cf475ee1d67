//! Agent Runtime - LLM-backed proposal generation
//!
//! This crate turns a sales rep's request into a slide deck:
//! - Talks to language-model backends through one provider abstraction
//! - Picks a backend per organization and caches the choice
//! - Assembles knowledge base, opportunity and deal context into a bounded prompt
//! - Drives the outline-then-slides generation protocol with step retries
//!
//! # Architecture
//!
//! 1. **Provider selection** (`selector`) - premium runtime or default API
//! 2. **Context assembly** (`context`) - token-budgeted system prompt
//! 3. **Generation** (`generator`) - strict-JSON outline, then one call per slide
//! 4. **Retry** (`retry`) - bounded backoff around each provider call
//!
//! # Key Types
//!
//! - `LlmProvider` - backend trait (Anthropic direct API, Bedrock runtime)
//! - `ProviderSelector` - per-organization provider cache
//! - `ContextAssembler` - builds `AssembledContext`
//! - `ProposalGenerator` - produces a validated `Vec<Slide>`
//!
//! # Safety Principle
//!
//! The model writes slide copy only. It never decides which organization's
//! data it sees, and a reply that does not parse is a failed generation,
//! never a partially saved deck.

pub mod context;
pub mod generator;
pub mod llm;
pub mod retry;
pub mod selector;

pub use context::{AssembledContext, AssemblyError, ContextAssembler, ContextBudget};
pub use generator::{
    GeneratedDeck, GenerationError, GenerationSettings, NoopReporter, ProposalGenerator,
    StageReporter,
};
pub use llm::{LlmError, LlmProvider};
pub use retry::RetryPolicy;
pub use selector::{FallbackReason, ProviderSelector, SelectionError};
