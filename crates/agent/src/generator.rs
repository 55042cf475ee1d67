//! Proposal generation: one outline call, then one call per slide, in order.
//!
//! Every model reply must be a single JSON value (an optional markdown code
//! fence is stripped first). Any unusable reply fails the whole attempt;
//! slides are never dropped or patched up.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use deckhand_core::config::GenerationConfig;
use deckhand_core::domain::generation::{GenerationRequest, JobStage};
use deckhand_core::domain::organization::ProviderId;
use deckhand_core::domain::slide::{validate_deck, Slide, SlideDraft, SlideType};

use crate::context::{AssembledContext, AssemblyError};
use crate::llm::{
    ChatMessage, Completion, CompletionOptions, LlmError, LlmProvider, StopReason, Usage,
};
use crate::retry::RetryPolicy;
use crate::selector::SelectionError;

/// Receives stage transitions as generation moves forward.
#[async_trait]
pub trait StageReporter: Send + Sync {
    async fn report(&self, stage: JobStage, message: Option<String>) -> Result<(), GenerationError>;
}

pub struct NoopReporter;

#[async_trait]
impl StageReporter for NoopReporter {
    async fn report(&self, _stage: JobStage, _message: Option<String>) -> Result<(), GenerationError> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{stage} failed: {source}")]
    Llm {
        stage: String,
        #[source]
        source: LlmError,
    },
    #[error("context assembly failed: {0}")]
    Assembly(#[from] AssemblyError),
    #[error("{stage} returned an unusable response: {message}")]
    Parse { stage: String, message: String },
    #[error("provider selection failed: {0}")]
    Selection(#[from] SelectionError),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl GenerationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Llm { source, .. } => source.is_retryable(),
            Self::Infrastructure(_) => true,
            Self::Assembly(_) | Self::Parse { .. } | Self::Selection(_) => false,
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Llm { source, .. } => source.error_class(),
            Self::Assembly(_) => "assembly",
            Self::Parse { .. } => "parse_error",
            Self::Selection(_) => "provider_selection",
            Self::Infrastructure(_) => "infrastructure",
        }
    }

    /// Message safe to persist on the proposal and show to end users.
    pub fn user_message(&self) -> String {
        match self {
            Self::Llm { stage, source: LlmError::RateLimited { .. } } => format!(
                "The AI provider is busy and rate limited the {stage} step. Please try again in a few minutes."
            ),
            Self::Llm { stage, source: LlmError::Authentication { .. } } => format!(
                "The AI provider rejected the configured credentials during the {stage} step."
            ),
            Self::Llm { stage, .. } => {
                format!("The AI provider failed during the {stage} step. Please try again.")
            }
            Self::Assembly(AssemblyError::OverBudget { .. }) => {
                "The company knowledge base is too large for the selected model.".to_string()
            }
            Self::Assembly(_) => "The proposal context could not be prepared.".to_string(),
            Self::Parse { stage, .. } => {
                format!("The AI response for the {stage} step could not be read. Please try again.")
            }
            Self::Selection(_) => "No AI provider could be selected for this organization.".to_string(),
            Self::Infrastructure(_) => {
                "Proposal generation was interrupted by an internal error.".to_string()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationSettings {
    pub max_slides: u32,
    pub options: CompletionOptions,
    pub retry: RetryPolicy,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self { max_slides: 12, options: CompletionOptions::default(), retry: RetryPolicy::default() }
    }
}

impl GenerationSettings {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_slides: config.max_slides.max(1),
            options: CompletionOptions {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                stop_sequences: None,
            },
            retry: RetryPolicy::from_config(config),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutlineEntry {
    pub title: String,
    pub slide_type: SlideType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedDeck {
    pub slides: Vec<Slide>,
    pub usage: Usage,
    pub provider_id: ProviderId,
}

pub struct ProposalGenerator {
    settings: GenerationSettings,
}

impl ProposalGenerator {
    pub fn new(settings: GenerationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub async fn generate(
        &self,
        provider: &dyn LlmProvider,
        request: &GenerationRequest,
        context: &AssembledContext,
        reporter: &dyn StageReporter,
    ) -> Result<GeneratedDeck, GenerationError> {
        let correlation_id = request.proposal_id.0.as_str();
        let mut usage = Usage::default();

        reporter.report(JobStage::Outline, Some("Planning slide outline".to_string())).await?;
        let outline_prompt = outline_message(&request.prompt, self.settings.max_slides);
        let completion = self.call(provider, context, outline_prompt, "outline", correlation_id).await?;
        usage.add(completion.usage);
        let outline = parse_outline(&completion, self.settings.max_slides, correlation_id)?;
        let total_slides = outline.len() as u32;
        info!(
            event_name = "generation.outline.parsed",
            correlation_id,
            total_slides,
            "outline parsed"
        );

        let mut slides = Vec::with_capacity(outline.len());
        for (position, entry) in outline.iter().enumerate() {
            let slide_index = position as u32 + 1;
            let stage = format!("slide {slide_index} of {total_slides}");
            reporter
                .report(
                    JobStage::Slide { slide_index, total_slides },
                    Some(format!("Writing slide {slide_index} of {total_slides}: {}", entry.title)),
                )
                .await?;

            let prompt = slide_message(&request.prompt, &outline, slide_index);
            let completion = self.call(provider, context, prompt, &stage, correlation_id).await?;
            usage.add(completion.usage);
            slides.push(parse_slide(&completion, entry, slide_index, &stage)?);
        }

        validate_deck(&slides).map_err(|error| GenerationError::Parse {
            stage: "deck".to_string(),
            message: error.to_string(),
        })?;

        Ok(GeneratedDeck { slides, usage, provider_id: provider.id() })
    }

    async fn call(
        &self,
        provider: &dyn LlmProvider,
        context: &AssembledContext,
        prompt: String,
        stage: &str,
        correlation_id: &str,
    ) -> Result<Completion, GenerationError> {
        let messages = vec![ChatMessage::user(prompt)];
        let messages = &messages;
        let system_prompt = context.system_prompt.as_str();
        let options = &self.settings.options;

        self.settings
            .retry
            .run(stage, correlation_id, |_| async move {
                provider
                    .stream_completion(system_prompt, messages, options)
                    .await
                    .collect_completion()
                    .await
            })
            .await
            .map_err(|source| GenerationError::Llm { stage: stage.to_string(), source })
    }
}

/// Removes a surrounding markdown code fence, with or without a language tag.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn parse_json(completion: &Completion, stage: &str) -> Result<Value, GenerationError> {
    let text = strip_code_fences(&completion.content);
    serde_json::from_str::<Value>(text).map_err(|error| {
        let mut message = format!("response is not valid JSON ({error})");
        if completion.stop_reason == StopReason::MaxTokens {
            message.push_str("; the response was cut off at the token limit");
        }
        GenerationError::Parse { stage: stage.to_string(), message }
    })
}

#[derive(Deserialize)]
struct RawOutlineEntry {
    title: String,
    #[serde(rename = "type")]
    slide_type: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOutline {
    Wrapped { slides: Vec<RawOutlineEntry> },
    Bare(Vec<RawOutlineEntry>),
}

fn parse_outline(
    completion: &Completion,
    max_slides: u32,
    correlation_id: &str,
) -> Result<Vec<OutlineEntry>, GenerationError> {
    let parse_error =
        |message: String| GenerationError::Parse { stage: "outline".to_string(), message };

    let value = parse_json(completion, "outline")?;
    let raw: RawOutline = serde_json::from_value(value).map_err(|_| {
        parse_error("expected {\"slides\": [{\"title\", \"type\"}]}".to_string())
    })?;
    let entries = match raw {
        RawOutline::Wrapped { slides } | RawOutline::Bare(slides) => slides,
    };
    if entries.is_empty() {
        return Err(parse_error("outline contained no slides".to_string()));
    }

    let mut outline = entries
        .into_iter()
        .enumerate()
        .map(|(position, entry)| {
            let slide_type = SlideType::parse(&entry.slide_type).ok_or_else(|| {
                parse_error(format!(
                    "outline entry {} has unknown slide type `{}`",
                    position + 1,
                    entry.slide_type
                ))
            })?;
            Ok(OutlineEntry { title: entry.title.trim().to_string(), slide_type })
        })
        .collect::<Result<Vec<_>, GenerationError>>()?;

    if outline.len() > max_slides as usize {
        warn!(
            event_name = "generation.outline.capped",
            correlation_id,
            planned = outline.len(),
            max_slides,
            "outline longer than allowed, extra slides dropped"
        );
        outline.truncate(max_slides as usize);
    }
    Ok(outline)
}

fn parse_slide(
    completion: &Completion,
    entry: &OutlineEntry,
    slide_index: u32,
    stage: &str,
) -> Result<Slide, GenerationError> {
    let parse_error = |message: String| GenerationError::Parse { stage: stage.to_string(), message };

    let value = parse_json(completion, stage)?;
    let mut draft: SlideDraft = serde_json::from_value(value)
        .map_err(|error| parse_error(format!("response does not match the slide shape ({error})")))?;
    if draft.slide_type != entry.slide_type {
        return Err(parse_error(format!(
            "expected a {} slide, got {}",
            entry.slide_type.as_str(),
            draft.slide_type.as_str()
        )));
    }
    if draft.title.trim().is_empty() {
        draft.title = entry.title.clone();
    }
    Slide::from_draft(slide_index, draft).map_err(|error| parse_error(error.to_string()))
}

fn outline_message(prompt: &str, max_slides: u32) -> String {
    format!(
        "Request: {prompt}\n\n\
         Plan the slide deck for this proposal using at most {max_slides} slides. \
         Start with a title slide. Allowed slide types: title, bullets, text, table, callout.\n\
         Respond with JSON only, in this shape:\n\
         {{\"slides\": [{{\"title\": \"Slide title\", \"type\": \"bullets\"}}]}}"
    )
}

fn content_shape(slide_type: SlideType) -> &'static str {
    match slide_type {
        SlideType::Title => r#"{"heading": "...", "subheading": "..."}"#,
        SlideType::Bullets => r#"{"heading": "...", "bullets": ["...", "..."]}"#,
        SlideType::Text => r#"{"body": "..."}"#,
        SlideType::Table => {
            r#"{"headers": ["..."], "rows": [["..."]], "footer": ["..."]} (every row and the footer have exactly as many cells as headers)"#
        }
        SlideType::Callout => r#"{"text": "..."}"#,
    }
}

fn slide_message(prompt: &str, outline: &[OutlineEntry], slide_index: u32) -> String {
    let plan = outline
        .iter()
        .enumerate()
        .map(|(position, entry)| {
            format!("{}. {} ({})", position + 1, entry.title, entry.slide_type.as_str())
        })
        .collect::<Vec<_>>()
        .join("\n");
    let entry = &outline[slide_index as usize - 1];
    format!(
        "Request: {prompt}\n\nDeck outline:\n{plan}\n\n\
         Write slide {slide_index} of {total}: \"{title}\" as a {kind} slide.\n\
         Respond with JSON only, in this shape:\n\
         {{\"type\": \"{kind}\", \"title\": \"{title}\", \"content\": {shape}}}",
        total = outline.len(),
        title = entry.title,
        kind = entry.slide_type.as_str(),
        shape = content_shape(entry.slide_type),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use deckhand_core::domain::generation::{GenerationRequest, JobStage};
    use deckhand_core::domain::opportunity::OpportunityId;
    use deckhand_core::domain::organization::{OrganizationId, ProviderId};
    use deckhand_core::domain::proposal::ProposalId;
    use deckhand_core::domain::slide::{SlideContent, SlideType};

    use super::{
        strip_code_fences, GenerationError, GenerationSettings, ProposalGenerator, StageReporter,
    };
    use crate::context::AssembledContext;
    use crate::llm::{LlmError, ScriptedProvider};
    use crate::retry::RetryPolicy;

    #[derive(Default)]
    struct RecordingReporter {
        stages: Mutex<Vec<JobStage>>,
    }

    #[async_trait]
    impl StageReporter for RecordingReporter {
        async fn report(&self, stage: JobStage, _message: Option<String>) -> Result<(), GenerationError> {
            self.stages.lock().await.push(stage);
            Ok(())
        }
    }

    fn generator(max_slides: u32) -> ProposalGenerator {
        ProposalGenerator::new(GenerationSettings {
            max_slides,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..GenerationSettings::default()
        })
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            proposal_id: ProposalId("P-1".to_string()),
            organization_id: OrganizationId("org-1".to_string()),
            opportunity_id: OpportunityId("opp-1".to_string()),
            prompt: "Create a proposal for Acme Corp, 50 users, annual billing".to_string(),
        }
    }

    fn context() -> AssembledContext {
        AssembledContext {
            context_text: "## Opportunity\nName: Acme Corp".to_string(),
            system_prompt: "Write proposals.\n\n## Opportunity\nName: Acme Corp".to_string(),
            estimated_tokens: 20,
            included_deal_items: 0,
            dropped_deal_items: 0,
        }
    }

    const OUTLINE: &str = r#"{"slides": [{"title": "Acme Corp", "type": "title"}, {"title": "Pricing", "type": "table"}]}"#;
    const TITLE_SLIDE: &str = r#"{"type": "title", "title": "Acme Corp", "content": {"heading": "Acme Corp", "subheading": "Annual plan"}}"#;
    const TABLE_SLIDE: &str = "```json\n{\"type\": \"table\", \"title\": \"Pricing\", \"content\": {\"headers\": [\"Plan\", \"Annual\"], \"rows\": [[\"Pro x50\", \"$60,000\"]], \"footer\": [\"Total\", \"$60,000\"]}}\n```";

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n[1]\n```\n"), "[1]");
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[tokio::test]
    async fn outline_then_each_slide_in_order() {
        let provider = ScriptedProvider::new(ProviderId::Anthropic);
        provider.push_response(OUTLINE).await;
        provider.push_response(TITLE_SLIDE).await;
        provider.push_response(TABLE_SLIDE).await;
        let reporter = RecordingReporter::default();

        let deck = generator(12)
            .generate(&provider, &request(), &context(), &reporter)
            .await
            .expect("deck");

        assert_eq!(deck.provider_id, ProviderId::Anthropic);
        assert_eq!(deck.slides.len(), 2);
        assert_eq!(deck.slides[0].slide_number, 1);
        assert_eq!(deck.slides[1].slide_number, 2);
        assert_eq!(deck.slides[1].slide_type(), SlideType::Table);
        assert!(matches!(
            &deck.slides[1].content,
            SlideContent::Table { footer: Some(footer), .. } if footer[1] == "$60,000"
        ));
        assert_eq!(
            *reporter.stages.lock().await,
            vec![
                JobStage::Outline,
                JobStage::Slide { slide_index: 1, total_slides: 2 },
                JobStage::Slide { slide_index: 2, total_slides: 2 },
            ]
        );

        let calls = provider.calls().await;
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|call| call.system_prompt == context().system_prompt));
        assert!(calls[2].messages[0].content.contains("Write slide 2 of 2: \"Pricing\" as a table slide"));
    }

    #[tokio::test]
    async fn capitalized_slide_types_are_accepted_in_both_stages() {
        let provider = ScriptedProvider::new(ProviderId::Anthropic);
        provider
            .push_response(r#"{"slides": [{"title": "Acme Corp", "type": "Title"}]}"#)
            .await;
        provider
            .push_response(r#"{"type": "Title", "title": "Acme Corp", "content": {"heading": "Acme Corp"}}"#)
            .await;

        let deck = generator(12)
            .generate(&provider, &request(), &context(), &RecordingReporter::default())
            .await
            .expect("capitalized type accepted");

        assert_eq!(deck.slides.len(), 1);
        assert_eq!(deck.slides[0].slide_type(), SlideType::Title);
    }

    #[tokio::test]
    async fn garbage_outline_fails_naming_the_stage() {
        let provider = ScriptedProvider::new(ProviderId::Anthropic);
        provider.push_response("Sure! Here is your deck outline: 1. Intro 2. Pricing").await;
        let reporter = RecordingReporter::default();

        let error = generator(12)
            .generate(&provider, &request(), &context(), &reporter)
            .await
            .expect_err("parse failure");

        assert!(matches!(&error, GenerationError::Parse { stage, .. } if stage == "outline"));
        assert!(!error.is_retryable());
        assert_eq!(error.error_class(), "parse_error");
        assert!(error.user_message().contains("outline"));
        assert_eq!(*reporter.stages.lock().await, vec![JobStage::Outline]);
        assert_eq!(provider.calls().await.len(), 1, "parse failures are not retried");
    }

    #[tokio::test]
    async fn rate_limited_slide_call_is_retried() {
        let provider = ScriptedProvider::new(ProviderId::Bedrock);
        provider.push_response(OUTLINE).await;
        provider
            .push_error(LlmError::RateLimited { provider_id: ProviderId::Bedrock, retry_after_ms: Some(5) })
            .await;
        provider.push_response(TITLE_SLIDE).await;
        provider.push_response(TABLE_SLIDE).await;

        let deck = generator(12)
            .generate(&provider, &request(), &context(), &RecordingReporter::default())
            .await
            .expect("deck");

        assert_eq!(deck.slides.len(), 2);
        assert_eq!(deck.slides[0].title, "Acme Corp");
        assert_eq!(provider.calls().await.len(), 4);
        assert_eq!(provider.remaining().await, 0);
    }

    #[tokio::test]
    async fn authentication_failure_is_fatal_and_user_safe() {
        let provider = ScriptedProvider::new(ProviderId::Anthropic);
        provider
            .push_error(LlmError::Authentication {
                provider_id: ProviderId::Anthropic,
                message: "invalid x-api-key".to_string(),
            })
            .await;

        let error = generator(12)
            .generate(&provider, &request(), &context(), &RecordingReporter::default())
            .await
            .expect_err("auth failure");

        assert_eq!(error.error_class(), "authentication");
        assert!(!error.user_message().contains("x-api-key"));
        assert_eq!(provider.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn slide_type_mismatch_is_a_parse_error() {
        let provider = ScriptedProvider::new(ProviderId::Anthropic);
        provider.push_response(OUTLINE).await;
        provider.push_response(r#"{"type": "text", "title": "Acme", "content": {"body": "Hello"}}"#).await;

        let error = generator(12)
            .generate(&provider, &request(), &context(), &RecordingReporter::default())
            .await
            .expect_err("mismatch");
        assert!(matches!(&error, GenerationError::Parse { stage, .. } if stage == "slide 1 of 2"));
    }

    #[tokio::test]
    async fn outline_is_capped_at_max_slides() {
        let provider = ScriptedProvider::new(ProviderId::Anthropic);
        provider
            .push_response(r#"[{"title": "Acme Corp", "type": "Title"}, {"title": "Why us", "type": "bullets"}, {"title": "Next steps", "type": "callout"}]"#)
            .await;
        provider.push_response(TITLE_SLIDE).await;
        let reporter = RecordingReporter::default();

        let deck = generator(1)
            .generate(&provider, &request(), &context(), &reporter)
            .await
            .expect("deck");
        assert_eq!(deck.slides.len(), 1);
        assert_eq!(
            reporter.stages.lock().await.last(),
            Some(&JobStage::Slide { slide_index: 1, total_slides: 1 })
        );
    }
}
