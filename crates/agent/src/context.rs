//! Context assembly.
//!
//! Gathers the organization's knowledge base, the opportunity and its deal
//! context into one bounded system prompt. Only deal context is ever
//! truncated (oldest first); the knowledge base and opportunity always go in
//! whole, and if they alone do not fit, assembly fails.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use deckhand_core::domain::generation::GenerationRequest;
use deckhand_core::domain::knowledge::KnowledgeBase;
use deckhand_core::domain::opportunity::{DealContextItem, Opportunity, OpportunityId};
use deckhand_core::domain::organization::OrganizationId;
use deckhand_db::repositories::{KnowledgeRepository, OpportunityRepository};
use deckhand_db::RepositoryError;

use crate::llm::{CompletionOptions, ProviderMetadata};

pub const CHARS_PER_TOKEN: usize = 4;
pub const DEFAULT_SAFETY_MARGIN_TOKENS: u32 = 1_024;

const SYSTEM_INSTRUCTIONS: &str = "You are a sales proposal writer. Build slide decks \
for the opportunity described below using only the company, product and deal information \
provided. Do not invent products, prices or customer facts that are not in the context. \
Reply with a single JSON value and nothing else: no prose, no markdown.";

/// Rough token count used for budgeting: one token per four characters.
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count().div_ceil(CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextBudget {
    pub max_context_tokens: u32,
    pub reserved_output_tokens: u32,
    pub safety_margin_tokens: u32,
}

impl ContextBudget {
    pub fn for_provider(metadata: &ProviderMetadata, options: &CompletionOptions) -> Self {
        Self {
            max_context_tokens: metadata.max_context_tokens,
            reserved_output_tokens: options.max_tokens,
            safety_margin_tokens: DEFAULT_SAFETY_MARGIN_TOKENS,
        }
    }

    /// Tokens left for the prompt once output and margin are reserved.
    pub fn available_tokens(&self) -> u32 {
        self.max_context_tokens
            .saturating_sub(self.reserved_output_tokens)
            .saturating_sub(self.safety_margin_tokens)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledContext {
    pub context_text: String,
    pub system_prompt: String,
    pub estimated_tokens: u32,
    pub included_deal_items: usize,
    pub dropped_deal_items: usize,
}

#[derive(Clone, Debug)]
pub struct ContextSources {
    pub opportunity: Opportunity,
    pub knowledge: KnowledgeBase,
    pub deal_context: Vec<DealContextItem>,
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("opportunity {0} was not found")]
    OpportunityNotFound(OpportunityId),
    #[error("opportunity {opportunity_id} does not belong to organization {organization_id}")]
    OrganizationMismatch { opportunity_id: OpportunityId, organization_id: OrganizationId },
    #[error("could not load {what}: {source}")]
    Lookup {
        what: &'static str,
        #[source]
        source: RepositoryError,
    },
    #[error("required context needs about {required} tokens but the provider leaves room for {available}")]
    OverBudget { required: u32, available: u32 },
}

pub struct ContextAssembler {
    opportunities: Arc<dyn OpportunityRepository>,
    knowledge: Arc<dyn KnowledgeRepository>,
}

impl ContextAssembler {
    pub fn new(
        opportunities: Arc<dyn OpportunityRepository>,
        knowledge: Arc<dyn KnowledgeRepository>,
    ) -> Self {
        Self { opportunities, knowledge }
    }

    pub async fn assemble(
        &self,
        request: &GenerationRequest,
        budget: ContextBudget,
    ) -> Result<AssembledContext, AssemblyError> {
        let opportunity = self
            .opportunities
            .find_by_id(&request.opportunity_id)
            .await
            .map_err(|source| AssemblyError::Lookup { what: "opportunity", source })?
            .ok_or_else(|| AssemblyError::OpportunityNotFound(request.opportunity_id.clone()))?;
        if opportunity.organization_id != request.organization_id {
            return Err(AssemblyError::OrganizationMismatch {
                opportunity_id: opportunity.id,
                organization_id: request.organization_id.clone(),
            });
        }

        let knowledge = self
            .knowledge
            .load_knowledge_base(&request.organization_id)
            .await
            .map_err(|source| AssemblyError::Lookup { what: "knowledge base", source })?;
        let deal_context = self
            .opportunities
            .list_deal_context(&request.opportunity_id)
            .await
            .map_err(|source| AssemblyError::Lookup { what: "deal context", source })?;

        let assembled = assemble_from(
            ContextSources { opportunity, knowledge, deal_context },
            &request.prompt,
            budget,
        )?;
        info!(
            event_name = "generation.context.assembled",
            correlation_id = %request.proposal_id,
            estimated_tokens = assembled.estimated_tokens,
            included_deal_items = assembled.included_deal_items,
            dropped_deal_items = assembled.dropped_deal_items,
            "context assembled"
        );
        Ok(assembled)
    }
}

/// Builds the prompt from already loaded sources. `prompt` is the user's
/// request; it is not part of the context text but counts against the budget.
pub fn assemble_from(
    sources: ContextSources,
    prompt: &str,
    budget: ContextBudget,
) -> Result<AssembledContext, AssemblyError> {
    let available = budget.available_tokens();

    let leading = render_knowledge(&sources.knowledge);
    let trailing = render_opportunity(&sources.opportunity);
    let fixed_text = join_sections(&[leading.as_str(), trailing.as_str()]);
    // +1 for each "\n\n" separator the pieces are joined with
    let fixed_tokens = estimate_tokens(SYSTEM_INSTRUCTIONS)
        .saturating_add(1)
        .saturating_add(estimate_tokens(&fixed_text))
        .saturating_add(estimate_tokens(prompt));
    if fixed_tokens > available {
        return Err(AssemblyError::OverBudget { required: fixed_tokens, available });
    }

    let mut items = sources.deal_context;
    items.sort_by_key(|item| std::cmp::Reverse(item.effective_at()));
    let total_items = items.len();

    let mut used = fixed_tokens.saturating_add(estimate_tokens(DEAL_CONTEXT_HEADER)).saturating_add(1);
    let mut rendered_items = Vec::new();
    for item in &items {
        let rendered = render_deal_item(item);
        let cost = estimate_tokens(&rendered).saturating_add(1);
        if used.saturating_add(cost) > available {
            break;
        }
        used = used.saturating_add(cost);
        rendered_items.push(rendered);
    }
    let included = rendered_items.len();
    if included < total_items {
        debug!(
            event_name = "generation.context.truncated",
            included,
            dropped = total_items - included,
            available,
            "dropped oldest deal context to fit provider window"
        );
    }

    let deal_section = if rendered_items.is_empty() {
        String::new()
    } else {
        format!("{DEAL_CONTEXT_HEADER}\n{}", rendered_items.join("\n\n"))
    };
    let context_text =
        join_sections(&[leading.as_str(), deal_section.as_str(), trailing.as_str()]);
    let system_prompt = format!("{SYSTEM_INSTRUCTIONS}\n\n{context_text}");
    let estimated_tokens = estimate_tokens(&system_prompt).saturating_add(estimate_tokens(prompt));

    Ok(AssembledContext {
        context_text,
        system_prompt,
        estimated_tokens,
        included_deal_items: included,
        dropped_deal_items: total_items - included,
    })
}

const DEAL_CONTEXT_HEADER: &str = "## Deal context (newest first)";

fn join_sections(sections: &[&str]) -> String {
    sections.iter().filter(|section| !section.is_empty()).copied().collect::<Vec<_>>().join("\n\n")
}

fn push_field(out: &mut String, label: &str, value: Option<&str>) {
    if let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) {
        out.push_str(&format!("\n{label}: {value}"));
    }
}

fn push_list(out: &mut String, label: &str, values: &[String]) {
    if !values.is_empty() {
        out.push_str(&format!("\n{label}: {}", values.join("; ")));
    }
}

fn render_knowledge(knowledge: &KnowledgeBase) -> String {
    let mut sections = Vec::new();

    if let Some(profile) = &knowledge.company_profile {
        let mut block = format!("## Company profile\nCompany: {}", profile.company_name);
        push_field(&mut block, "Overview", profile.overview.as_deref());
        push_field(&mut block, "Value proposition", profile.value_proposition.as_deref());
        push_field(&mut block, "Target market", profile.target_market.as_deref());
        push_list(&mut block, "Differentiators", &profile.differentiators);
        sections.push(block);
    }

    if !knowledge.products.is_empty() {
        let mut block = String::from("## Products");
        for product in &knowledge.products {
            block.push_str(&format!("\n- {}", product.name));
            if let Some(description) = product.description.as_deref().filter(|d| !d.trim().is_empty()) {
                block.push_str(&format!(": {}", description.trim()));
            }
            if let Some(pricing) = product.pricing.as_deref().filter(|p| !p.trim().is_empty()) {
                block.push_str(&format!(" | Pricing: {}", pricing.trim()));
            }
            if !product.features.is_empty() {
                block.push_str(&format!(" | Features: {}", product.features.join(", ")));
            }
        }
        sections.push(block);
    }

    if !knowledge.battlecards.is_empty() {
        let mut block = String::from("## Competitive battlecards");
        for card in &knowledge.battlecards {
            block.push_str(&format!("\n- vs {}", card.competitor_name));
            for (label, values) in [
                ("Their strengths", &card.strengths),
                ("Their weaknesses", &card.weaknesses),
                ("Our differentiators", &card.differentiators),
            ] {
                if !values.is_empty() {
                    block.push_str(&format!(" | {label}: {}", values.join(", ")));
                }
            }
        }
        sections.push(block);
    }

    sections.join("\n\n")
}

fn render_deal_item(item: &DealContextItem) -> String {
    let date = item.effective_at().format("%Y-%m-%d");
    let mut heading = format!("[{}, {date}]", item.source.label());
    if let Some(name) = item.name.as_deref().map(str::trim).filter(|name| !name.is_empty()) {
        heading.push(' ');
        heading.push_str(name);
    }
    format!("{heading}\n{}", item.content.trim())
}

fn render_opportunity(opportunity: &Opportunity) -> String {
    let mut block = format!("## Opportunity\nName: {}", opportunity.name);
    push_field(&mut block, "Description", opportunity.description.as_deref());
    if let Some(value) = &opportunity.expected_value {
        block.push_str(&format!("\nExpected value: {value}"));
    }
    if let Some(close_date) = &opportunity.close_date {
        block.push_str(&format!("\nExpected close: {}", close_date.format("%Y-%m-%d")));
    }
    push_field(&mut block, "Stage", Some(opportunity.stage.as_str()));
    block
}
