use serde::{Deserialize, Serialize};

use crate::domain::organization::OrganizationId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub description: Option<String>,
    pub pricing: Option<String>,
    pub features: Vec<String>,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Battlecard {
    pub id: String,
    pub organization_id: OrganizationId,
    pub competitor_name: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub differentiators: Vec<String>,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub organization_id: OrganizationId,
    pub company_name: String,
    pub overview: Option<String>,
    pub value_proposition: Option<String>,
    pub differentiators: Vec<String>,
    pub target_market: Option<String>,
}

/// Everything an organization has recorded about itself, as consumed by
/// proposal generation. Inactive products and battlecards are excluded by
/// the repository.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub company_profile: Option<CompanyProfile>,
    pub products: Vec<Product>,
    pub battlecards: Vec<Battlecard>,
}
