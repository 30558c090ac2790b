//! External research collaborators.
//!
//! Every data source is optional. A missing source degrades the research
//! context, it does not fail a run. The analyst and the drafter are
//! required because the research steps that use them cannot be skipped
//! meaningfully without them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use typed_builder::TypedBuilder;

use super::context::ResearchContext;
use super::contacts::WebsiteContent;
use crate::crm::{Contact, DataQuality, EmailDraft};
use crate::error::CollaboratorResult;

/// Ownership data from the property registry (OIS).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerInfo {
    pub owner_name: String,
    pub owner_cvr: Option<String>,
    pub administrator: Option<String>,
    pub bfe: Option<String>,
}

/// Building data from the building registry (BBR).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildingInfo {
    pub area_m2: Option<u32>,
    pub usage: Option<String>,
    pub built_year: Option<u16>,
    pub floors: Option<u8>,
}

/// Company profile from the company registry (CVR).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyProfile {
    pub cvr: String,
    pub name: String,
    pub address: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanyQuery {
    Cvr(String),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: Option<String>,
}

/// What the analyst concluded from the assembled context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchAnalysis {
    pub owner_company: Option<String>,
    pub owner_cvr: Option<String>,
    pub contacts: Vec<Contact>,
    /// 1-10
    pub outdoor_score: u8,
    pub summary: String,
    pub data_quality: DataQuality,
}

#[async_trait]
pub trait PropertyRegistry: Send + Sync {
    async fn lookup(&self, address: &str) -> CollaboratorResult<OwnerInfo>;
}

#[async_trait]
pub trait BuildingRegistry: Send + Sync {
    async fn lookup(&self, address: &str) -> CollaboratorResult<BuildingInfo>;
}

#[async_trait]
pub trait CompanyRegistry: Send + Sync {
    async fn lookup(&self, query: &CompanyQuery) -> CollaboratorResult<CompanyProfile>;
}

#[async_trait]
pub trait WebSearcher: Send + Sync {
    async fn search(&self, query: &str) -> CollaboratorResult<Vec<SearchHit>>;
}

#[async_trait]
pub trait WebsiteFetcher: Send + Sync {
    /// Raw HTML of the page.
    async fn fetch(&self, url: &str) -> CollaboratorResult<String>;

    /// Fetch and extract contact details.
    async fn fetch_content(&self, url: &str) -> CollaboratorResult<WebsiteContent> {
        let html = self.fetch(url).await?;
        Ok(WebsiteContent::from_html(url, &html))
    }
}

/// LLM analysis over the assembled research context.
#[async_trait]
pub trait ResearchAnalyst: Send + Sync {
    async fn analyze(&self, context: &ResearchContext) -> CollaboratorResult<ResearchAnalysis>;
}

#[async_trait]
pub trait EmailDrafter: Send + Sync {
    async fn draft(
        &self,
        context: &ResearchContext,
        recipient: &Contact,
    ) -> CollaboratorResult<EmailDraft>;
}

#[derive(Clone, TypedBuilder)]
pub struct ResearchCollaborators {
    #[builder(default, setter(strip_option))]
    pub property_registry: Option<Arc<dyn PropertyRegistry>>,
    #[builder(default, setter(strip_option))]
    pub building_registry: Option<Arc<dyn BuildingRegistry>>,
    #[builder(default, setter(strip_option))]
    pub company_registry: Option<Arc<dyn CompanyRegistry>>,
    #[builder(default, setter(strip_option))]
    pub web_searcher: Option<Arc<dyn WebSearcher>>,
    #[builder(default, setter(strip_option))]
    pub website_fetcher: Option<Arc<dyn WebsiteFetcher>>,
    pub analyst: Arc<dyn ResearchAnalyst>,
    pub drafter: Arc<dyn EmailDrafter>,
}
