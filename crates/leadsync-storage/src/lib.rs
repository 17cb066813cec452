//! Record store for pages, forms, field mappings and leads.
//!
//! [`LeadStore`] is the persistence boundary used by discovery and the sync loop.
//! [`PgStore`] is the durable implementation; [`MemoryStore`] enforces the same
//! constraints in-process for tests and dry runs.

mod memory;
mod postgres;

use async_trait::async_trait;
use leadsync_core::{
    lead_field, FieldMapping, Form, FormRouting, Lead, NewFieldMapping, NewForm, NewLead, NewPage,
    Page, RecordId, ReferenceRecord,
};
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("lead {0} already exists")]
    DuplicateLead(String),
    #[error("mapping of {external_key} to {lead_field} already exists on form {form_id}")]
    DuplicateMapping {
        form_id: RecordId,
        lead_field: String,
        external_key: String,
    },
    #[error("unknown lead field {0}")]
    UnknownLeadField(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn create_page(&self, page: NewPage) -> StoreResult<Page>;
    async fn get_page(&self, id: RecordId) -> StoreResult<Page>;
    async fn list_pages(&self) -> StoreResult<Vec<Page>>;
    /// Removes the page together with its forms and their mappings.
    async fn delete_page(&self, id: RecordId) -> StoreResult<()>;

    async fn create_form(&self, form: NewForm) -> StoreResult<Form>;
    async fn get_form(&self, id: RecordId) -> StoreResult<Form>;
    async fn list_forms(&self) -> StoreResult<Vec<Form>>;
    async fn forms_for_page(&self, page_id: RecordId) -> StoreResult<Vec<Form>>;
    async fn assign_form_routing(&self, id: RecordId, routing: FormRouting) -> StoreResult<Form>;
    /// Removes the form and its mappings; leads keep existing with no form.
    async fn delete_form(&self, id: RecordId) -> StoreResult<()>;

    async fn create_mapping(&self, mapping: NewFieldMapping) -> StoreResult<FieldMapping>;
    async fn mappings_for_form(&self, form_id: RecordId) -> StoreResult<Vec<FieldMapping>>;
    async fn delete_mappings_for_form(&self, form_id: RecordId) -> StoreResult<u64>;
    async fn assign_mapping(
        &self,
        id: RecordId,
        lead_field: Option<String>,
    ) -> StoreResult<FieldMapping>;

    /// True when a lead with this external id exists, active or not.
    async fn lead_exists(&self, external_lead_id: &str) -> StoreResult<bool>;
    async fn insert_lead(&self, lead: NewLead) -> StoreResult<Lead>;
    async fn find_lead(&self, external_lead_id: &str) -> StoreResult<Option<Lead>>;
    async fn list_leads(&self) -> StoreResult<Vec<Lead>>;

    async fn create_reference(&self, model: &str, display_name: &str)
        -> StoreResult<ReferenceRecord>;
    /// Exact display name matches within one model.
    async fn search_references(
        &self,
        model: &str,
        display_name: &str,
    ) -> StoreResult<Vec<ReferenceRecord>>;
}

pub(crate) fn validate_lead_field(name: Option<&str>) -> StoreResult<()> {
    match name {
        Some(name) if lead_field(name).is_none() => {
            Err(StoreError::UnknownLeadField(name.to_string()))
        }
        _ => Ok(()),
    }
}
