use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use leadsync_core::{
    FieldMapping, Form, FormRouting, Lead, NewFieldMapping, NewForm, NewLead, NewPage, Page,
    RecordId, ReferenceRecord,
};
use tokio::sync::Mutex;

use crate::{validate_lead_field, LeadStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct FormRow {
    id: RecordId,
    page_id: RecordId,
    name: String,
    external_form_id: String,
    routing: FormRouting,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: RecordId,
    pages: BTreeMap<RecordId, Page>,
    forms: BTreeMap<RecordId, FormRow>,
    mappings: BTreeMap<RecordId, FieldMapping>,
    leads: BTreeMap<RecordId, Lead>,
    references: BTreeMap<RecordId, ReferenceRecord>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }

    fn form(&self, id: RecordId) -> StoreResult<Form> {
        let row = self
            .forms
            .get(&id)
            .ok_or_else(|| StoreError::not_found("form", id))?;
        let page = self
            .pages
            .get(&row.page_id)
            .ok_or_else(|| StoreError::not_found("page", row.page_id))?;
        Ok(Form {
            id: row.id,
            page_id: row.page_id,
            name: row.name.clone(),
            external_form_id: row.external_form_id.clone(),
            access_token: page.access_token.clone(),
            routing: row.routing,
        })
    }

    fn check_mapping_unique(
        &self,
        id: Option<RecordId>,
        form_id: RecordId,
        lead_field: Option<&str>,
        external_key: &str,
    ) -> StoreResult<()> {
        let Some(lead_field) = lead_field else {
            return Ok(());
        };
        let clash = self.mappings.values().any(|m| {
            Some(m.id) != id
                && m.form_id == form_id
                && m.external_key == external_key
                && m.lead_field.as_deref() == Some(lead_field)
        });
        if clash {
            return Err(StoreError::DuplicateMapping {
                form_id,
                lead_field: lead_field.to_string(),
                external_key: external_key.to_string(),
            });
        }
        Ok(())
    }

    fn remove_form(&mut self, id: RecordId) {
        self.forms.remove(&id);
        self.mappings.retain(|_, m| m.form_id != id);
        for lead in self.leads.values_mut() {
            if lead.form_id == Some(id) {
                lead.form_id = None;
                lead.page_id = None;
            }
        }
    }
}

/// In-process [`LeadStore`] with the same uniqueness and cascade rules as the SQL schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn create_page(&self, page: NewPage) -> StoreResult<Page> {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        let page = Page {
            id,
            name: page.name,
            access_token: page.access_token,
        };
        state.pages.insert(id, page.clone());
        Ok(page)
    }

    async fn get_page(&self, id: RecordId) -> StoreResult<Page> {
        let state = self.state.lock().await;
        state
            .pages
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("page", id))
    }

    async fn list_pages(&self) -> StoreResult<Vec<Page>> {
        let state = self.state.lock().await;
        Ok(state.pages.values().cloned().collect())
    }

    async fn delete_page(&self, id: RecordId) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.pages.remove(&id).is_none() {
            return Err(StoreError::not_found("page", id));
        }
        let form_ids = state
            .forms
            .values()
            .filter(|f| f.page_id == id)
            .map(|f| f.id)
            .collect::<Vec<_>>();
        for form_id in form_ids {
            state.remove_form(form_id);
        }
        Ok(())
    }

    async fn create_form(&self, form: NewForm) -> StoreResult<Form> {
        let mut state = self.state.lock().await;
        if !state.pages.contains_key(&form.page_id) {
            return Err(StoreError::not_found("page", form.page_id));
        }
        let id = state.allocate_id();
        state.forms.insert(
            id,
            FormRow {
                id,
                page_id: form.page_id,
                name: form.name,
                external_form_id: form.external_form_id,
                routing: FormRouting::default(),
            },
        );
        state.form(id)
    }

    async fn get_form(&self, id: RecordId) -> StoreResult<Form> {
        self.state.lock().await.form(id)
    }

    async fn list_forms(&self) -> StoreResult<Vec<Form>> {
        let state = self.state.lock().await;
        state.forms.keys().map(|id| state.form(*id)).collect()
    }

    async fn forms_for_page(&self, page_id: RecordId) -> StoreResult<Vec<Form>> {
        let state = self.state.lock().await;
        state
            .forms
            .values()
            .filter(|f| f.page_id == page_id)
            .map(|f| state.form(f.id))
            .collect()
    }

    async fn assign_form_routing(&self, id: RecordId, routing: FormRouting) -> StoreResult<Form> {
        let mut state = self.state.lock().await;
        let row = state
            .forms
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("form", id))?;
        row.routing = routing;
        state.form(id)
    }

    async fn delete_form(&self, id: RecordId) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.forms.contains_key(&id) {
            return Err(StoreError::not_found("form", id));
        }
        state.remove_form(id);
        Ok(())
    }

    async fn create_mapping(&self, mapping: NewFieldMapping) -> StoreResult<FieldMapping> {
        validate_lead_field(mapping.lead_field.as_deref())?;
        let mut state = self.state.lock().await;
        if !state.forms.contains_key(&mapping.form_id) {
            return Err(StoreError::not_found("form", mapping.form_id));
        }
        state.check_mapping_unique(
            None,
            mapping.form_id,
            mapping.lead_field.as_deref(),
            &mapping.external_key,
        )?;
        let id = state.allocate_id();
        let mapping = FieldMapping {
            id,
            form_id: mapping.form_id,
            label: mapping.label,
            external_key: mapping.external_key,
            lead_field: mapping.lead_field,
        };
        state.mappings.insert(id, mapping.clone());
        Ok(mapping)
    }

    async fn mappings_for_form(&self, form_id: RecordId) -> StoreResult<Vec<FieldMapping>> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .values()
            .filter(|m| m.form_id == form_id)
            .cloned()
            .collect())
    }

    async fn delete_mappings_for_form(&self, form_id: RecordId) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.mappings.len();
        state.mappings.retain(|_, m| m.form_id != form_id);
        Ok((before - state.mappings.len()) as u64)
    }

    async fn assign_mapping(
        &self,
        id: RecordId,
        lead_field: Option<String>,
    ) -> StoreResult<FieldMapping> {
        validate_lead_field(lead_field.as_deref())?;
        let mut state = self.state.lock().await;
        let (form_id, external_key) = {
            let m = state
                .mappings
                .get(&id)
                .ok_or_else(|| StoreError::not_found("mapping", id))?;
            (m.form_id, m.external_key.clone())
        };
        state.check_mapping_unique(Some(id), form_id, lead_field.as_deref(), &external_key)?;
        let mapping = state
            .mappings
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("mapping", id))?;
        mapping.lead_field = lead_field;
        Ok(mapping.clone())
    }

    async fn lead_exists(&self, external_lead_id: &str) -> StoreResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .leads
            .values()
            .any(|l| l.external_lead_id == external_lead_id))
    }

    async fn insert_lead(&self, lead: NewLead) -> StoreResult<Lead> {
        let mut state = self.state.lock().await;
        if state
            .leads
            .values()
            .any(|l| l.external_lead_id == lead.external_lead_id)
        {
            return Err(StoreError::DuplicateLead(lead.external_lead_id));
        }
        let page_id = state
            .forms
            .get(&lead.form_id)
            .map(|f| f.page_id)
            .ok_or_else(|| StoreError::not_found("form", lead.form_id))?;
        let id = state.allocate_id();
        let lead = Lead {
            id,
            external_lead_id: lead.external_lead_id,
            name: lead.name,
            description: lead.description,
            routing: lead.routing,
            form_id: Some(lead.form_id),
            page_id: Some(page_id),
            date_open: lead.date_open,
            active: lead.active,
            mapped_fields: lead.mapped_fields,
            created_at: Utc::now(),
        };
        state.leads.insert(id, lead.clone());
        Ok(lead)
    }

    async fn find_lead(&self, external_lead_id: &str) -> StoreResult<Option<Lead>> {
        let state = self.state.lock().await;
        Ok(state
            .leads
            .values()
            .find(|l| l.external_lead_id == external_lead_id)
            .cloned())
    }

    async fn list_leads(&self) -> StoreResult<Vec<Lead>> {
        let state = self.state.lock().await;
        Ok(state.leads.values().cloned().collect())
    }

    async fn create_reference(
        &self,
        model: &str,
        display_name: &str,
    ) -> StoreResult<ReferenceRecord> {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        let record = ReferenceRecord {
            id,
            model: model.to_string(),
            display_name: display_name.to_string(),
        };
        state.references.insert(id, record.clone());
        Ok(record)
    }

    async fn search_references(
        &self,
        model: &str,
        display_name: &str,
    ) -> StoreResult<Vec<ReferenceRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .references
            .values()
            .filter(|r| r.model == model && r.display_name == display_name)
            .cloned()
            .collect())
    }
}
