//! Admin-triggered form and field discovery.

use std::collections::HashSet;

use leadsync_core::{FieldMapping, Form, NewFieldMapping, NewForm, RecordId};
use tracing::{info, info_span, Instrument};

use crate::{SyncError, SyncPipeline};

impl SyncPipeline {
    /// Creates a local form for every remote lead form the page does not have yet,
    /// then pulls its fields. Existing forms are left untouched.
    pub async fn discover_forms(&self, page_id: RecordId) -> Result<Vec<Form>, SyncError> {
        let page = self.store.get_page(page_id).await?;
        let span = info_span!("discover_forms", page_id, page = %page.name);
        async move {
            let remote_forms = self
                .graph
                .leadgen_forms(&page.name, &page.access_token)
                .await?;
            let mut known = self
                .store
                .forms_for_page(page.id)
                .await?
                .into_iter()
                .map(|f| f.external_form_id)
                .collect::<HashSet<_>>();

            let mut created = Vec::new();
            for remote in remote_forms {
                if !known.insert(remote.id.clone()) {
                    continue;
                }
                let form = self
                    .store
                    .create_form(NewForm {
                        page_id: page.id,
                        name: remote.name,
                        external_form_id: remote.id,
                    })
                    .await?;
                self.discover_fields(form.id).await?;
                created.push(form);
            }

            info!(created = created.len(), "form discovery finished");
            Ok(created)
        }
        .instrument(span)
        .await
    }

    /// Rebuilds a form's mappings from its qualifiers. Every existing mapping is
    /// deleted first, so internal field assignments do not survive a refresh.
    pub async fn discover_fields(&self, form_id: RecordId) -> Result<Vec<FieldMapping>, SyncError> {
        let form = self.store.get_form(form_id).await?;
        let span = info_span!("discover_fields", form_id, external_form_id = %form.external_form_id);
        async move {
            let removed = self.store.delete_mappings_for_form(form.id).await?;
            let qualifiers = self
                .graph
                .form_qualifiers(&form.external_form_id, &form.access_token)
                .await?;

            let mut mappings = Vec::with_capacity(qualifiers.len());
            for qualifier in qualifiers {
                mappings.push(
                    self.store
                        .create_mapping(NewFieldMapping {
                            form_id: form.id,
                            label: qualifier.label,
                            external_key: qualifier.field_key,
                            lead_field: None,
                        })
                        .await?,
                );
            }

            info!(removed, created = mappings.len(), "field discovery finished");
            Ok(mappings)
        }
        .instrument(span)
        .await
    }
}
