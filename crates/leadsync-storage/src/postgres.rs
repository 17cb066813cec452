use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use leadsync_core::{
    FieldMapping, FieldValue, Form, FormRouting, Lead, NewFieldMapping, NewForm, NewLead, NewPage,
    Page, RecordId, ReferenceRecord,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::{validate_lead_field, LeadStore, StoreError, StoreResult};

const FORM_COLUMNS: &str = r#"
    f.id, f.page_id, f.name, f.external_form_id,
    f.team_id, f.campaign_id, f.source_id, f.medium_id,
    p.access_token
"#;

const LEAD_COLUMNS: &str = r#"
    id, external_lead_id, name, description,
    team_id, campaign_id, source_id, medium_id,
    form_id, page_id, date_open, active, mapped_fields, created_at
"#;

/// Postgres-backed [`LeadStore`]. Every write is its own autocommitted statement.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn page_from_row(row: &PgRow) -> StoreResult<Page> {
    Ok(Page {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        access_token: row.try_get("access_token")?,
    })
}

fn routing_from_row(row: &PgRow) -> StoreResult<FormRouting> {
    Ok(FormRouting {
        team_id: row.try_get("team_id")?,
        campaign_id: row.try_get("campaign_id")?,
        source_id: row.try_get("source_id")?,
        medium_id: row.try_get("medium_id")?,
    })
}

fn form_from_row(row: &PgRow) -> StoreResult<Form> {
    Ok(Form {
        id: row.try_get("id")?,
        page_id: row.try_get("page_id")?,
        name: row.try_get("name")?,
        external_form_id: row.try_get("external_form_id")?,
        access_token: row.try_get("access_token")?,
        routing: routing_from_row(row)?,
    })
}

fn mapping_from_row(row: &PgRow) -> StoreResult<FieldMapping> {
    Ok(FieldMapping {
        id: row.try_get("id")?,
        form_id: row.try_get("form_id")?,
        label: row.try_get("label")?,
        external_key: row.try_get("external_key")?,
        lead_field: row.try_get("lead_field")?,
    })
}

fn lead_from_row(row: &PgRow) -> StoreResult<Lead> {
    let Json(mapped_fields): Json<BTreeMap<String, FieldValue>> = row.try_get("mapped_fields")?;
    Ok(Lead {
        id: row.try_get("id")?,
        external_lead_id: row.try_get("external_lead_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        routing: routing_from_row(row)?,
        form_id: row.try_get("form_id")?,
        page_id: row.try_get("page_id")?,
        date_open: row.try_get("date_open")?,
        active: row.try_get("active")?,
        mapped_fields,
        created_at: row.try_get("created_at")?,
    })
}

fn reference_from_row(row: &PgRow) -> StoreResult<ReferenceRecord> {
    Ok(ReferenceRecord {
        id: row.try_get("id")?,
        model: row.try_get("model")?,
        display_name: row.try_get("display_name")?,
    })
}

fn map_mapping_error(err: sqlx::Error, form_id: RecordId, lead_field: &str, key: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateMapping {
            form_id,
            lead_field: lead_field.to_string(),
            external_key: key.to_string(),
        },
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            StoreError::not_found("form", form_id)
        }
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl LeadStore for PgStore {
    async fn create_page(&self, page: NewPage) -> StoreResult<Page> {
        let row = sqlx::query(
            r#"
            INSERT INTO pages (name, access_token)
            VALUES ($1, $2)
            RETURNING id, name, access_token
            "#,
        )
        .bind(&page.name)
        .bind(&page.access_token)
        .fetch_one(&self.pool)
        .await?;
        page_from_row(&row)
    }

    async fn get_page(&self, id: RecordId) -> StoreResult<Page> {
        let row = sqlx::query("SELECT id, name, access_token FROM pages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("page", id))?;
        page_from_row(&row)
    }

    async fn list_pages(&self) -> StoreResult<Vec<Page>> {
        let rows = sqlx::query("SELECT id, name, access_token FROM pages ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(page_from_row).collect()
    }

    async fn delete_page(&self, id: RecordId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM pages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("page", id));
        }
        Ok(())
    }

    async fn create_form(&self, form: NewForm) -> StoreResult<Form> {
        let id: RecordId = sqlx::query_scalar(
            r#"
            INSERT INTO forms (page_id, name, external_form_id)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(form.page_id)
        .bind(&form.name)
        .bind(&form.external_form_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                StoreError::not_found("page", form.page_id)
            }
            _ => StoreError::Database(err),
        })?;
        self.get_form(id).await
    }

    async fn get_form(&self, id: RecordId) -> StoreResult<Form> {
        let sql = format!(
            "SELECT {FORM_COLUMNS} FROM forms f JOIN pages p ON p.id = f.page_id WHERE f.id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("form", id))?;
        form_from_row(&row)
    }

    async fn list_forms(&self) -> StoreResult<Vec<Form>> {
        let sql =
            format!("SELECT {FORM_COLUMNS} FROM forms f JOIN pages p ON p.id = f.page_id ORDER BY f.id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(form_from_row).collect()
    }

    async fn forms_for_page(&self, page_id: RecordId) -> StoreResult<Vec<Form>> {
        let sql = format!(
            "SELECT {FORM_COLUMNS} FROM forms f JOIN pages p ON p.id = f.page_id \
             WHERE f.page_id = $1 ORDER BY f.id"
        );
        let rows = sqlx::query(&sql).bind(page_id).fetch_all(&self.pool).await?;
        rows.iter().map(form_from_row).collect()
    }

    async fn assign_form_routing(&self, id: RecordId, routing: FormRouting) -> StoreResult<Form> {
        let result = sqlx::query(
            r#"
            UPDATE forms
               SET team_id = $2,
                   campaign_id = $3,
                   source_id = $4,
                   medium_id = $5
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(routing.team_id)
        .bind(routing.campaign_id)
        .bind(routing.source_id)
        .bind(routing.medium_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("form", id));
        }
        self.get_form(id).await
    }

    async fn delete_form(&self, id: RecordId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM forms WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("form", id));
        }
        Ok(())
    }

    async fn create_mapping(&self, mapping: NewFieldMapping) -> StoreResult<FieldMapping> {
        validate_lead_field(mapping.lead_field.as_deref())?;
        let row = sqlx::query(
            r#"
            INSERT INTO field_mappings (form_id, label, external_key, lead_field)
            VALUES ($1, $2, $3, $4)
            RETURNING id, form_id, label, external_key, lead_field
            "#,
        )
        .bind(mapping.form_id)
        .bind(&mapping.label)
        .bind(&mapping.external_key)
        .bind(&mapping.lead_field)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            map_mapping_error(
                err,
                mapping.form_id,
                mapping.lead_field.as_deref().unwrap_or_default(),
                &mapping.external_key,
            )
        })?;
        mapping_from_row(&row)
    }

    async fn mappings_for_form(&self, form_id: RecordId) -> StoreResult<Vec<FieldMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT id, form_id, label, external_key, lead_field
              FROM field_mappings
             WHERE form_id = $1
             ORDER BY id
            "#,
        )
        .bind(form_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(mapping_from_row).collect()
    }

    async fn delete_mappings_for_form(&self, form_id: RecordId) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM field_mappings WHERE form_id = $1")
            .bind(form_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn assign_mapping(
        &self,
        id: RecordId,
        lead_field: Option<String>,
    ) -> StoreResult<FieldMapping> {
        validate_lead_field(lead_field.as_deref())?;
        let row = sqlx::query(
            r#"
            UPDATE field_mappings
               SET lead_field = $2
             WHERE id = $1
            RETURNING id, form_id, label, external_key, lead_field
            "#,
        )
        .bind(id)
        .bind(&lead_field)
        .fetch_optional(&self.pool)
        .await;
        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => return Err(StoreError::not_found("mapping", id)),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let current = sqlx::query("SELECT form_id, external_key FROM field_mappings WHERE id = $1")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await?;
                return Err(StoreError::DuplicateMapping {
                    form_id: current.try_get("form_id")?,
                    lead_field: lead_field.unwrap_or_default(),
                    external_key: current.try_get("external_key")?,
                });
            }
            Err(err) => return Err(err.into()),
        };
        mapping_from_row(&row)
    }

    async fn lead_exists(&self, external_lead_id: &str) -> StoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM leads WHERE external_lead_id = $1)")
                .bind(external_lead_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn insert_lead(&self, lead: NewLead) -> StoreResult<Lead> {
        let sql = format!(
            r#"
            INSERT INTO leads (
                external_lead_id, name, description,
                team_id, campaign_id, source_id, medium_id,
                form_id, page_id, date_open, active, mapped_fields
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, f.id, f.page_id, $9, $10, $11
              FROM forms f
             WHERE f.id = $8
            RETURNING {LEAD_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&lead.external_lead_id)
            .bind(&lead.name)
            .bind(&lead.description)
            .bind(lead.routing.team_id)
            .bind(lead.routing.campaign_id)
            .bind(lead.routing.source_id)
            .bind(lead.routing.medium_id)
            .bind(lead.form_id)
            .bind(lead.date_open)
            .bind(lead.active)
            .bind(Json(&lead.mapped_fields))
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| match &err {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    StoreError::DuplicateLead(lead.external_lead_id.clone())
                }
                _ => StoreError::Database(err),
            })?
            .ok_or_else(|| StoreError::not_found("form", lead.form_id))?;
        lead_from_row(&row)
    }

    async fn find_lead(&self, external_lead_id: &str) -> StoreResult<Option<Lead>> {
        let sql = format!("SELECT {LEAD_COLUMNS} FROM leads WHERE external_lead_id = $1");
        let row = sqlx::query(&sql)
            .bind(external_lead_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lead_from_row).transpose()
    }

    async fn list_leads(&self) -> StoreResult<Vec<Lead>> {
        let sql = format!("SELECT {LEAD_COLUMNS} FROM leads ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(lead_from_row).collect()
    }

    async fn create_reference(
        &self,
        model: &str,
        display_name: &str,
    ) -> StoreResult<ReferenceRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO reference_records (model, display_name)
            VALUES ($1, $2)
            RETURNING id, model, display_name
            "#,
        )
        .bind(model)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        reference_from_row(&row)
    }

    async fn search_references(
        &self,
        model: &str,
        display_name: &str,
    ) -> StoreResult<Vec<ReferenceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, model, display_name
              FROM reference_records
             WHERE model = $1
               AND display_name = $2
             ORDER BY id
            "#,
        )
        .bind(model)
        .bind(display_name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(reference_from_row).collect()
    }
}
