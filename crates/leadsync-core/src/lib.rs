//! Core domain model for lead form sync: pages, forms, field mappings and leads.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub type RecordId = i64;

/// A lead as delivered by the Graph API after `field_data` flattening, in API key order.
pub type RawLead = serde_json::Map<String, JsonValue>;

/// External advertising page polled for lead forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub id: RecordId,
    pub name: String,
    #[serde(skip_serializing)]
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPage {
    pub name: String,
    pub access_token: String,
}

/// Sales team and UTM assignment copied onto every lead created from a form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormRouting {
    pub team_id: Option<RecordId>,
    pub campaign_id: Option<RecordId>,
    pub source_id: Option<RecordId>,
    pub medium_id: Option<RecordId>,
}

/// Lead generation form. `access_token` is always the owning page's token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Form {
    pub id: RecordId,
    pub page_id: RecordId,
    pub name: String,
    pub external_form_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(flatten)]
    pub routing: FormRouting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewForm {
    pub page_id: RecordId,
    pub name: String,
    pub external_form_id: String,
}

/// Pairs an external form field key with an internal lead field, which may be unassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub id: RecordId,
    pub form_id: RecordId,
    pub label: String,
    pub external_key: String,
    pub lead_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFieldMapping {
    pub form_id: RecordId,
    pub label: String,
    pub external_key: String,
    pub lead_field: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    LongText,
    Html,
    Phone,
    Date,
    DateTime,
    Numeric,
    Monetary,
    Integer,
    Boolean,
    Selection,
    Reference,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::LongText => "long_text",
            FieldType::Html => "html",
            FieldType::Phone => "phone",
            FieldType::Date => "date",
            FieldType::DateTime => "date_time",
            FieldType::Numeric => "numeric",
            FieldType::Monetary => "monetary",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Selection => "selection",
            FieldType::Reference => "reference",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field of the internal lead schema that a mapping can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeadField {
    pub name: &'static str,
    pub label: &'static str,
    pub field_type: FieldType,
    /// Reference model searched by display name, for `FieldType::Reference` only.
    pub relation: Option<&'static str>,
}

const fn field(name: &'static str, label: &'static str, field_type: FieldType) -> LeadField {
    LeadField {
        name,
        label,
        field_type,
        relation: None,
    }
}

const fn reference(name: &'static str, label: &'static str, relation: &'static str) -> LeadField {
    LeadField {
        name,
        label,
        field_type: FieldType::Reference,
        relation: Some(relation),
    }
}

static LEAD_FIELDS: &[LeadField] = &[
    field("name", "Opportunity", FieldType::Text),
    field("contact_name", "Contact Name", FieldType::Text),
    field("partner_name", "Customer Name", FieldType::Text),
    field("email_from", "Email", FieldType::Text),
    field("phone", "Phone", FieldType::Phone),
    field("mobile", "Mobile", FieldType::Phone),
    field("function", "Job Position", FieldType::Text),
    field("title_label", "Title", FieldType::Text),
    field("street", "Street", FieldType::Text),
    field("street2", "Street2", FieldType::Text),
    field("city", "City", FieldType::Text),
    field("zip", "Zip", FieldType::Text),
    reference("state_id", "State", "state"),
    reference("country_id", "Country", "country"),
    field("website", "Website", FieldType::Text),
    field("description", "Notes", FieldType::LongText),
    field("expected_revenue", "Expected Revenue", FieldType::Monetary),
    field("probability", "Probability", FieldType::Numeric),
    field("priority", "Priority", FieldType::Selection),
    field("date_deadline", "Expected Closing", FieldType::Date),
    field("date_closed", "Closed Date", FieldType::DateTime),
    reference("user_id", "Salesperson", "user"),
    field("referred", "Referred By", FieldType::Text),
    field("employees", "Employees", FieldType::Integer),
    field("opt_out", "Opt-Out", FieldType::Boolean),
    field("comment", "Internal Comment", FieldType::Html),
];

/// Every lead field a mapping may be assigned to.
pub fn lead_fields() -> &'static [LeadField] {
    LEAD_FIELDS
}

pub fn lead_field(name: &str) -> Option<&'static LeadField> {
    LEAD_FIELDS.iter().find(|f| f.name == name)
}

/// Transformed value for one mapped lead field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Reference(RecordId),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Persisted lead. Never updated by the sync; `active = false` marks a discarded lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: RecordId,
    pub external_lead_id: String,
    pub name: String,
    pub description: String,
    #[serde(flatten)]
    pub routing: FormRouting,
    pub form_id: Option<RecordId>,
    pub page_id: Option<RecordId>,
    pub date_open: NaiveDateTime,
    pub active: bool,
    pub mapped_fields: BTreeMap<String, FieldValue>,
    pub created_at: DateTime<Utc>,
}

/// Lead ready for insertion; the store derives `page_id` from `form_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub external_lead_id: String,
    pub name: String,
    pub description: String,
    pub routing: FormRouting,
    pub form_id: RecordId,
    pub date_open: NaiveDateTime,
    pub active: bool,
    pub mapped_fields: BTreeMap<String, FieldValue>,
}

/// Record a reference-typed lead field can point at (team, country, user...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub id: RecordId,
    pub model: String,
    pub display_name: String,
}

/// Drops a trailing `+hhmm` offset and swaps the ISO `T` separator for a space.
pub fn normalize_graph_timestamp(value: &str) -> String {
    value
        .split('+')
        .next()
        .unwrap_or_default()
        .replace('T', " ")
}

pub fn parse_graph_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&normalize_graph_timestamp(value), "%Y-%m-%d %H:%M:%S").ok()
}

/// Renders a raw lead value the way it appears in lead notes.
pub fn raw_value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn graph_timestamps_lose_offset_and_separator() {
        assert_eq!(
            normalize_graph_timestamp("2020-01-01T10:00:00+0000"),
            "2020-01-01 10:00:00"
        );
        assert_eq!(normalize_graph_timestamp("2020-01-01"), "2020-01-01");
    }

    #[test]
    fn graph_timestamps_parse_to_naive_datetime() {
        let parsed = parse_graph_timestamp("2018-03-05T08:30:15+0000").expect("timestamp");
        let expected = NaiveDate::from_ymd_opt(2018, 3, 5)
            .and_then(|d| d.and_hms_opt(8, 30, 15))
            .expect("date");
        assert_eq!(parsed, expected);
        assert!(parse_graph_timestamp("yesterday").is_none());
    }

    #[test]
    fn catalog_lookup_exposes_relations() {
        let country = lead_field("country_id").expect("country field");
        assert_eq!(country.field_type, FieldType::Reference);
        assert_eq!(country.relation, Some("country"));
        assert!(lead_field("does_not_exist").is_none());
        assert!(lead_fields().iter().all(|f| {
            (f.field_type == FieldType::Reference) == f.relation.is_some()
        }));
    }

    #[test]
    fn raw_values_render_without_json_quoting() {
        assert_eq!(raw_value_text(&JsonValue::String("Jane".into())), "Jane");
        assert_eq!(raw_value_text(&serde_json::json!(42)), "42");
        assert_eq!(raw_value_text(&JsonValue::Null), "");
    }

    #[test]
    fn page_tokens_are_not_serialized() {
        let page = Page {
            id: 1,
            name: "1234".into(),
            access_token: "secret".into(),
        };
        let text = serde_json::to_string(&page).expect("json");
        assert!(!text.contains("secret"));
    }
}
