//! Field transformation and lead assembly.

use std::collections::BTreeMap;

use leadsync_core::{
    lead_field, normalize_graph_timestamp, parse_graph_timestamp, raw_value_text, FieldMapping,
    FieldType, FieldValue, Form, LeadField, NewLead, RawLead,
};
use leadsync_storage::LeadStore;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use crate::SyncError;

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("field {field}: {value:?} is not a number")]
    InvalidFloat { field: String, value: String },
    #[error("field {field}: {value:?} is not a whole number")]
    InvalidInteger { field: String, value: String },
    #[error("lead {lead_id}: created_time {value:?} is not a timestamp")]
    InvalidTimestamp { lead_id: String, value: String },
    #[error("lead has no id")]
    MissingLeadId,
    #[error("lead {0} has no created_time")]
    MissingCreatedTime(String),
}

/// Lead field values plus the `label: value` note lines describing the raw lead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedFields {
    pub values: BTreeMap<String, FieldValue>,
    pub notes: Vec<String>,
}

/// Text of the lead's `id`, if it carries one.
pub fn external_lead_id(lead: &RawLead) -> Option<String> {
    lead.get("id")
        .map(raw_value_text)
        .filter(|id| !id.is_empty())
}

/// Translates a flattened raw lead through the form's assigned mappings.
///
/// Notes list mapped fields first, in lead key order, then every unmapped key in
/// lead key order. Reference fields resolve only on a single exact display name match.
pub async fn get_fields_from_data(
    store: &dyn LeadStore,
    lead: &RawLead,
    mappings: &[FieldMapping],
) -> Result<MappedFields, SyncError> {
    let assigned = mappings
        .iter()
        .filter_map(|m| {
            let field = lead_field(m.lead_field.as_deref()?)?;
            Some((m.external_key.as_str(), field))
        })
        .collect::<Vec<_>>();

    let mut mapped = MappedFields::default();
    let mut unmapped = Vec::new();

    for (name, value) in lead {
        let Some((_, field)) = assigned.iter().find(|(key, _)| *key == name.as_str()) else {
            unmapped.push((name, value));
            continue;
        };
        let text = raw_value_text(value);
        mapped.notes.push(format!("{}: {}", field.label, text));
        if let Some(converted) = convert_value(store, field, value, &text).await? {
            mapped.values.insert(field.name.to_string(), converted);
        }
    }

    for (name, value) in unmapped {
        mapped
            .notes
            .push(format!("{}: {}", name, raw_value_text(value)));
    }

    Ok(mapped)
}

async fn convert_value(
    store: &dyn LeadStore,
    field: &LeadField,
    value: &JsonValue,
    text: &str,
) -> Result<Option<FieldValue>, SyncError> {
    let converted = match field.field_type {
        FieldType::Reference => {
            let relation = field.relation.unwrap_or(field.name);
            let matches = store.search_references(relation, text).await?;
            match matches.as_slice() {
                [only] => Some(FieldValue::Reference(only.id)),
                _ => {
                    debug!(
                        field = field.name,
                        relation,
                        matches = matches.len(),
                        "reference lookup did not resolve to a single record"
                    );
                    None
                }
            }
        }
        FieldType::Numeric | FieldType::Monetary => {
            let parsed = value
                .as_f64()
                .or_else(|| text.trim().parse::<f64>().ok())
                .ok_or_else(|| TransformError::InvalidFloat {
                    field: field.name.to_string(),
                    value: text.to_string(),
                })?;
            Some(FieldValue::Float(parsed))
        }
        FieldType::Integer => {
            let parsed = value
                .as_i64()
                .or_else(|| text.trim().parse::<i64>().ok())
                .ok_or_else(|| TransformError::InvalidInteger {
                    field: field.name.to_string(),
                    value: text.to_string(),
                })?;
            Some(FieldValue::Integer(parsed))
        }
        // TODO: split date and datetime once date fields drop the time component
        FieldType::Date | FieldType::DateTime => {
            Some(FieldValue::Text(normalize_graph_timestamp(text)))
        }
        FieldType::Boolean => Some(FieldValue::Boolean(text == "true")),
        FieldType::Selection
        | FieldType::Text
        | FieldType::LongText
        | FieldType::Html
        | FieldType::Phone => Some(FieldValue::Text(text.to_string())),
    };
    Ok(converted)
}

/// Mapped `name` when present and non-empty, else `<form name> - <lead id>`.
pub fn opportunity_name(
    values: &BTreeMap<String, FieldValue>,
    form: &Form,
    external_lead_id: &str,
) -> String {
    match values.get("name").and_then(FieldValue::as_text) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("{} - {}", form.name, external_lead_id),
    }
}

/// Folds mapped fields, notes and form routing into an insertable lead.
pub fn prepare_lead_creation(
    mapped: MappedFields,
    lead: &RawLead,
    form: &Form,
) -> Result<NewLead, TransformError> {
    let external_lead_id = external_lead_id(lead).ok_or(TransformError::MissingLeadId)?;
    let created_time = lead
        .get("created_time")
        .map(raw_value_text)
        .ok_or_else(|| TransformError::MissingCreatedTime(external_lead_id.clone()))?;
    let date_open =
        parse_graph_timestamp(&created_time).ok_or_else(|| TransformError::InvalidTimestamp {
            lead_id: external_lead_id.clone(),
            value: created_time.clone(),
        })?;

    let name = opportunity_name(&mapped.values, form, &external_lead_id);
    let mut mapped_fields = mapped.values;
    mapped_fields.remove("name");
    mapped_fields.remove("description");

    Ok(NewLead {
        external_lead_id,
        name,
        description: mapped.notes.join("\n"),
        routing: form.routing,
        form_id: form.id,
        date_open,
        active: true,
        mapped_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadsync_core::{FormRouting, NewForm, NewPage, RecordId};
    use leadsync_storage::MemoryStore;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawLead {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn mapping(id: RecordId, key: &str, field: Option<&str>) -> FieldMapping {
        FieldMapping {
            id,
            form_id: 1,
            label: key.to_string(),
            external_key: key.to_string(),
            lead_field: field.map(str::to_string),
        }
    }

    fn form() -> Form {
        Form {
            id: 1,
            page_id: 1,
            name: "Spring Promo".into(),
            external_form_id: "55501".into(),
            access_token: "token".into(),
            routing: FormRouting {
                team_id: Some(7),
                campaign_id: Some(8),
                source_id: None,
                medium_id: Some(9),
            },
        }
    }

    #[tokio::test]
    async fn unmapped_notes_follow_mapped_notes() {
        let store = MemoryStore::new();
        let lead = raw(json!({
            "ad_name": "Spring ad",
            "full_name": "Jane Doe",
            "city_guess": "Lyon",
            "email": "jane@example.com",
        }));
        let mappings = vec![
            mapping(1, "full_name", Some("contact_name")),
            mapping(2, "email", Some("email_from")),
            mapping(3, "city_guess", None),
        ];

        let mapped = get_fields_from_data(&store, &lead, &mappings).await.unwrap();

        assert_eq!(mapped.values.len(), 2);
        assert_eq!(
            mapped.notes,
            vec![
                "Contact Name: Jane Doe",
                "Email: jane@example.com",
                "ad_name: Spring ad",
                "city_guess: Lyon",
            ]
        );
    }

    #[tokio::test]
    async fn first_assigned_mapping_wins_for_a_shared_key() {
        let store = MemoryStore::new();
        let lead = raw(json!({ "contact": "Jane Doe" }));

        let mappings = vec![
            mapping(1, "contact", None),
            mapping(2, "contact", Some("contact_name")),
        ];
        let mapped = get_fields_from_data(&store, &lead, &mappings).await.unwrap();
        assert_eq!(
            mapped.values,
            BTreeMap::from([(
                "contact_name".to_string(),
                FieldValue::Text("Jane Doe".into())
            )])
        );
        assert_eq!(mapped.notes, vec!["Contact Name: Jane Doe"]);

        let mappings = vec![
            mapping(1, "contact", Some("partner_name")),
            mapping(2, "contact", Some("contact_name")),
        ];
        let mapped = get_fields_from_data(&store, &lead, &mappings).await.unwrap();
        assert_eq!(mapped.values.len(), 1);
        assert_eq!(
            mapped.values["partner_name"],
            FieldValue::Text("Jane Doe".into())
        );
        assert_eq!(mapped.notes.len(), 1);
    }

    #[tokio::test]
    async fn scalar_types_are_converted() {
        let store = MemoryStore::new();
        let lead = raw(json!({
            "revenue": "1250.50",
            "headcount": " 42 ",
            "deadline": "2020-01-01T10:00:00+0000",
            "priority": "2",
            "opted_out": "true",
            "phone": "+33 6 12 34 56 78",
        }));
        let mappings = vec![
            mapping(1, "revenue", Some("expected_revenue")),
            mapping(2, "headcount", Some("employees")),
            mapping(3, "deadline", Some("date_deadline")),
            mapping(4, "priority", Some("priority")),
            mapping(5, "opted_out", Some("opt_out")),
            mapping(6, "phone", Some("phone")),
        ];

        let values = get_fields_from_data(&store, &lead, &mappings)
            .await
            .unwrap()
            .values;

        assert_eq!(values["expected_revenue"], FieldValue::Float(1250.5));
        assert_eq!(values["employees"], FieldValue::Integer(42));
        assert_eq!(
            values["date_deadline"],
            FieldValue::Text("2020-01-01 10:00:00".into())
        );
        assert_eq!(values["priority"], FieldValue::Text("2".into()));
        assert_eq!(values["opt_out"], FieldValue::Boolean(true));
        assert_eq!(values["phone"], FieldValue::Text("+33 6 12 34 56 78".into()));
    }

    #[tokio::test]
    async fn booleans_are_true_only_for_literal_true() {
        let store = MemoryStore::new();
        let mappings = vec![mapping(1, "opted_out", Some("opt_out"))];
        for (input, expected) in [("true", true), ("false", false), ("", false), ("yes", false)] {
            let lead = raw(json!({ "opted_out": input }));
            let values = get_fields_from_data(&store, &lead, &mappings)
                .await
                .unwrap()
                .values;
            assert_eq!(values["opt_out"], FieldValue::Boolean(expected), "input {input:?}");
        }
    }

    #[tokio::test]
    async fn references_resolve_only_on_single_match() {
        let store = MemoryStore::new();
        let france = store.create_reference("country", "France").await.unwrap();
        store.create_reference("country", "Georgia").await.unwrap();
        store.create_reference("country", "Georgia").await.unwrap();
        let mappings = vec![mapping(1, "country", Some("country_id"))];

        for (input, expected) in [
            ("France", Some(FieldValue::Reference(france.id))),
            ("Georgia", None),
            ("Atlantis", None),
        ] {
            let lead = raw(json!({ "country": input }));
            let mapped = get_fields_from_data(&store, &lead, &mappings).await.unwrap();
            assert_eq!(mapped.values.get("country_id").cloned(), expected, "input {input}");
            assert_eq!(mapped.notes, vec![format!("Country: {input}")]);
        }
    }

    #[tokio::test]
    async fn unparseable_numbers_fail_the_lead() {
        let store = MemoryStore::new();
        let lead = raw(json!({ "revenue": "lots" }));
        let mappings = vec![mapping(1, "revenue", Some("expected_revenue"))];
        let err = get_fields_from_data(&store, &lead, &mappings)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Transform(TransformError::InvalidFloat { .. })
        ));
    }

    #[test]
    fn lead_assembly_uses_form_routing_and_synthesized_title() {
        let lead = raw(json!({
            "created_time": "2020-01-01T10:00:00+0000",
            "id": "123",
        }));
        let mapped = MappedFields {
            values: BTreeMap::from([(
                "email_from".to_string(),
                FieldValue::Text("jane@example.com".into()),
            )]),
            notes: vec!["Email: jane@example.com".into(), "ad_id: 9".into()],
        };

        let new_lead = prepare_lead_creation(mapped, &lead, &form()).unwrap();

        assert_eq!(new_lead.external_lead_id, "123");
        assert_eq!(new_lead.name, "Spring Promo - 123");
        assert_eq!(new_lead.description, "Email: jane@example.com\nad_id: 9");
        assert_eq!(new_lead.routing, form().routing);
        assert_eq!(new_lead.form_id, 1);
        assert_eq!(
            new_lead.date_open.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2020-01-01 10:00:00"
        );
        assert!(new_lead.active);
    }

    #[test]
    fn mapped_name_becomes_title_unless_empty() {
        let mut values = BTreeMap::new();
        values.insert("name".to_string(), FieldValue::Text("Roof repair".into()));
        assert_eq!(opportunity_name(&values, &form(), "5"), "Roof repair");

        values.insert("name".to_string(), FieldValue::Text(String::new()));
        assert_eq!(opportunity_name(&values, &form(), "5"), "Spring Promo - 5");
    }

    #[test]
    fn assembly_requires_id_and_created_time() {
        let err = prepare_lead_creation(MappedFields::default(), &raw(json!({})), &form())
            .unwrap_err();
        assert_eq!(err, TransformError::MissingLeadId);

        let err = prepare_lead_creation(
            MappedFields::default(),
            &raw(json!({"id": "7", "created_time": "soon"})),
            &form(),
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::InvalidTimestamp { .. }));
    }

    #[tokio::test]
    async fn assembled_leads_insert_with_page_from_form() {
        let store = MemoryStore::new();
        let page = store
            .create_page(NewPage {
                name: "1029".into(),
                access_token: "t".into(),
            })
            .await
            .unwrap();
        let stored_form = store
            .create_form(NewForm {
                page_id: page.id,
                name: "Promo".into(),
                external_form_id: "f".into(),
            })
            .await
            .unwrap();
        let lead = raw(json!({"id": "1", "created_time": "2021-06-01T09:15:00+0000"}));
        let new_lead = prepare_lead_creation(MappedFields::default(), &lead, &stored_form).unwrap();
        let stored = store.insert_lead(new_lead).await.unwrap();
        assert_eq!(stored.page_id, Some(page.id));
        assert_eq!(stored.name, "Promo - 1");
    }
}
