use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{ChatlabelError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[serde(alias = "DOCUMENT_RELEVANCE")]
    SetRelevance,
    #[serde(alias = "DOCUMENT_LABELS")]
    AppendLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TargetValue {
    Integer(i64),
    Text(String),
}

impl TargetValue {
    pub fn to_json(&self) -> Value {
        match self {
            TargetValue::Integer(value) => Value::from(*value),
            TargetValue::Text(value) => Value::from(value.as_str()),
        }
    }
}

impl fmt::Display for TargetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetValue::Integer(value) => write!(f, "{value}"),
            TargetValue::Text(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    Different,
    Contains,
    #[serde(alias = "starts with")]
    StartsWith,
    Regexp,
    Fuzzy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: String,
}

/// A natural-language condition, optionally scoped to one field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Predicate {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub field: Option<String>,
    pub text: String,
}

fn empty_as_none<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|field| !field.trim().is_empty()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnnotationRequest {
    #[serde(default)]
    pub id: Option<u64>,
    pub action: Action,
    pub target_value: TargetValue,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
    #[serde(default, rename = "filters")]
    pub structured_filters: Vec<Filter>,
    #[serde(default, alias = "instructions")]
    pub free_text_predicates: Vec<Predicate>,
}

impl AnnotationRequest {
    pub fn from_json(raw: &str) -> Result<Self> {
        let request: AnnotationRequest = serde_json::from_str(raw)?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(ChatlabelError::Configuration(format!(
                    "date_from {from} is after date_to {to}"
                )));
            }
        }
        if self.action == Action::AppendLabel && matches!(&self.target_value, TargetValue::Text(label) if label.trim().is_empty())
        {
            return Err(ChatlabelError::Configuration(
                "label to append is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_judged(&self) -> bool {
        !self.free_text_predicates.is_empty()
    }
}

/// Document field names the annotator reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FieldConfig {
    pub relevance: String,
    pub labels: String,
    pub date_created: String,
    pub default_projection: Vec<String>,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            relevance: "DOCUMENT_RELEVANCE".to_string(),
            labels: "DOCUMENT_LABELS".to_string(),
            date_created: "DATE_CREATED".to_string(),
            default_projection: ["SUBJECT", "CONTENT", "FROM", "TO"]
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }
    }
}

/// The structured part of a request, ready for a store to translate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterQuery {
    pub date_field: String,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub filters: Vec<Filter>,
}

impl FilterQuery {
    pub fn from_request(request: &AnnotationRequest, fields: &FieldConfig) -> Self {
        Self {
            date_field: fields.date_created.clone(),
            date_from: request.date_from,
            date_to: request.date_to,
            filters: request.structured_filters.clone(),
        }
    }

    pub fn match_all(fields: &FieldConfig) -> Self {
        Self {
            date_field: fields.date_created.clone(),
            date_from: None,
            date_to: None,
            filters: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ui_request_shape() {
        let raw = r#"{
            "id": 4,
            "action": "DOCUMENT_LABELS",
            "target_value": "fraud",
            "date_from": "2023-01-01",
            "date_to": null,
            "filters": [{"field": "SUBJECT", "operator": "starts with", "value": "Re:"}],
            "instructions": [{"field": "", "text": "mentions a wire transfer"}]
        }"#;
        let request = AnnotationRequest::from_json(raw).unwrap();
        assert_eq!(request.action, Action::AppendLabel);
        assert_eq!(request.target_value, TargetValue::Text("fraud".into()));
        assert_eq!(request.structured_filters[0].operator, FilterOperator::StartsWith);
        assert_eq!(request.free_text_predicates[0].field, None);
        assert!(request.is_judged());
    }

    #[test]
    fn snake_case_names_are_accepted() {
        let raw = r#"{"action": "set_relevance", "target_value": 1, "free_text_predicates": []}"#;
        let request = AnnotationRequest::from_json(raw).unwrap();
        assert_eq!(request.action, Action::SetRelevance);
        assert_eq!(request.target_value, TargetValue::Integer(1));
        assert!(!request.is_judged());
    }

    #[test]
    fn inverted_date_range_is_rejected() {
        let raw = r#"{"action": "set_relevance", "target_value": 1,
                      "date_from": "2024-02-01", "date_to": "2024-01-01"}"#;
        assert!(AnnotationRequest::from_json(raw).is_err());
    }
}
