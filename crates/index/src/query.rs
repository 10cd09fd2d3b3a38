//! Translation of a [`FilterQuery`] into the Elasticsearch query DSL.

use chatlabel_core::{Filter, FilterOperator, FilterQuery};
use serde_json::{json, Map, Value};

/// Builds the `query` object: a `bool` with the date range and positive
/// operators under `filter` and `different` under `must_not`.
pub fn build_query(query: &FilterQuery) -> Value {
    let mut filter = Vec::new();
    let mut must_not = Vec::new();

    if query.date_from.is_some() || query.date_to.is_some() {
        let mut range = Map::new();
        if let Some(from) = query.date_from {
            range.insert("gte".to_string(), json!(from.to_string()));
        }
        if let Some(to) = query.date_to {
            range.insert("lte".to_string(), json!(to.to_string()));
        }
        filter.push(json!({ "range": { query.date_field.as_str(): range } }));
    }

    for f in &query.filters {
        match f.operator {
            FilterOperator::Different => must_not.push(clause(f)),
            _ => filter.push(clause(f)),
        }
    }

    let mut bool_query = json!({ "filter": filter });
    if !must_not.is_empty() {
        bool_query["must_not"] = Value::Array(must_not);
    }
    json!({ "bool": bool_query })
}

fn clause(f: &Filter) -> Value {
    let field = f.field.as_str();
    let value = f.value.as_str();
    match f.operator {
        FilterOperator::Equals | FilterOperator::Different => {
            json!({ "match_phrase": { field: value } })
        }
        FilterOperator::Contains => json!({ "wildcard": { field: format!("*{value}*") } }),
        FilterOperator::StartsWith => json!({ "prefix": { field: value } }),
        FilterOperator::Regexp => json!({ "regexp": { field: value } }),
        FilterOperator::Fuzzy => {
            json!({ "fuzzy": { field: { "value": value, "fuzziness": "AUTO" } } })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatlabel_core::FieldConfig;
    use chrono::NaiveDate;

    fn filter(field: &str, operator: FilterOperator, value: &str) -> Filter {
        Filter {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    #[test]
    fn empty_query_matches_everything() {
        let query = FilterQuery::match_all(&FieldConfig::default());
        assert_eq!(build_query(&query), json!({ "bool": { "filter": [] } }));
    }

    #[test]
    fn operators_map_to_dsl_clauses() {
        let query = FilterQuery {
            date_from: NaiveDate::from_ymd_opt(2024, 1, 1),
            filters: vec![
                filter("SUBJECT", FilterOperator::Equals, "wire transfer"),
                filter("FROM", FilterOperator::Different, "bot@corp.com"),
                filter("CONTENT", FilterOperator::Contains, "iban"),
                filter("SUBJECT", FilterOperator::StartsWith, "Re"),
                filter("TO", FilterOperator::Regexp, "ana.*"),
                filter("CONTENT", FilterOperator::Fuzzy, "invoise"),
            ],
            ..FilterQuery::match_all(&FieldConfig::default())
        };
        assert_eq!(
            build_query(&query),
            json!({ "bool": {
                "filter": [
                    { "range": { "DATE_CREATED": { "gte": "2024-01-01" } } },
                    { "match_phrase": { "SUBJECT": "wire transfer" } },
                    { "wildcard": { "CONTENT": "*iban*" } },
                    { "prefix": { "SUBJECT": "Re" } },
                    { "regexp": { "TO": "ana.*" } },
                    { "fuzzy": { "CONTENT": { "value": "invoise", "fuzziness": "AUTO" } } },
                ],
                "must_not": [ { "match_phrase": { "FROM": "bot@corp.com" } } ],
            } })
        );
    }
}
