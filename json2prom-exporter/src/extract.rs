//! Turning a decoded JSON document into observations for one metric.

use serde_json::Value;

use json2prom_common::{Query, QueryParseError, QueryResult, value_kind};

use crate::config::MetricConfig;
use crate::error::ItemError;

/// One extracted value and its configured labels, in definition order.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// Result of running one metric definition over a document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Items that produced a value.
    pub observations: Vec<Observation>,
    /// Items that were dropped, with the reason.
    pub skipped: Vec<ItemError>,
}

/// A metric definition with its queries parsed.
#[derive(Debug, Clone)]
pub struct CompiledMetric {
    name: String,
    items: Query,
    value: Query,
    labels: Vec<(String, Query)>,
}

impl CompiledMetric {
    /// Parse every query of a metric definition.
    pub fn compile(config: &MetricConfig) -> Result<Self, QueryParseError> {
        let labels = config
            .labels
            .iter()
            .map(|label| Ok((label.name.clone(), Query::parse(&label.query)?)))
            .collect::<Result<Vec<_>, QueryParseError>>()?;

        Ok(Self {
            name: config.name.clone(),
            items: Query::parse(&config.items_query)?,
            value: Query::parse(&config.value_query)?,
            labels,
        })
    }

    /// Exported metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extract every observation this metric yields from a document.
    ///
    /// A failing item is recorded in [`Extraction::skipped`] and never affects
    /// its siblings.
    pub fn extract(&self, document: &Value) -> Extraction {
        let mut extraction = Extraction::default();

        for item in select_items(self.items.evaluate(document)) {
            match self.extract_item(item) {
                Ok(observation) => extraction.observations.push(observation),
                Err(e) => extraction.skipped.push(e),
            }
        }

        extraction
    }

    /// Evaluate the value and label queries against one item.
    pub fn extract_item(&self, item: &Value) -> Result<Observation, ItemError> {
        let value = coerce_number(&self.value.evaluate(item))?;

        let labels = self
            .labels
            .iter()
            .map(|(name, query)| Ok((name.clone(), coerce_label(name, &query.evaluate(item))?)))
            .collect::<Result<Vec<_>, ItemError>>()?;

        Ok(Observation { labels, value })
    }
}

/// Turn an items-query result into the list of items.
///
/// A sequence yields its elements, a single value is the sole item, and a
/// path that did not resolve yields no items.
pub fn select_items(result: QueryResult<'_>) -> Vec<&Value> {
    match result {
        QueryResult::Sequence(items) => items,
        QueryResult::Value(item) => vec![item],
        QueryResult::NotFound => Vec::new(),
    }
}

/// Coerce a value-query result to a number.
///
/// Numbers pass through, booleans become 1/0 and strings are parsed after
/// trimming. Anything else rejects the item.
pub fn coerce_number(result: &QueryResult<'_>) -> Result<f64, ItemError> {
    let value = match result {
        QueryResult::Value(value) => *value,
        other => {
            return Err(ItemError::ValueNotNumeric {
                found: other.kind(),
            });
        }
    };

    match value {
        Value::Number(n) => n.as_f64().ok_or(ItemError::ValueNotNumeric { found: "number" }),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(parsed) if parsed.is_finite() => Ok(parsed),
            _ => Err(ItemError::ValueNotParsable { text: s.clone() }),
        },
        other => Err(ItemError::ValueNotNumeric {
            found: value_kind(other),
        }),
    }
}

/// Coerce a label-query result to a label value.
///
/// Missing values and `null` become an empty string so the label set keeps a
/// stable shape; objects, arrays and sequences reject the item.
pub fn coerce_label(label: &str, result: &QueryResult<'_>) -> Result<String, ItemError> {
    match result {
        QueryResult::NotFound => Ok(String::new()),
        QueryResult::Value(Value::Null) => Ok(String::new()),
        QueryResult::Value(Value::String(s)) => Ok(s.clone()),
        QueryResult::Value(Value::Number(n)) => Ok(n.to_string()),
        QueryResult::Value(Value::Bool(b)) => Ok(b.to_string()),
        other => Err(ItemError::LabelNotScalar {
            label: label.to_string(),
            found: other.kind(),
        }),
    }
}
