//! Conversion of typed source fields into destination values.

use chrono::{TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::assets::{AssetOutcome, AssetTransferer};
use crate::destination::{Document, FieldValue};
use crate::error::{Error, Result};
use crate::source::{FieldTag, SourceRecord, TypedValue};

/// Field holding the record name in every document.
pub const ID_FIELD: &str = "id";

/// A record converted into a staged document.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedRecord {
    /// Document ready to be written.
    pub document: Document,
    /// Asset fields that kept their source URL because the transfer failed.
    pub degraded_fields: Vec<String>,
}

impl ConvertedRecord {
    /// Returns `true` if any asset fell back to its source URL.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.degraded_fields.is_empty()
    }
}

/// Converts a non-asset value. Deterministic: equal input, equal output.
///
/// Asset values are not interpreted here; they map to their raw JSON.
///
/// # Errors
///
/// Returns [`Error::Conversion`] if the value does not fit its tag.
pub fn convert_value(field: &str, value: &TypedValue) -> Result<FieldValue> {
    let raw = &value.value;
    match &value.tag {
        FieldTag::Int64 => parse_integer(field, raw).map(FieldValue::Integer),
        FieldTag::Double => parse_double(field, raw).map(FieldValue::Double),
        FieldTag::Timestamp => {
            let millis = parse_integer(field, raw)?;
            // Whole seconds only; the sub-second part is dropped.
            Utc.timestamp_opt(millis.div_euclid(1000), 0)
                .single()
                .map(FieldValue::Timestamp)
                .ok_or_else(|| Error::conversion(field, format!("timestamp {} out of range", millis)))
        }
        FieldTag::Reference => Ok(FieldValue::String(
            raw.get("recordName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        )),
        FieldTag::Location => {
            if !raw.is_object() {
                return Err(Error::conversion(field, "location is not an object"));
            }
            let mut map = BTreeMap::new();
            for key in ["latitude", "longitude"] {
                let coordinate = match raw.get(key) {
                    Some(v) if !v.is_null() => FieldValue::Double(parse_double(field, v)?),
                    _ => FieldValue::Null,
                };
                map.insert(key.to_string(), coordinate);
            }
            Ok(FieldValue::Map(map))
        }
        FieldTag::String
        | FieldTag::Asset
        | FieldTag::AssetId
        | FieldTag::Other(_)
        | FieldTag::Missing => Ok(FieldValue::from_json(raw)),
    }
}

fn parse_integer(field: &str, raw: &Value) -> Result<i64> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::conversion(field, format!("{} is not a 64-bit integer", n))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| Error::conversion(field, format!("'{}': {}", s, e))),
        other => Err(Error::conversion(
            field,
            format!("expected integer, got {}", other),
        )),
    }
}

fn parse_double(field: &str, raw: &Value) -> Result<f64> {
    match raw {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::conversion(field, format!("{} is not a double", n))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| Error::conversion(field, format!("'{}': {}", s, e))),
        other => Err(Error::conversion(
            field,
            format!("expected number, got {}", other),
        )),
    }
}

/// Converts whole records, re-hosting assets on the way.
#[derive(Clone)]
pub struct FieldConverter {
    assets: AssetTransferer,
    dry_run: bool,
}

impl FieldConverter {
    /// Creates a converter. Under `dry_run` asset URLs pass through untouched.
    pub fn new(assets: AssetTransferer, dry_run: bool) -> Self {
        Self { assets, dry_run }
    }

    /// Converts one asset value.
    ///
    /// Returns the stored value and, if a transfer was attempted, its outcome.
    pub async fn convert_asset(
        &self,
        record_id: &str,
        field: &str,
        value: &TypedValue,
    ) -> (FieldValue, Option<AssetOutcome>) {
        let Some(url) = value.download_url() else {
            warn!("Asset {} of {} has no download URL", field, record_id);
            return (FieldValue::String(String::new()), None);
        };

        if self.dry_run {
            debug!("[dry run] would transfer {} of {}", field, record_id);
            return (FieldValue::from(url), None);
        }

        let outcome = self
            .assets
            .transfer_or_passthrough(url, record_id, field)
            .await;
        (FieldValue::from(outcome.url()), Some(outcome))
    }

    /// Converts every field of a record into a staged document.
    ///
    /// Plain fields are converted before any asset is transferred, so a
    /// record with a bad field never uploads objects. Asset fields are then
    /// transferred one after another.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conversion`] for the first field that cannot be
    /// converted; asset failures degrade instead of failing.
    pub async fn convert(&self, record: &SourceRecord) -> Result<ConvertedRecord> {
        let mut document = Document::new(record.record_name.clone());
        let mut degraded_fields = Vec::new();

        let (assets, plain): (Vec<_>, Vec<_>) =
            record.fields.iter().partition(|(_, value)| value.tag.is_asset());

        for (name, value) in plain {
            document
                .fields
                .insert(name.clone(), convert_value(name, value)?);
        }

        for (name, value) in assets {
            let (converted, outcome) = self
                .convert_asset(&record.record_name, name, value)
                .await;
            if matches!(outcome, Some(AssetOutcome::Passthrough { .. })) {
                degraded_fields.push(name.clone());
            }
            document.fields.insert(name.clone(), converted);
        }

        document.fields.insert(
            ID_FIELD.to_string(),
            FieldValue::String(record.record_name.clone()),
        );

        Ok(ConvertedRecord {
            document,
            degraded_fields,
        })
    }
}

#[cfg(test)]
#[path = "convert_tests.rs"]
mod tests;
