//! Feature extraction: raw tabular records to fixed-schema numeric vectors.

pub mod config;
pub mod csv;
pub mod extract;

pub use config::{FeatureConfig, FieldSpec, Imputation, Transform};
pub use extract::{extract, extract_labeled};

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// A single raw cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Null,
    Number(f64),
    Text(String),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Number(v)
    }
}

impl From<&str> for RawValue {
    fn from(v: &str) -> Self {
        RawValue::Text(v.to_string())
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Null => Ok(()),
            RawValue::Number(n) => write!(f, "{}", n),
            RawValue::Text(s) => f.write_str(s),
        }
    }
}

/// One observed unit: an ordered mapping of field name to raw value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: Option<String>,
    pub fields: IndexMap<String, RawValue>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_null(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), RawValue::Null);
        self
    }

    /// Present, non-null value of a field.
    pub fn value(&self, name: &str) -> Option<&RawValue> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

/// Ordered feature names. Equality covers names, order and count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    names: Vec<String>,
}

impl FeatureSchema {
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(PipelineError::schema("*", "feature schema has no columns"));
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(PipelineError::schema(name.as_str(), "duplicate feature name"));
            }
        }
        Ok(Self { names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Describe the first difference between `self` (expected) and `other`.
    pub fn diff(&self, other: &FeatureSchema) -> Option<String> {
        if self == other {
            return None;
        }
        if self.len() != other.len() {
            return Some(format!(
                "expected {} features, got {}",
                self.len(),
                other.len()
            ));
        }
        let same_set = self.names.iter().all(|n| other.names.contains(n));
        let (i, (want, got)) = self
            .names
            .iter()
            .zip(other.names.iter())
            .enumerate()
            .find(|(_, (a, b))| a != b)?;
        if same_set {
            Some(format!(
                "feature order differs at position {}: expected `{}`, got `{}`",
                i, want, got
            ))
        } else {
            Some(format!(
                "feature name differs at position {}: expected `{}`, got `{}`",
                i, want, got
            ))
        }
    }
}

/// Numeric vector bound to the schema it was produced under.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    schema: Arc<FeatureSchema>,
    values: Vec<f64>,
    row_id: Option<String>,
}

impl FeatureVector {
    pub fn new(schema: Arc<FeatureSchema>, values: Vec<f64>) -> Result<Self> {
        if values.len() != schema.len() {
            return Err(PipelineError::schema(
                "*",
                format!(
                    "vector has {} values but schema has {} features",
                    values.len(),
                    schema.len()
                ),
            ));
        }
        if let Some((name, v)) = schema
            .names()
            .iter()
            .zip(values.iter())
            .find(|(_, v)| !v.is_finite())
        {
            return Err(PipelineError::schema(
                name.as_str(),
                format!("feature value {} is not finite", v),
            ));
        }
        Ok(Self {
            schema,
            values,
            row_id: None,
        })
    }

    pub fn with_row_id(mut self, row_id: Option<String>) -> Self {
        self.row_id = row_id;
        self
    }

    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn row_id(&self) -> Option<&str> {
        self.row_id.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        let idx = self.schema.names().iter().position(|n| n == name)?;
        Some(self.values[idx])
    }
}

/// Ordered vectors that all share one schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    schema: Arc<FeatureSchema>,
    rows: Vec<FeatureVector>,
}

impl FeatureTable {
    pub fn new(schema: Arc<FeatureSchema>, rows: Vec<FeatureVector>) -> Result<Self> {
        if let Some((i, bad)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.schema.as_ref() != schema.as_ref())
        {
            let detail = schema
                .diff(&bad.schema)
                .unwrap_or_else(|| "schema differs".to_string());
            return Err(PipelineError::schema(
                format!("row {}", i),
                format!("vector schema is inconsistent with the table: {}", detail),
            ));
        }
        Ok(Self { schema, rows })
    }

    /// Build a table from plain value rows.
    pub fn from_rows(names: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        let schema = Arc::new(FeatureSchema::new(names)?);
        let vectors = rows
            .into_iter()
            .map(|values| FeatureVector::new(schema.clone(), values))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema,
            rows: vectors,
        })
    }

    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    pub fn rows(&self) -> &[FeatureVector] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<FeatureVector> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one feature column.
    pub fn column(&self, idx: usize) -> impl Iterator<Item = f64> + '_ {
        self.rows.iter().map(move |r| r.values[idx])
    }

    pub fn row_ids(&self) -> impl Iterator<Item = Option<&str>> {
        self.rows.iter().map(|r| r.row_id())
    }

    /// Split rows by index into (kept, taken). Used for holdout calibration.
    pub(crate) fn partition(&self, take: &[usize]) -> (FeatureTable, FeatureTable) {
        let mut mask = vec![false; self.rows.len()];
        for &i in take {
            if let Some(m) = mask.get_mut(i) {
                *m = true;
            }
        }
        let mut kept = Vec::with_capacity(self.rows.len().saturating_sub(take.len()));
        let mut taken = Vec::with_capacity(take.len());
        for (row, &is_taken) in self.rows.iter().zip(mask.iter()) {
            if is_taken {
                taken.push(row.clone());
            } else {
                kept.push(row.clone());
            }
        }
        (
            FeatureTable {
                schema: self.schema.clone(),
                rows: kept,
            },
            FeatureTable {
                schema: self.schema.clone(),
                rows: taken,
            },
        )
    }
}

/// Feature table with optional ground truth (`true` = anomalous).
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledFeatureTable {
    pub table: FeatureTable,
    labels: Option<Vec<bool>>,
}

impl LabeledFeatureTable {
    pub fn new(table: FeatureTable, labels: Option<Vec<bool>>) -> Result<Self> {
        if let Some(labels) = &labels {
            if labels.len() != table.len() {
                return Err(PipelineError::schema(
                    "label",
                    format!(
                        "{} labels supplied for {} rows",
                        labels.len(),
                        table.len()
                    ),
                ));
            }
        }
        Ok(Self { table, labels })
    }

    pub fn unlabeled(table: FeatureTable) -> Self {
        Self {
            table,
            labels: None,
        }
    }

    pub fn labels(&self) -> Option<&[bool]> {
        self.labels.as_deref()
    }
}
