use std::sync::Arc;

use tracing::{debug, warn};

use super::config::{batch_mean, FeatureConfig, FieldSpec, Imputation, Transform};
use super::{FeatureSchema, FeatureTable, FeatureVector, LabeledFeatureTable, RawRecord, RawValue};
use crate::error::{PipelineError, Result};

/// Transform raw records into a fixed-schema feature table.
///
/// Pure function of `records` and `config`: the same input always produces
/// the same vectors. Records dropped by a `drop` imputation policy do not
/// appear in the output; row ids keep the remaining vectors traceable.
pub fn extract(records: &[RawRecord], config: &FeatureConfig) -> Result<FeatureTable> {
    let (schema, rows) = extract_rows(records, config)?;
    FeatureTable::new(schema, rows.into_iter().map(|(_, v)| v).collect())
}

/// Like [`extract`], additionally reading ground truth from
/// `config.label_field`. A label column absent from every record yields an
/// unlabeled table.
pub fn extract_labeled(
    records: &[RawRecord],
    config: &FeatureConfig,
) -> Result<LabeledFeatureTable> {
    let (schema, rows) = extract_rows(records, config)?;

    let labels = match &config.label_field {
        Some(label) if records.iter().any(|r| r.has_field(label)) => {
            let labels = rows
                .iter()
                .map(|(idx, _)| parse_label(&records[*idx], label, *idx))
                .collect::<Result<Vec<_>>>()?;
            Some(labels)
        }
        Some(label) => {
            debug!(%label, "label column not present, table is unlabeled");
            None
        }
        None => None,
    };

    let table = FeatureTable::new(schema, rows.into_iter().map(|(_, v)| v).collect())?;
    LabeledFeatureTable::new(table, labels)
}

fn extract_rows(
    records: &[RawRecord],
    config: &FeatureConfig,
) -> Result<(Arc<FeatureSchema>, Vec<(usize, FeatureVector)>)> {
    config.validate()?;
    let schema = Arc::new(FeatureSchema::new(config.feature_names())?);
    let fields = config.ordered_fields();

    if records.is_empty() {
        return Ok((schema, Vec::new()));
    }

    for field in &fields {
        if !field.impute.covers_absence() && !records.iter().any(|r| r.has_field(&field.name)) {
            return Err(PipelineError::schema(
                field.name.as_str(),
                "configured field is absent from every input record and has no imputation policy",
            ));
        }
    }

    // Unpinned mean_fill constants fall back to the batch mean.
    let mut fills = Vec::with_capacity(fields.len());
    for field in &fields {
        let fill = match field.impute {
            Imputation::MeanFill { mean: Some(m) } => Some(m),
            Imputation::MeanFill { mean: None } => {
                let m = batch_mean(records, field)?;
                warn!(
                    field = %field.name,
                    mean = m,
                    "mean_fill constant not pinned; using batch mean (freeze the config for serving)"
                );
                Some(m)
            }
            _ => None,
        };
        fills.push(fill);
    }

    let mut rows = Vec::with_capacity(records.len());
    let mut dropped = 0usize;
    'records: for (idx, record) in records.iter().enumerate() {
        let mut values = Vec::with_capacity(schema.len());
        for (field, fill) in fields.iter().zip(fills.iter()) {
            match encode_field(record, idx, field, *fill)? {
                Some(encoded) => values.extend(encoded),
                None => {
                    dropped += 1;
                    continue 'records;
                }
            }
        }
        let vector = FeatureVector::new(schema.clone(), values)?.with_row_id(row_id(record, config));
        rows.push((idx, vector));
    }

    debug!(
        input = records.len(),
        output = rows.len(),
        dropped,
        features = schema.len(),
        "extracted feature table"
    );
    Ok((schema, rows))
}

fn row_id(record: &RawRecord, config: &FeatureConfig) -> Option<String> {
    record.id.clone().or_else(|| {
        config
            .id_field
            .as_deref()
            .and_then(|f| record.value(f))
            .map(RawValue::to_string)
    })
}

/// Encode one field of one record. `None` means the record is dropped.
fn encode_field(
    record: &RawRecord,
    idx: usize,
    field: &FieldSpec,
    fill: Option<f64>,
) -> Result<Option<Vec<f64>>> {
    let width = field.output_names().len();

    let encoded = match &field.transform {
        Transform::OneHot { vocabulary } => record.value(&field.name).map(|v| {
            let category = category(v);
            vocabulary
                .iter()
                .map(|entry| if *entry == category { 1.0 } else { 0.0 })
                .collect::<Vec<_>>()
        }),
        Transform::Numeric | Transform::Ordinal { .. } => {
            numeric_value(record, field)?.map(|v| vec![v])
        }
    };

    if let Some(values) = encoded {
        return Ok(Some(values));
    }

    match &field.impute {
        Imputation::Reject => Err(PipelineError::schema(
            field.name.as_str(),
            format!(
                "missing value in record {} and imputation policy is reject",
                record.id.clone().unwrap_or_else(|| idx.to_string())
            ),
        )),
        Imputation::Drop => Ok(None),
        Imputation::ZeroFill => Ok(Some(vec![0.0; width])),
        Imputation::MeanFill { .. } => {
            let m = fill.ok_or_else(|| {
                PipelineError::schema(field.name.as_str(), "mean_fill constant unresolved")
            })?;
            Ok(Some(vec![m; width]))
        }
    }
}

/// Single numeric value for a numeric or ordinal field; `None` when the
/// value is missing or non-finite.
pub(crate) fn numeric_value(record: &RawRecord, field: &FieldSpec) -> Result<Option<f64>> {
    let Some(raw) = record.value(&field.name) else {
        return Ok(None);
    };
    let value = match &field.transform {
        Transform::Numeric => match raw {
            RawValue::Number(n) => *n,
            RawValue::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                PipelineError::schema(
                    field.name.as_str(),
                    format!("value `{}` is not numeric", s),
                )
            })?,
            RawValue::Null => return Ok(None),
        },
        Transform::Ordinal { vocabulary } => {
            let category = category(raw);
            vocabulary
                .iter()
                .position(|v| *v == category)
                .unwrap_or(vocabulary.len()) as f64
        }
        Transform::OneHot { .. } => {
            return Err(PipelineError::schema(
                field.name.as_str(),
                "one_hot fields have no single numeric value",
            ))
        }
    };
    Ok(value.is_finite().then_some(value))
}

fn category(raw: &RawValue) -> String {
    match raw {
        RawValue::Text(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn parse_label(record: &RawRecord, label: &str, idx: usize) -> Result<bool> {
    let raw = record.value(label).ok_or_else(|| {
        PipelineError::schema(label, format!("record {} has no label", idx))
    })?;
    match category(raw).to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "anomaly" | "anomalous" => Ok(true),
        "0" | "false" | "no" | "normal" => Ok(false),
        other => Err(PipelineError::schema(
            label,
            format!("record {} has unrecognised label `{}`", idx, other),
        )),
    }
}
