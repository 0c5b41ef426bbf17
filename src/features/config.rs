//! Extractor configuration: which raw fields to use and how to encode them.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::extract::numeric_value;
use super::RawRecord;
use crate::error::{PipelineError, Result};

/// Structured extractor configuration. Vocabularies for categorical fields
/// are always part of the configuration so every call encodes identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub fields: Vec<FieldSpec>,
    /// Optional explicit ordering of `fields` by name. Must be a permutation.
    pub output_order: Option<Vec<String>>,
    /// Raw column carrying the row identifier.
    pub id_field: Option<String>,
    /// Raw column carrying ground-truth labels (evaluation only).
    pub label_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub impute: Imputation,
}

impl FieldSpec {
    pub fn numeric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transform: Transform::Numeric,
            impute: Imputation::Reject,
        }
    }

    pub fn one_hot(name: impl Into<String>, vocabulary: &[&str]) -> Self {
        Self {
            name: name.into(),
            transform: Transform::OneHot {
                vocabulary: vocabulary.iter().map(|s| s.to_string()).collect(),
            },
            impute: Imputation::Reject,
        }
    }

    pub fn ordinal(name: impl Into<String>, vocabulary: &[&str]) -> Self {
        Self {
            name: name.into(),
            transform: Transform::Ordinal {
                vocabulary: vocabulary.iter().map(|s| s.to_string()).collect(),
            },
            impute: Imputation::Reject,
        }
    }

    pub fn impute(mut self, impute: Imputation) -> Self {
        self.impute = impute;
        self
    }

    /// Output column names this field contributes, in order.
    pub fn output_names(&self) -> Vec<String> {
        match &self.transform {
            Transform::Numeric | Transform::Ordinal { .. } => vec![self.name.clone()],
            Transform::OneHot { vocabulary } => vocabulary
                .iter()
                .map(|v| format!("{}={}", self.name, v))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// Pass-through; text cells are parsed as numbers.
    #[default]
    Numeric,
    /// One column per vocabulary entry; unknown values encode as all zeros.
    OneHot { vocabulary: Vec<String> },
    /// Index in vocabulary; unknown values encode as `vocabulary.len()`.
    Ordinal { vocabulary: Vec<String> },
}

/// What to do when a field is absent or null in a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Imputation {
    #[default]
    Reject,
    Drop,
    ZeroFill,
    /// Fill with `mean`; when unset, the mean of the present values in the
    /// batch is used. Call [`FeatureConfig::freeze`] to pin it.
    MeanFill { mean: Option<f64> },
}

impl Imputation {
    /// Whether the policy tolerates a field missing from every record.
    pub fn covers_absence(&self) -> bool {
        !matches!(self, Imputation::Reject)
    }
}

impl FeatureConfig {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(PipelineError::Config(
                "features.fields must name at least one field".to_string(),
            ));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(PipelineError::schema("", "field name is empty"));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(PipelineError::schema(
                    field.name.as_str(),
                    "field configured more than once",
                ));
            }
            match &field.transform {
                Transform::OneHot { vocabulary } | Transform::Ordinal { vocabulary } => {
                    if vocabulary.is_empty() {
                        return Err(PipelineError::schema(
                            field.name.as_str(),
                            "categorical field needs a non-empty vocabulary",
                        ));
                    }
                    for (j, v) in vocabulary.iter().enumerate() {
                        if vocabulary[..j].contains(v) {
                            return Err(PipelineError::schema(
                                field.name.as_str(),
                                format!("vocabulary entry `{}` repeated", v),
                            ));
                        }
                    }
                }
                Transform::Numeric => {}
            }
            if matches!(field.transform, Transform::OneHot { .. })
                && matches!(field.impute, Imputation::MeanFill { .. })
            {
                return Err(PipelineError::schema(
                    field.name.as_str(),
                    "mean_fill is not defined for one_hot fields",
                ));
            }
            if let Imputation::MeanFill { mean: Some(m) } = field.impute {
                if !m.is_finite() {
                    return Err(PipelineError::schema(
                        field.name.as_str(),
                        "mean_fill constant must be finite",
                    ));
                }
            }
        }
        if let Some(order) = &self.output_order {
            let is_permutation = order.len() == self.fields.len()
                && self.fields.iter().all(|f| order.contains(&f.name));
            if !is_permutation {
                return Err(PipelineError::schema(
                    "output_order",
                    "output_order must list every configured field exactly once",
                ));
            }
        }
        Ok(())
    }

    /// Fields in output order.
    pub fn ordered_fields(&self) -> Vec<&FieldSpec> {
        match &self.output_order {
            Some(order) => order
                .iter()
                .filter_map(|name| self.fields.iter().find(|f| &f.name == name))
                .collect(),
            None => self.fields.iter().collect(),
        }
    }

    /// Output feature names, in order.
    pub fn feature_names(&self) -> Vec<String> {
        self.ordered_fields()
            .into_iter()
            .flat_map(FieldSpec::output_names)
            .collect()
    }

    /// Resolve every unset `mean_fill` constant against `records`, producing
    /// a configuration that encodes identically at training and serving time.
    pub fn freeze(&self, records: &[RawRecord]) -> Result<FeatureConfig> {
        let mut frozen = self.clone();
        for field in frozen.fields.iter_mut() {
            if let Imputation::MeanFill { mean: None } = field.impute {
                let mean = batch_mean(records, field)?;
                debug!(field = %field.name, mean, "pinned mean_fill constant");
                field.impute = Imputation::MeanFill { mean: Some(mean) };
            }
        }
        Ok(frozen)
    }

    pub fn is_frozen(&self) -> bool {
        !self
            .fields
            .iter()
            .any(|f| matches!(f.impute, Imputation::MeanFill { mean: None }))
    }
}

/// Mean of the present values of `field` in a batch. Ordinal fields
/// average their codes.
pub(crate) fn batch_mean(records: &[RawRecord], field: &FieldSpec) -> Result<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for record in records {
        if let Some(value) = numeric_value(record, field)? {
            sum += value;
            count += 1;
        }
    }
    if count == 0 {
        return Err(PipelineError::schema(
            field.name.as_str(),
            "mean_fill has no present values to average",
        ));
    }
    Ok(sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FeatureConfig {
        FeatureConfig::new(vec![
            FieldSpec::numeric("latency_ms"),
            FieldSpec::one_hot("method", &["GET", "POST"]),
            FieldSpec::ordinal("tier", &["free", "pro"]),
        ])
    }

    #[test]
    fn test_feature_names_expand_one_hot() {
        assert_eq!(
            sample().feature_names(),
            vec!["latency_ms", "method=GET", "method=POST", "tier"]
        );
    }

    #[test]
    fn test_output_order_reorders_fields() {
        let mut cfg = sample();
        cfg.output_order = Some(vec!["tier".into(), "latency_ms".into(), "method".into()]);
        cfg.validate().unwrap();
        assert_eq!(
            cfg.feature_names(),
            vec!["tier", "latency_ms", "method=GET", "method=POST"]
        );
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let mut dup = sample();
        dup.fields.push(FieldSpec::numeric("latency_ms"));
        assert!(dup.validate().is_err());

        let mut order = sample();
        order.output_order = Some(vec!["tier".into()]);
        assert!(order.validate().is_err());

        let empty_vocab = FeatureConfig::new(vec![FieldSpec::one_hot("m", &[])]);
        assert!(empty_vocab.validate().is_err());

        assert!(FeatureConfig::default().validate().is_err());
    }

    #[test]
    fn test_freeze_pins_mean() {
        let cfg = FeatureConfig::new(vec![
            FieldSpec::numeric("x").impute(Imputation::MeanFill { mean: None })
        ]);
        let records = vec![
            RawRecord::new().with("x", 2.0),
            RawRecord::new().with("x", 4.0),
            RawRecord::new().with_null("x"),
        ];
        assert!(!cfg.is_frozen());
        let frozen = cfg.freeze(&records).unwrap();
        assert!(frozen.is_frozen());
        assert_eq!(
            frozen.fields[0].impute,
            Imputation::MeanFill { mean: Some(3.0) }
        );
    }

    #[test]
    fn test_config_from_toml() {
        let cfg: FeatureConfig = toml::from_str(
            r#"
            id_field = "request_id"

            [[fields]]
            name = "latency_ms"
            impute = { policy = "zero_fill" }

            [[fields]]
            name = "method"
            transform = { kind = "one_hot", vocabulary = ["GET", "POST"] }
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.fields[0].impute, Imputation::ZeroFill);
        assert_eq!(cfg.id_field.as_deref(), Some("request_id"));
        assert_eq!(cfg.feature_names().len(), 3);
    }
}
