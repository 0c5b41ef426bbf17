//! CSV ingestion of raw records and feature-table persistence.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use super::{FeatureConfig, FeatureSchema, FeatureTable, FeatureVector, RawRecord, RawValue};
use crate::error::{PipelineError, Result};

/// Header column holding row ids in feature-table CSVs.
pub const ROW_ID_COLUMN: &str = "row_id";

/// Raw records read from a headered CSV source.
#[derive(Debug, Clone)]
pub struct RawDataset {
    pub headers: Vec<String>,
    pub records: Vec<RawRecord>,
}

impl RawDataset {
    /// Check that every configured column exists in the header, unless the
    /// field's imputation policy covers its absence.
    pub fn check_headers(&self, config: &FeatureConfig) -> Result<()> {
        let has = |name: &str| self.headers.iter().any(|h| h == name);
        for field in &config.fields {
            if !has(&field.name) && !field.impute.covers_absence() {
                return Err(PipelineError::schema(
                    field.name.as_str(),
                    "configured field is not a column of the input file",
                ));
            }
        }
        if let Some(id) = &config.id_field {
            if !has(id) {
                return Err(PipelineError::schema(
                    id.as_str(),
                    "id_field is not a column of the input file",
                ));
            }
        }
        Ok(())
    }
}

pub fn read_raw_path(path: &Path, config: &FeatureConfig) -> Result<RawDataset> {
    let file = std::fs::File::open(path)
        .map_err(|e| PipelineError::artifact_io(path.display().to_string(), e))?;
    read_raw(file, config)
}

/// Read raw records. Empty cells become `Null`, everything else `Text`;
/// the extractor decides how to interpret them.
pub fn read_raw<R: Read>(reader: R, config: &FeatureConfig) -> Result<RawDataset> {
    let mut rdr = ::csv::Reader::from_reader(reader);
    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| PipelineError::schema("header", e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let id_idx = config
        .id_field
        .as_ref()
        .and_then(|id| headers.iter().position(|h| h == id));

    let mut records = Vec::new();
    for (line, row) in rdr.records().enumerate() {
        let row = row.map_err(|e| PipelineError::schema(format!("line {}", line + 2), e.to_string()))?;
        let mut record = RawRecord::new();
        for (header, cell) in headers.iter().zip(row.iter()) {
            let cell = cell.trim();
            let value = if cell.is_empty() {
                RawValue::Null
            } else {
                RawValue::Text(cell.to_string())
            };
            record.fields.insert(header.clone(), value);
        }
        record.id = match id_idx {
            Some(i) => row.get(i).map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            None => Some((line + 1).to_string()),
        };
        records.push(record);
    }

    let dataset = RawDataset { headers, records };
    dataset.check_headers(config)?;
    Ok(dataset)
}

/// Write a feature table as CSV: `row_id` followed by feature columns.
pub fn write_table<W: Write>(table: &FeatureTable, writer: W) -> Result<()> {
    let to_err = |e: ::csv::Error| PipelineError::artifact_io("features.csv", e);
    let mut wtr = ::csv::Writer::from_writer(writer);
    let mut header = vec![ROW_ID_COLUMN.to_string()];
    header.extend(table.schema().names().iter().cloned());
    wtr.write_record(&header).map_err(to_err)?;
    for row in table.rows() {
        let mut cells = vec![row.row_id().unwrap_or_default().to_string()];
        cells.extend(row.values().iter().map(|v| v.to_string()));
        wtr.write_record(&cells).map_err(to_err)?;
    }
    wtr.flush()
        .map_err(|e| PipelineError::artifact_io("features.csv", e))?;
    Ok(())
}

/// Read a feature-table CSV produced by [`write_table`].
pub fn read_table<R: Read>(reader: R) -> Result<FeatureTable> {
    let mut rdr = ::csv::Reader::from_reader(reader);
    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| PipelineError::schema("header", e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();
    let (has_id, names) = match headers.split_first() {
        Some((first, rest)) if first == ROW_ID_COLUMN => (true, rest.to_vec()),
        _ => (false, headers.clone()),
    };
    let schema = Arc::new(FeatureSchema::new(names)?);

    let mut rows = Vec::new();
    for (line, row) in rdr.records().enumerate() {
        let row = row.map_err(|e| PipelineError::schema(format!("line {}", line + 2), e.to_string()))?;
        let mut cells = row.iter();
        let row_id = if has_id {
            cells.next().filter(|s| !s.is_empty()).map(str::to_string)
        } else {
            None
        };
        let values = cells
            .zip(schema.names())
            .map(|(cell, name)| {
                cell.trim().parse::<f64>().map_err(|_| {
                    PipelineError::schema(
                        name.as_str(),
                        format!("line {}: `{}` is not numeric", line + 2, cell),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        rows.push(FeatureVector::new(schema.clone(), values)?.with_row_id(row_id));
    }
    FeatureTable::new(schema, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{extract, FieldSpec, Imputation};

    const RAW: &str = "request_id,latency_ms,method,bytes\n\
                       a1,12.5,GET,100\n\
                       a2,,POST,200\n";

    #[test]
    fn test_read_raw_cells() {
        let mut cfg = FeatureConfig::new(vec![FieldSpec::numeric("latency_ms")]);
        cfg.id_field = Some("request_id".to_string());
        let ds = read_raw(RAW.as_bytes(), &cfg).unwrap();
        assert_eq!(ds.headers, vec!["request_id", "latency_ms", "method", "bytes"]);
        assert_eq!(ds.records.len(), 2);
        assert_eq!(ds.records[1].id.as_deref(), Some("a2"));
        assert_eq!(ds.records[1].fields["latency_ms"], RawValue::Null);
        assert_eq!(ds.records[0].fields["method"], RawValue::Text("GET".into()));
    }

    #[test]
    fn test_header_mismatch_is_schema_error() {
        let cfg = FeatureConfig::new(vec![FieldSpec::numeric("status_code")]);
        assert!(matches!(
            read_raw(RAW.as_bytes(), &cfg),
            Err(PipelineError::Schema { .. })
        ));

        // Covered by an imputation policy: allowed.
        let covered = FeatureConfig::new(vec![
            FieldSpec::numeric("status_code").impute(Imputation::ZeroFill)
        ]);
        assert!(read_raw(RAW.as_bytes(), &covered).is_ok());
    }

    #[test]
    fn test_table_write_then_read() {
        let cfg = FeatureConfig::new(vec![
            FieldSpec::numeric("latency_ms").impute(Imputation::ZeroFill),
            FieldSpec::one_hot("method", &["GET", "POST"]),
        ]);
        let ds = read_raw(RAW.as_bytes(), &cfg).unwrap();
        let table = extract(&ds.records, &cfg).unwrap();

        let mut buf = Vec::new();
        write_table(&table, &mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("row_id,latency_ms,method=GET,method=POST"));

        let back = read_table(buf.as_slice()).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_table_rejects_non_finite_cells() {
        for body in ["row_id,x\nr,NaN\n", "row_id,x\ns,inf\n", "row_id,x\nt,-inf\n"] {
            assert!(
                matches!(read_table(body.as_bytes()), Err(PipelineError::Schema { .. })),
                "{}",
                body
            );
        }
    }
}
