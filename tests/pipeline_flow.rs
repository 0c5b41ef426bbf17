//! End-to-end flows through the public pipeline surface, on real on-disk
//! stores.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use driftwatch::evaluate::Metrics;
use driftwatch::features::{FeatureConfig, FieldSpec, Imputation};
use driftwatch::storage::{StoreBackend, StoreConfig};
use driftwatch::{
    ModelVersion, Pipeline, PipelineConfig, PipelineError, RawRecord, ScoringData, TrainingData,
};

fn config(dir: &TempDir, backend: StoreBackend, fields: Vec<FieldSpec>) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.features = FeatureConfig::new(fields);
    cfg.store = StoreConfig {
        backend,
        path: Some(match backend {
            StoreBackend::Sqlite => dir.path().join("artifacts.db"),
            _ => dir.path().join("store"),
        }),
    };
    cfg
}

/// Standard normal draw via Box-Muller.
fn normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// 95 draws from N(0, 1) followed by 5 from N(10, 1).
fn contaminated_sample() -> Vec<RawRecord> {
    let mut rng = StdRng::seed_from_u64(2024);
    (0..100)
        .map(|i| {
            let centre = if i < 95 { 0.0 } else { 10.0 };
            RawRecord::new()
                .with_id(format!("row{}", i))
                .with("value", centre + normal(&mut rng))
        })
        .collect()
}

fn train(pipeline: &Pipeline, data: TrainingData) -> ModelVersion {
    pipeline.train(data, &CancellationToken::new()).unwrap()
}

fn detects_injected_outliers(backend: StoreBackend) {
    let dir = TempDir::new().unwrap();
    let pipeline =
        Pipeline::open(config(&dir, backend, vec![FieldSpec::numeric("value")])).unwrap();

    let records = contaminated_sample();
    let version = train(&pipeline, TrainingData::Raw(records.clone()));
    let batch = pipeline
        .score(ScoringData::Raw(records), Some(version))
        .unwrap();

    let flagged: Vec<&str> = batch
        .anomalies()
        .map(|r| r.row_id.as_deref().unwrap())
        .collect();
    let outliers = (95..100).map(|i| format!("row{}", i)).collect::<Vec<_>>();
    let caught = flagged.iter().filter(|id| outliers.iter().any(|o| o == *id)).count();
    let false_positives = flagged.len() - caught;

    assert!((3..=7).contains(&flagged.len()), "flagged {:?}", flagged);
    assert!(caught >= 3, "caught only {} outliers", caught);
    assert!(false_positives <= 10);
    assert_eq!(batch.model_version, version);
}

#[test]
fn test_outliers_detected_fs_store() {
    detects_injected_outliers(StoreBackend::Fs);
}

#[test]
fn test_outliers_detected_sqlite_store() {
    detects_injected_outliers(StoreBackend::Sqlite);
}

#[test]
fn test_zero_fill_covers_missing_field() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::open(config(
        &dir,
        StoreBackend::Fs,
        vec![
            FieldSpec::numeric("cpu"),
            FieldSpec::numeric("retries").impute(Imputation::ZeroFill),
        ],
    ))
    .unwrap();

    let records: Vec<RawRecord> = (0..30)
        .map(|i| {
            RawRecord::new()
                .with("cpu", 40.0 + (i % 5) as f64)
                .with("retries", (i % 3) as f64)
        })
        .collect();
    train(&pipeline, TrainingData::Raw(records));

    let batch = pipeline
        .score(
            ScoringData::Raw(vec![RawRecord::new().with_id("partial").with("cpu", 42.0)]),
            None,
        )
        .unwrap();
    assert_eq!(batch.results.len(), 1);
    assert_eq!(batch.results[0].row_id.as_deref(), Some("partial"));

    let err = pipeline
        .score(
            ScoringData::Raw(vec![RawRecord::new().with("retries", 1.0)]),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, PipelineError::Schema { .. }), "{}", err);
}

#[test]
fn test_empty_batch_scores_to_empty_result() {
    let dir = TempDir::new().unwrap();
    let pipeline =
        Pipeline::open(config(&dir, StoreBackend::Fs, vec![FieldSpec::numeric("value")])).unwrap();
    let version = train(&pipeline, TrainingData::Raw(contaminated_sample()));

    let batch = pipeline.score(ScoringData::Raw(vec![]), None).unwrap();
    assert!(batch.results.is_empty());
    assert_eq!(batch.model_version, version);
    assert!(batch.drift.is_none());
}

#[test]
fn test_large_batches_carry_drift_report() {
    let dir = TempDir::new().unwrap();
    let pipeline =
        Pipeline::open(config(&dir, StoreBackend::Fs, vec![FieldSpec::numeric("value")])).unwrap();
    let version = train(&pipeline, TrainingData::Raw(contaminated_sample()));

    let steady = pipeline
        .score(ScoringData::Raw(contaminated_sample()), None)
        .unwrap();
    let report = steady.drift.expect("batch of 100 is assessed");
    assert_eq!(report.model_version, version);
    assert_eq!(report.batch_size, 100);
    assert!(!report.has_drift());

    let shifted: Vec<RawRecord> = (0..40)
        .map(|i| RawRecord::new().with("value", 50.0 + (i % 5) as f64))
        .collect();
    let batch = pipeline.score(ScoringData::Raw(shifted), None).unwrap();
    let report = batch.drift.unwrap();
    assert!(report.has_drift());
    let flagged: Vec<&str> = report.flagged().map(|f| f.name.as_str()).collect();
    assert_eq!(flagged, vec!["value"]);
    assert_eq!(batch.results.len(), 40);
}

#[test]
fn test_versions_are_monotonic_and_latest_is_default() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, StoreBackend::Sqlite, vec![FieldSpec::numeric("value")]);
    let pipeline = Pipeline::open(cfg.clone()).unwrap();

    let first = train(&pipeline, TrainingData::Raw(contaminated_sample()));
    let second = train(&pipeline, TrainingData::Raw(contaminated_sample()));
    assert_eq!(first, ModelVersion(1));
    assert_eq!(second, ModelVersion(2));

    // A fresh handle on the same store continues the sequence.
    let reopened = Pipeline::open(cfg).unwrap();
    let third = train(&reopened, TrainingData::Raw(contaminated_sample()));
    assert_eq!(third, ModelVersion(3));
    assert_eq!(
        reopened.versions().unwrap(),
        vec![ModelVersion(1), ModelVersion(2), ModelVersion(3)]
    );

    let record = vec![RawRecord::new().with("value", 0.5)];
    let latest = reopened.score(ScoringData::Raw(record.clone()), None).unwrap();
    assert_eq!(latest.model_version, third);
    let pinned = reopened
        .score(ScoringData::Raw(record), Some(first))
        .unwrap();
    assert_eq!(pinned.model_version, first);

    assert!(matches!(
        reopened.scorer(Some(ModelVersion(9))),
        Err(PipelineError::VersionNotFound(ModelVersion(9)))
    ));
}

#[test]
fn test_published_artifacts_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, StoreBackend::Fs, vec![FieldSpec::numeric("value")]);
    let pipeline = Pipeline::open(cfg.clone()).unwrap();
    let version = train(&pipeline, TrainingData::Raw(contaminated_sample()));
    let before = pipeline.scorer(Some(version)).unwrap();

    let reopened = Pipeline::open(cfg).unwrap();
    let after = reopened.scorer(Some(version)).unwrap();
    assert_eq!(before.artifact().as_ref(), after.artifact().as_ref());
    assert_eq!(before.calibration().as_ref(), after.calibration().as_ref());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_scoring_matches_sequential() {
    let dir = TempDir::new().unwrap();
    let pipeline =
        Pipeline::open(config(&dir, StoreBackend::Fs, vec![FieldSpec::numeric("value")])).unwrap();
    train(&pipeline, TrainingData::Raw(contaminated_sample()));

    let scorer = Arc::new(pipeline.scorer(None).unwrap());
    let extractor = driftwatch::pipeline::serving_extractor(scorer.artifact())
        .unwrap()
        .clone();
    let vectors = Arc::new(
        driftwatch::features::extract(&contaminated_sample(), &extractor)
            .unwrap()
            .into_rows(),
    );
    let expected = scorer.score(&vectors).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let scorer = scorer.clone();
        let vectors = vectors.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            scorer.score(&vectors).unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), expected);
    }
}

#[test]
fn test_build_dataset_then_evaluate_writes_report() {
    let dir = TempDir::new().unwrap();
    let csv_path = dir.path().join("requests.csv");
    let mut csv = String::from("request_id,latency,label\n");
    for i in 0..60 {
        csv.push_str(&format!("req{},{},0\n", i, 10 + i % 7));
    }
    for (i, latency) in [100, 110, 120, 130].iter().enumerate() {
        csv.push_str(&format!("bad{},{},1\n", i, latency));
    }
    std::fs::write(&csv_path, csv).unwrap();

    let mut cfg = config(&dir, StoreBackend::Fs, vec![FieldSpec::numeric("latency")]);
    cfg.features.id_field = Some("request_id".to_string());
    cfg.features.label_field = Some("label".to_string());
    let pipeline = Pipeline::open(cfg).unwrap();

    let summary = pipeline.build_dataset(&csv_path, "requests").unwrap();
    assert_eq!(summary.rows, 64);
    assert!(summary.labeled);
    assert_eq!(summary.features, vec!["latency".to_string()]);

    let dataset = pipeline.load_dataset("requests").unwrap();
    assert_eq!(dataset.table.len(), 64);
    assert_eq!(dataset.labels().map(|l| l.iter().filter(|b| **b).count()), Some(4));
    assert_eq!(dataset.table.rows()[0].row_id(), Some("req0"));

    let version = train(&pipeline, TrainingData::Features(dataset.table.clone()));
    let evaluation = pipeline.evaluate(Some(version), &dataset).unwrap();

    match &evaluation.metrics {
        Metrics::Supervised { supervised, .. } => {
            let auc = supervised.auc.unwrap();
            assert!((auc - 1.0).abs() < 1e-12, "auc {}", auc);
            assert!(supervised.recall > 0.0);
        }
        other => panic!("expected supervised metrics, got {:?}", other),
    }
    assert!(evaluation.report.is_complete());

    let report_dir = dir.path().join("store/reports/v000001");
    for file in [
        "metrics.json",
        "score_histogram.svg",
        "roc.svg",
        "precision_recall.svg",
    ] {
        assert!(report_dir.join(file).is_file(), "missing {}", file);
    }
}

#[test]
fn test_bad_dataset_name_rejected() {
    let dir = TempDir::new().unwrap();
    let pipeline =
        Pipeline::open(config(&dir, StoreBackend::Fs, vec![FieldSpec::numeric("value")])).unwrap();
    let csv_path = dir.path().join("x.csv");
    std::fs::write(&csv_path, "value\n1\n2\n").unwrap();

    assert!(pipeline.build_dataset(&csv_path, "../escape").is_err());
    assert!(pipeline.build_dataset(&csv_path, "a/b").is_err());
}
