use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use driftwatch::features::csv::{read_raw_path, read_table};
use driftwatch::pipeline::{serving_extractor, Pipeline, ScoreBatch, ScoringData, TrainingData};
use driftwatch::{LabeledFeatureTable, ModelVersion, PipelineConfig};

#[derive(Parser)]
#[command(
    name = "driftwatch",
    about = "Train, version and serve anomaly detection models over tabular records",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $DRIFTWATCH_CONFIG, then ./driftwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where input rows come from.
#[derive(Args)]
#[group(required = true, multiple = false)]
struct Source {
    /// Raw CSV file, encoded with the configured (or model's) extractor
    #[arg(long)]
    input: Option<PathBuf>,

    /// Dataset previously stored with `build-dataset`
    #[arg(long)]
    dataset: Option<String>,

    /// Feature-table CSV (`row_id` followed by feature columns)
    #[arg(long)]
    features: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a raw CSV into a stored feature table
    BuildDataset {
        /// Raw CSV file with a header row
        #[arg(long)]
        input: PathBuf,

        /// Dataset name
        #[arg(long)]
        name: String,
    },

    /// Train a model and publish it as the next version
    Train {
        #[command(flatten)]
        source: Source,
    },

    /// Score rows against a published model
    Score {
        #[command(flatten)]
        source: Source,

        /// Model version (default: latest)
        #[arg(long)]
        model: Option<ModelVersion>,

        /// Only print anomalous rows
        #[arg(long)]
        anomalies_only: bool,
    },

    /// Evaluate a published model and write its report
    Evaluate {
        #[command(flatten)]
        source: Source,

        /// Model version (default: latest)
        #[arg(long)]
        model: Option<ModelVersion>,
    },

    /// List published model versions
    Versions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PipelineConfig::resolve(cli.config.as_deref())?;
    driftwatch::init_tracing(&config.logging);
    let pipeline = Pipeline::open(config).context("failed to initialise pipeline")?;

    match cli.command {
        Commands::BuildDataset { input, name } => {
            tracing::info!(input = %input.display(), %name, "Building dataset");
            let summary = pipeline.build_dataset(&input, &name)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Dataset '{}': {} rows, {} features{}",
                    summary.name,
                    summary.rows,
                    summary.features.len(),
                    if summary.labeled { " (labeled)" } else { "" }
                );
                println!("Stored at {}", summary.features_key);
            }
        }
        Commands::Train { source } => {
            let data = training_data(&pipeline, &source)?;
            let version = train_interruptible(&pipeline, data).await?;
            let manifest = pipeline.registry().manifest(version)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                println!("Published model {}", version);
                println!("  kind:          {}", manifest.model_kind);
                println!("  training rows: {}", manifest.training_rows);
                println!("  features:      {}", manifest.features.join(", "));
                println!("  threshold:     {:.6} ({:?})", manifest.threshold, manifest.direction);
            }
        }
        Commands::Score {
            source,
            model,
            anomalies_only,
        } => {
            let batch = score(&pipeline, &source, model)?;
            print_batch(&batch, cli.json, anomalies_only)?;
        }
        Commands::Evaluate { source, model } => {
            let (version, data) = evaluation_data(&pipeline, &source, model)?;
            let evaluation = pipeline.evaluate(Some(version), &data)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&evaluation)?);
            } else {
                print_evaluation(&evaluation);
            }
        }
        Commands::Versions => {
            let manifests = pipeline.registry().manifests()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&manifests)?);
            } else if manifests.is_empty() {
                println!("No models published.");
            } else {
                println!(
                    "{:<9} | {:<16} | {:>8} | {:>14} | Trained",
                    "Version", "Kind", "Rows", "Threshold"
                );
                println!("{:-<9}-|-{:-<16}-|-{:-<8}-|-{:-<14}-|-{:-<25}", "", "", "", "", "");
                for m in manifests {
                    println!(
                        "{:<9} | {:<16} | {:>8} | {:>14.6} | {}",
                        m.version.to_string(),
                        m.model_kind,
                        m.training_rows,
                        m.threshold,
                        m.trained_at.to_rfc3339()
                    );
                }
            }
        }
    }

    Ok(())
}

/// Run training on a blocking thread; Ctrl-C cancels before publishing.
async fn train_interruptible(pipeline: &Pipeline, data: TrainingData) -> Result<ModelVersion> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling training");
            on_interrupt.cancel();
        }
    });

    let worker = pipeline.clone();
    let outcome = tokio::task::spawn_blocking(move || worker.train(data, &cancel))
        .await
        .context("training task failed")?;
    watcher.abort();
    Ok(outcome?)
}

fn open_csv(path: &Path) -> Result<std::fs::File> {
    std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))
}

fn training_data(pipeline: &Pipeline, source: &Source) -> Result<TrainingData> {
    if let Some(input) = &source.input {
        let raw = read_raw_path(input, &pipeline.config().features)?;
        return Ok(TrainingData::Raw(raw.records));
    }
    if let Some(name) = &source.dataset {
        return Ok(TrainingData::Features(pipeline.load_dataset(name)?.table));
    }
    if let Some(path) = &source.features {
        return Ok(TrainingData::Features(read_table(open_csv(path)?)?));
    }
    bail!("one of --input, --dataset or --features is required")
}

fn score(pipeline: &Pipeline, source: &Source, model: Option<ModelVersion>) -> Result<ScoreBatch> {
    let scorer = pipeline.scorer(model)?;
    let data = if let Some(input) = &source.input {
        let extractor = serving_extractor(scorer.artifact())?;
        ScoringData::Raw(read_raw_path(input, extractor)?.records)
    } else if let Some(name) = &source.dataset {
        ScoringData::Features(pipeline.load_dataset(name)?.table.into_rows())
    } else if let Some(path) = &source.features {
        ScoringData::Features(read_table(open_csv(path)?)?.into_rows())
    } else {
        bail!("one of --input, --dataset or --features is required")
    };
    Ok(pipeline.score_with(&scorer, data)?)
}

fn evaluation_data(
    pipeline: &Pipeline,
    source: &Source,
    model: Option<ModelVersion>,
) -> Result<(ModelVersion, LabeledFeatureTable)> {
    let version = match model {
        Some(v) => v,
        None => pipeline.registry().latest()?,
    };
    if let Some(input) = &source.input {
        let (artifact, _) = pipeline.registry().load(version)?;
        let raw = read_raw_path(input, serving_extractor(&artifact)?)?;
        return Ok(pipeline.extract_for(Some(version), &raw.records)?);
    }
    if let Some(name) = &source.dataset {
        return Ok((version, pipeline.load_dataset(name)?));
    }
    if let Some(path) = &source.features {
        let table = read_table(open_csv(path)?)?;
        return Ok((version, LabeledFeatureTable::unlabeled(table)));
    }
    bail!("one of --input, --dataset or --features is required")
}

fn print_batch(batch: &ScoreBatch, json: bool, anomalies_only: bool) -> Result<()> {
    let rows: Vec<_> = batch
        .results
        .iter()
        .filter(|r| !anomalies_only || r.is_anomalous())
        .collect();

    if json {
        let out = serde_json::json!({
            "model_version": batch.model_version,
            "results": rows,
            "drift": batch.drift,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Model {}", batch.model_version);
    println!(
        "{:<20} | {:>14} | {:<9} | {:<8} | Margin",
        "Row", "Score", "Verdict", "Severity"
    );
    println!("{:-<20}-|-{:-<14}-|-{:-<9}-|-{:-<8}-|-{:-<10}", "", "", "", "", "");
    for r in &rows {
        println!(
            "{:<20} | {:>14.6} | {:<9} | {:<8} | {:.4}",
            r.row_id.as_deref().unwrap_or("-"),
            r.score,
            format!("{:?}", r.verdict),
            r.severity.map(|s| format!("{:?}", s)).unwrap_or_default(),
            r.margin
        );
    }
    println!(
        "\n{} of {} rows anomalous",
        batch.anomalies().count(),
        batch.results.len()
    );
    if let Some(drift) = &batch.drift {
        for f in drift.flagged() {
            println!(
                "Drift: feature '{}' moved {:.2} training std devs",
                f.name, f.mean_shift
            );
        }
    }
    Ok(())
}

fn print_evaluation(evaluation: &driftwatch::pipeline::Evaluation) {
    let metrics = &evaluation.metrics;
    let diag = metrics.diagnostics();
    println!("\n=== Evaluation of model {} ===", metrics.model_version());
    println!("Rows:        {}", diag.count);
    println!(
        "Threshold:   {:.6} (percentile {:.1}, {} flagged, {:.2}%)",
        diag.threshold.threshold,
        diag.threshold.percentile,
        diag.threshold.flagged,
        100.0 * diag.threshold.flagged_fraction
    );
    match metrics.supervised() {
        Some(s) => {
            let c = &s.confusion;
            println!(
                "Confusion:   tp={} fp={} tn={} fn={}",
                c.true_positives, c.false_positives, c.true_negatives, c.false_negatives
            );
            println!("Precision:   {:.4}", s.precision);
            println!("Recall:      {:.4}", s.recall);
            println!("F1:          {:.4}", s.f1);
            match s.auc {
                Some(auc) => println!("ROC AUC:     {:.4}", auc),
                None => println!("ROC AUC:     n/a (single-class labels)"),
            }
            if let Some(ap) = s.average_precision {
                println!("Avg prec.:   {:.4}", ap);
            }
        }
        None => println!("Labels:      none (unsupervised diagnostics only)"),
    }
    println!("\nReport files:");
    for key in &evaluation.report.written {
        println!(" - {}", key);
    }
    for failure in &evaluation.report.failures {
        println!(" ! {} ({})", failure.key, failure.error);
    }
    println!();
}
