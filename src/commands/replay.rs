use anyhow::{Context, Result};
use colored::Colorize;
use dbintel_pipeline::config;
use dbintel_pipeline::init_tracing;
use dbintel_pipeline::model::Batch;
use dbintel_pipeline::pipeline::Pipeline;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Default, PartialEq, Eq)]
struct ReplaySummary {
    batches: usize,
    skipped_lines: usize,
    received: usize,
    exported: usize,
    pii_redactions: u64,
    quality_failures: u64,
}

/// Execute the replay command
///
/// Reads one JSON batch per line, runs each through the pipeline and writes
/// the processed batches as JSON Lines.
pub fn execute(path: Option<&Path>, input: &Path, output: Option<&Path>) -> Result<()> {
    let cfg = config::load_config(path)?;
    init_tracing(&cfg.logging);

    let pipeline = Pipeline::new(&cfg)?;
    pipeline.sampler().restore();

    let reader = BufReader::new(
        File::open(input).with_context(|| format!("Failed to open {}", input.display()))?,
    );
    let writer: Box<dyn Write> = match output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };

    let summary = replay(&pipeline, reader, BufWriter::new(writer))?;

    if let Err(e) = pipeline.sampler().persist() {
        warn!(error = %e, "Failed to persist sampler snapshot after replay");
    }

    eprintln!("{}", "Replay complete".green().bold());
    eprintln!("  Batches: {} ({} lines skipped)", summary.batches, summary.skipped_lines);
    eprintln!("  Records: {} in, {} out", summary.received, summary.exported);
    eprintln!("  PII redactions: {}", summary.pii_redactions);
    eprintln!("  Quality failures: {}", summary.quality_failures);

    info!(
        batches = summary.batches,
        received = summary.received,
        exported = summary.exported,
        "Replay finished"
    );
    Ok(())
}

fn replay<R: BufRead, W: Write>(pipeline: &Pipeline, reader: R, mut writer: W) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let batch: Batch = match serde_json::from_str(&line) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed batch");
                summary.skipped_lines += 1;
                continue;
            }
        };

        let outcome = pipeline.process(batch);
        summary.batches += 1;
        summary.received += outcome.stats.received;
        summary.exported += outcome.stats.exported;
        summary.pii_redactions += outcome.report.pii_redactions;
        summary.quality_failures += outcome.report.quality_failures;

        serde_json::to_writer(&mut writer, &outcome.batch)?;
        writer.write_all(b"\n")?;
    }

    writer.flush()?;
    Ok(summary)
}
