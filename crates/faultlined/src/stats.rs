use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use faultline_analysis::{MetricsTracker, QualityReport};
use faultline_config::load_workspace_config;
use faultline_core::unix_timestamp_millis;
use faultline_store::SqliteStore;

use crate::cli::{StatsArgs, StatsOutputFormat};

pub fn run_stats_command(workspace: &Path, args: StatsArgs) -> Result<()> {
    let config = load_workspace_config(workspace).context("failed to load workspace config")?;
    let store =
        Arc::new(SqliteStore::open(workspace).context("failed to initialize local store")?);
    let window_secs = args.window_secs.unwrap_or(config.drift.window_secs).max(1);
    let tracker = MetricsTracker::new(store, config.drift);
    let now = unix_timestamp_millis();

    let reports = match args.namespace.as_deref() {
        Some(namespace) => vec![
            tracker
                .report(namespace.trim(), window_secs, now)
                .with_context(|| format!("stats for namespace {namespace} failed"))?,
        ],
        None => tracker
            .report_all(window_secs, now)
            .context("stats report failed")?,
    };

    let mut out = std::io::stdout();
    write_stats(&reports, args.output, &mut out)
}

pub fn write_stats(
    reports: &[QualityReport],
    format: StatsOutputFormat,
    out: &mut impl Write,
) -> Result<()> {
    match format {
        StatsOutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, reports)
                .context("failed to serialize stats output")?;
            writeln!(out).context("failed to write trailing newline")?;
        }
        StatsOutputFormat::Table => {
            writeln!(
                out,
                "namespace\tassignments\tnew_prototypes\tnew_cluster_rate\tlive_prototypes\tsilhouette\tcohesion\tseparation\tflags"
            )
            .context("write header")?;
            for report in reports {
                let mut flags = Vec::new();
                if report.high_drift {
                    flags.push("high_drift");
                }
                if report.low_quality {
                    flags.push("low_quality");
                }
                writeln!(
                    out,
                    "{}\t{}\t{}\t{:.3}\t{}\t{:.3}\t{:.3}\t{:.3}\t{}",
                    report.namespace,
                    report.assignments,
                    report.new_prototypes,
                    report.new_cluster_rate,
                    report.live_prototypes,
                    report.scores.silhouette,
                    report.scores.cohesion,
                    report.scores.separation,
                    if flags.is_empty() {
                        "-".to_owned()
                    } else {
                        flags.join(",")
                    }
                )
                .context("write row")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use faultline_analysis::QualityScores;

    use super::*;

    fn report() -> QualityReport {
        QualityReport {
            namespace: "linux|mock|mock-64d|64".to_owned(),
            window_secs: 3_600,
            generated_at: 1_000,
            assignments: 10,
            new_prototypes: 6,
            new_cluster_rate: 0.6,
            live_prototypes: 6,
            scores: QualityScores {
                cohesion: 0.1,
                separation: 0.7,
                silhouette: 0.45,
                clusters: 3,
                sampled: 10,
            },
            high_drift: true,
            low_quality: false,
        }
    }

    #[test]
    fn table_output_has_header_and_flags() {
        let mut out = Vec::new();
        write_stats(&[report()], StatsOutputFormat::Table, &mut out).expect("write table");
        let text = String::from_utf8(out).expect("utf8");
        let lines = text.lines().collect::<Vec<_>>();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("namespace\tassignments"));
        assert_eq!(
            lines[1],
            "linux|mock|mock-64d|64\t10\t6\t0.600\t6\t0.450\t0.100\t0.700\thigh_drift"
        );
    }

    #[test]
    fn json_output_flattens_scores() {
        let mut out = Vec::new();
        write_stats(&[report()], StatsOutputFormat::Json, &mut out).expect("write json");
        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");

        assert_eq!(value[0]["namespace"], "linux|mock|mock-64d|64");
        assert_eq!(value[0]["clusters"], 3);
        assert_eq!(value[0]["high_drift"], true);
    }
}
