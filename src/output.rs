use crate::models::{ChatMessage, EvaluationResult};
use crate::runner::RunOutcome;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Evaluation section of a report
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub key: String,
    pub cached: bool,
    pub result: EvaluationResult,
}

impl From<RunOutcome> for EvaluationReport {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            key: outcome.key,
            cached: outcome.cached,
            result: outcome.result,
        }
    }
}

/// Everything printed at the end of a run
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub agent: String,
    pub deployment: String,
    pub conversation: Vec<ChatMessage>,
    pub response: ChatMessage,
    pub response_metadata: BTreeMap<String, String>,
    pub evaluation: Option<EvaluationReport>,
}

/// Print the report in the specified format
pub fn print_report(report: &Report, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", render_plain(report)),
        OutputFormat::Json => print_json(report),
    }
}

/// Render the report as plain text
fn render_plain(report: &Report) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "=== {} ({}) ===", report.agent, report.deployment);
    let _ = writeln!(out, "{}", report.response.content);
    let _ = writeln!(out);

    if let Some(evaluation) = &report.evaluation {
        let marker = if evaluation.cached { " (cached)" } else { "" };
        let _ = writeln!(out, "📊 EVALUATION{}", marker);
        let _ = writeln!(out, "-------------");
        render_metrics_table(&mut out, &evaluation.result);
        let _ = writeln!(out);

        let _ = writeln!(out, "📝 DETAILED RESULTS");
        let _ = writeln!(out, "-------------------");
        render_metric_details(&mut out, &evaluation.result);
    }

    out
}

/// Render one row per metric
fn render_metrics_table(out: &mut String, result: &EvaluationResult) {
    if result.is_empty() {
        let _ = writeln!(out, "No metrics available.");
        return;
    }

    let _ = writeln!(out, "{:<15} {:<8} {:<14} {:<6}", "Metric", "Score", "Rating", "Failed");
    let _ = writeln!(out, "{}", "-".repeat(46));

    for (name, record) in &result.metrics {
        let score = match &record.value {
            Some(value) => value.to_string(),
            None => "n/a".to_string(),
        };
        let (rating, failed) = match &record.interpretation {
            Some(interpretation) => (
                interpretation.rating.to_string(),
                if interpretation.failed { "yes" } else { "no" },
            ),
            None => ("-".to_string(), "-"),
        };

        let _ = writeln!(out, "{:<15} {:<8} {:<14} {:<6}", name, score, rating, failed);
    }
}

/// Render reasons, diagnostics and metadata for each metric
fn render_metric_details(out: &mut String, result: &EvaluationResult) {
    for (name, record) in &result.metrics {
        let _ = writeln!(out, "• {}: {}", name, record.reason);
        for diagnostic in &record.diagnostics {
            let _ = writeln!(out, "    [{}] {}", diagnostic.severity, diagnostic.message);
        }
        for (key, value) in &record.metadata {
            let _ = writeln!(out, "    {} = {}", key, value);
        }
    }
}

/// Print the report in JSON format
fn print_json(report: &Report) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing report to JSON: {}", e),
    }
}
