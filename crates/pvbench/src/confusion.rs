use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use pvbench_contracts::{
    CONFUSION_MATRIX_REPORT_FILE_NAME, CONFUSION_MATRIX_SVG_FILE_NAME,
    PVBENCH_CONFUSION_SCHEMA_VERSION,
};
use serde::Serialize;
use tracing::warn;

use crate::results::{self, ResultSet, LABEL_BUGGY, LABEL_CORRECT};
use crate::util;

const CELL: u32 = 140;
const LEFT_MARGIN: u32 = 150;
const TOP_MARGIN: u32 = 70;
const BOTTOM_MARGIN: u32 = 70;
const RIGHT_MARGIN: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum ReportFormat {
    Json,
    Text,
}

/// Counts of true label (rows) against predicted label (columns).
///
/// The label ordering is the sorted set of true labels actually observed;
/// predictions outside that set are not counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    pub labels: Vec<u8>,
    pub counts: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn from_results(set: &ResultSet) -> Self {
        let labels: Vec<u8> = set
            .y_true
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut counts = vec![vec![0u64; labels.len()]; labels.len()];
        for (t, p) in set.pairs() {
            let (Some(row), Some(col)) = (index_of(&labels, t), index_of(&labels, p)) else {
                continue;
            };
            counts[row][col] += 1;
        }
        Self { labels, counts }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    pub fn max_count(&self) -> u64 {
        self.counts.iter().flatten().copied().max().unwrap_or(0)
    }

    pub fn accuracy(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let diagonal: u64 = (0..self.labels.len()).map(|i| self.counts[i][i]).sum();
        Some(diagonal as f64 / total as f64)
    }

    pub fn class_metrics(&self) -> Vec<ClassMetrics> {
        (0..self.labels.len())
            .map(|i| {
                let tp = self.counts[i][i];
                let support: u64 = self.counts[i].iter().sum();
                let predicted: u64 = self.counts.iter().map(|row| row[i]).sum();
                let precision = ratio(tp, predicted);
                let recall = ratio(tp, support);
                let f1 = match (precision, recall) {
                    (Some(p), Some(r)) if p + r > 0.0 => Some(2.0 * p * r / (p + r)),
                    (Some(_), Some(_)) => Some(0.0),
                    _ => None,
                };
                ClassMetrics {
                    label: self.labels[i],
                    display_label: display_label(self.labels[i]),
                    precision,
                    recall,
                    f1,
                    support,
                }
            })
            .collect()
    }

    pub fn display_labels(&self) -> Vec<&'static str> {
        self.labels.iter().map(|l| display_label(*l)).collect()
    }
}

fn index_of(labels: &[u8], label: u8) -> Option<usize> {
    labels.iter().position(|l| *l == label)
}

fn ratio(num: u64, den: u64) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}

/// Names are attached per observed label, so a single-class matrix is still labeled
/// with the class it actually contains.
pub fn display_label(label: u8) -> &'static str {
    match label {
        LABEL_BUGGY => "Buggy",
        LABEL_CORRECT => "Correct",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassMetrics {
    pub label: u8,
    pub display_label: &'static str,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    pub support: u64,
}

#[derive(Debug, Serialize)]
pub struct ConfusionReport {
    pub schema_version: &'static str,
    pub results_path: String,
    pub image_path: String,
    pub labels: Vec<u8>,
    pub display_labels: Vec<&'static str>,
    pub matrix: Vec<Vec<u64>>,
    pub samples: usize,
    pub accuracy: Option<f64>,
    pub classes: Vec<ClassMetrics>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Renders `confusion_matrix.svg` and `confusion_matrix.json` into `output_dir`.
pub fn render(results_path: &Path, output_dir: &Path) -> Result<ConfusionReport> {
    if !results_path.is_file() {
        return Err(anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Results file not found: {}", results_path.display()),
        ))
        .context("E_RESULTS_NOT_FOUND"));
    }

    let set = results::read_result_set(results_path)?;
    if set.is_empty() {
        bail!(
            "E_RESULTS_EMPTY: no results recorded in {}",
            results_path.display()
        );
    }

    let matrix = ConfusionMatrix::from_results(&set);
    let mut notes = Vec::new();
    if matrix.labels.len() < 2 {
        let note = format!(
            "only one true class observed ({}); matrix is {}x{}",
            matrix.display_labels().join(", "),
            matrix.labels.len(),
            matrix.labels.len()
        );
        warn!(results = %results_path.display(), "{note}");
        notes.push(note);
    }
    let dropped = set.len() as u64 - matrix.total();
    if dropped > 0 {
        notes.push(format!(
            "{dropped} prediction(s) outside the observed true labels were not counted"
        ));
    }

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("create output dir: {}", output_dir.display()))?;

    let image_path = output_dir.join(CONFUSION_MATRIX_SVG_FILE_NAME);
    util::write_atomic(&image_path, build_svg(&matrix).as_bytes())
        .with_context(|| format!("write confusion matrix: {}", image_path.display()))?;

    let report = ConfusionReport {
        schema_version: PVBENCH_CONFUSION_SCHEMA_VERSION,
        results_path: results_path.display().to_string(),
        image_path: image_path.display().to_string(),
        labels: matrix.labels.clone(),
        display_labels: matrix.display_labels(),
        matrix: matrix.counts.clone(),
        samples: set.len(),
        accuracy: matrix.accuracy(),
        classes: matrix.class_metrics(),
        notes,
    };

    let report_path = output_dir.join(CONFUSION_MATRIX_REPORT_FILE_NAME);
    util::write_atomic(&report_path, &util::pretty_json_bytes(&report)?)
        .with_context(|| format!("write report: {}", report_path.display()))?;

    Ok(report)
}

pub fn emit_report(format: ReportFormat, report: &ConfusionReport) -> Result<()> {
    match format {
        ReportFormat::Json => {
            let bytes = util::pretty_json_bytes(report)?;
            std::io::Write::write_all(&mut std::io::stdout(), &bytes).context("write stdout")?;
        }
        ReportFormat::Text => {
            println!("Confusion matrix saved to {}", report.image_path);
            let accuracy = report
                .accuracy
                .map_or_else(|| "n/a".to_string(), |a| format!("{a:.3}"));
            println!("samples={} accuracy={accuracy}", report.samples);
            for (name, row) in report.display_labels.iter().zip(&report.matrix) {
                let cells: Vec<String> = row.iter().map(u64::to_string).collect();
                println!("{name}\t{}", cells.join("\t"));
            }
            for note in &report.notes {
                println!("note: {note}");
            }
        }
    }
    Ok(())
}

/// Blues colormap endpoints, light to dark.
const LIGHT: (u8, u8, u8) = (0xf7, 0xfb, 0xff);
const DARK: (u8, u8, u8) = (0x08, 0x30, 0x6b);

fn cell_color(count: u64, max: u64) -> (String, &'static str) {
    let t = if max == 0 {
        0.0
    } else {
        count as f64 / max as f64
    };
    let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * t).round() as u8;
    let fill = format!(
        "#{:02x}{:02x}{:02x}",
        mix(LIGHT.0, DARK.0),
        mix(LIGHT.1, DARK.1),
        mix(LIGHT.2, DARK.2)
    );
    let text = if t > 0.5 { "#ffffff" } else { "#000000" };
    (fill, text)
}

pub fn build_svg(matrix: &ConfusionMatrix) -> String {
    let n = matrix.labels.len() as u32;
    let width = LEFT_MARGIN + CELL * n + RIGHT_MARGIN;
    let height = TOP_MARGIN + CELL * n + BOTTOM_MARGIN;
    let max = matrix.max_count();
    let display = matrix.display_labels();

    let mut svg = String::new();
    svg.push_str(&format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{width}\" height=\"{height}\" viewBox=\"0 0 {width} {height}\">"
    ));
    svg.push_str(&format!(
        "<rect x=\"0\" y=\"0\" width=\"{width}\" height=\"{height}\" fill=\"#ffffff\"/>"
    ));
    svg.push_str(&format!(
        "<text x=\"{}\" y=\"32\" text-anchor=\"middle\" font-family=\"sans-serif\" font-size=\"18\">Confusion Matrix</text>",
        LEFT_MARGIN + CELL * n / 2
    ));

    for (row, counts) in matrix.counts.iter().enumerate() {
        for (col, count) in counts.iter().enumerate() {
            let x = LEFT_MARGIN + CELL * col as u32;
            let y = TOP_MARGIN + CELL * row as u32;
            let (fill, text) = cell_color(*count, max);
            svg.push_str(&format!(
                "<rect x=\"{x}\" y=\"{y}\" width=\"{CELL}\" height=\"{CELL}\" fill=\"{fill}\" stroke=\"#ffffff\"/>"
            ));
            svg.push_str(&format!(
                "<text x=\"{}\" y=\"{}\" text-anchor=\"middle\" dominant-baseline=\"central\" font-family=\"sans-serif\" font-size=\"22\" fill=\"{text}\">{count}</text>",
                x + CELL / 2,
                y + CELL / 2
            ));
        }
    }

    for (i, name) in display.iter().enumerate() {
        let center = CELL * i as u32 + CELL / 2;
        svg.push_str(&format!(
            "<text x=\"{}\" y=\"{}\" text-anchor=\"end\" dominant-baseline=\"central\" font-family=\"sans-serif\" font-size=\"13\">{}</text>",
            LEFT_MARGIN - 10,
            TOP_MARGIN + center,
            xml_escape(name)
        ));
        svg.push_str(&format!(
            "<text x=\"{}\" y=\"{}\" text-anchor=\"middle\" font-family=\"sans-serif\" font-size=\"13\">{}</text>",
            LEFT_MARGIN + center,
            TOP_MARGIN + CELL * n + 22,
            xml_escape(name)
        ));
    }

    svg.push_str(&format!(
        "<text x=\"{}\" y=\"{}\" text-anchor=\"middle\" font-family=\"sans-serif\" font-size=\"14\">Predicted label</text>",
        LEFT_MARGIN + CELL * n / 2,
        TOP_MARGIN + CELL * n + 52
    ));
    let y_axis_y = TOP_MARGIN + CELL * n / 2;
    svg.push_str(&format!(
        "<text x=\"30\" y=\"{y_axis_y}\" text-anchor=\"middle\" font-family=\"sans-serif\" font-size=\"14\" transform=\"rotate(-90 30 {y_axis_y})\">True label</text>"
    ));

    svg.push_str("</svg>");
    svg
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(y_true: &[u8], y_pred: &[u8]) -> ResultSet {
        ResultSet {
            y_true: y_true.to_vec(),
            y_pred: y_pred.to_vec(),
        }
    }

    #[test]
    fn one_of_each_outcome() {
        let m = ConfusionMatrix::from_results(&set(&[1, 0, 1, 0], &[1, 1, 0, 0]));
        assert_eq!(m.labels, vec![0, 1]);
        assert_eq!(m.counts, vec![vec![1, 1], vec![1, 1]]);
        assert_eq!(m.accuracy(), Some(0.5));
        assert_eq!(m.display_labels(), vec!["Buggy", "Correct"]);
    }

    #[test]
    fn per_class_metrics() {
        // true:  1 1 1 0 0 0
        // pred:  1 1 0 0 0 1
        let m = ConfusionMatrix::from_results(&set(&[1, 1, 1, 0, 0, 0], &[1, 1, 0, 0, 0, 1]));
        assert_eq!(m.counts, vec![vec![2, 1], vec![1, 2]]);
        let classes = m.class_metrics();
        let correct = classes.iter().find(|c| c.label == 1).expect("correct class");
        assert_eq!(correct.support, 3);
        assert_eq!(correct.precision, Some(2.0 / 3.0));
        assert_eq!(correct.recall, Some(2.0 / 3.0));
        assert!((correct.f1.expect("f1") - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn single_class_is_labeled_by_observed_class() {
        let m = ConfusionMatrix::from_results(&set(&[1, 1, 1], &[1, 0, 1]));
        assert_eq!(m.labels, vec![1]);
        assert_eq!(m.counts, vec![vec![2]]);
        assert_eq!(m.display_labels(), vec!["Correct"]);
        assert_eq!(m.total(), 2);
    }

    #[test]
    fn svg_contains_counts_and_labels() {
        let m = ConfusionMatrix::from_results(&set(&[1, 0, 1, 0, 0], &[1, 1, 0, 0, 0]));
        let svg = build_svg(&m);
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains(">Buggy</text>"));
        assert!(svg.contains(">Correct</text>"));
        assert!(svg.contains(">Confusion Matrix</text>"));
        assert!(svg.contains(">2</text>"));
        assert_eq!(svg.matches("<rect").count(), 1 + 4);
    }

    #[test]
    fn cell_color_scales_from_light_to_dark() {
        assert_eq!(cell_color(0, 4), ("#f7fbff".to_string(), "#000000"));
        assert_eq!(cell_color(4, 4), ("#08306b".to_string(), "#ffffff"));
        assert_eq!(cell_color(0, 0).0, "#f7fbff");
    }

    #[test]
    fn render_writes_image_and_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let results = dir.path().join("results.json");
        std::fs::write(&results, br#"{"y_true":[1,0,1,0],"y_pred":[1,1,0,0]}"#).expect("write");
        let out = dir.path().join("plots");

        let report = render(&results, &out).expect("render");
        assert_eq!(report.matrix, vec![vec![1, 1], vec![1, 1]]);
        assert_eq!(report.samples, 4);
        assert!(out.join(CONFUSION_MATRIX_SVG_FILE_NAME).is_file());

        let on_disk: serde_json::Value = serde_json::from_slice(
            &std::fs::read(out.join(CONFUSION_MATRIX_REPORT_FILE_NAME)).expect("read report"),
        )
        .expect("report json");
        assert_eq!(on_disk["schema_version"], PVBENCH_CONFUSION_SCHEMA_VERSION);
        assert_eq!(on_disk["display_labels"], serde_json::json!(["Buggy", "Correct"]));
    }

    #[test]
    fn render_missing_results_is_not_found_and_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("plots");
        let err = render(&dir.path().join("absent.json"), &out).expect_err("missing");
        let io = err.downcast_ref::<std::io::Error>().expect("io error");
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
        assert!(!out.exists());
    }

    #[test]
    fn render_rejects_empty_and_corrupt_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        let results = dir.path().join("results.json");

        std::fs::write(&results, br#"{"y_true":[],"y_pred":[]}"#).expect("write");
        let err = render(&results, dir.path()).expect_err("empty");
        assert!(err.to_string().contains("E_RESULTS_EMPTY"));

        std::fs::write(&results, br#"{"y_true":[1],"y_pred":[]}"#).expect("write");
        assert!(render(&results, dir.path()).is_err());
    }
}
