// Writes scored results to disk. Only called once scoring and reporting have
// both succeeded, so a failed run leaves no partial output behind.
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use csv::Writer;
use tracing::info;

use crate::config::DetectorKind;
use crate::csv_reader::{TransactionBatch, KNOWN_COLUMNS};
use crate::detectors::Detection;
use crate::error::{FraudError, Result};
use crate::pipeline::ScoredBatch;
use crate::report::EnsembleReport;

pub fn combined_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}_all_model_results.csv"))
}

pub fn detector_path(dir: &Path, prefix: &str, kind: DetectorKind) -> PathBuf {
    dir.join(format!("{prefix}_{}_anomalies.csv", kind.name()))
}

pub fn summary_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}_summary.json"))
}

/// Writes the combined table, one anomaly file per detector and the JSON
/// summary. Returns the paths written.
pub fn write_results(
    dir: &Path,
    prefix: &str,
    batch: &TransactionBatch,
    scored: &ScoredBatch,
    report: &EnsembleReport,
) -> Result<Vec<PathBuf>> {
    let n_rows = batch.len();
    for actual in [scored.n_rows(), report.total_records] {
        if actual != n_rows {
            return Err(FraudError::RowMismatch { expected: n_rows, actual });
        }
    }
    let mut subsets = Vec::with_capacity(scored.detections.len());
    for (kind, detection) in &scored.detections {
        detection.ensure_rows(n_rows)?;
        let rows = report.subset(*kind).ok_or_else(|| {
            FraudError::Detector(format!("report has no entry for {}", kind.name()))
        })?;
        if let Some(&row) = rows.iter().find(|&&row| row >= n_rows) {
            return Err(FraudError::RowMismatch {
                expected: n_rows,
                actual: row + 1,
            });
        }
        subsets.push((*kind, detection, rows));
    }

    fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    let path = combined_path(dir, prefix);
    write_combined(&path, batch, &scored.detections)?;
    written.push(path);

    for (kind, detection, rows) in subsets {
        let path = detector_path(dir, prefix, kind);
        write_flagged(&path, batch, kind, detection, rows)?;
        written.push(path);
    }

    let path = summary_path(dir, prefix);
    serde_json::to_writer_pretty(File::create(&path)?, report)?;
    written.push(path);

    info!(files = written.len(), dir = %dir.display(), "exported results");
    Ok(written)
}

fn write_combined(path: &Path, batch: &TransactionBatch, detections: &[(DetectorKind, Detection)]) -> Result<()> {
    let mut wtr = Writer::from_path(path)?;

    let mut header: Vec<&str> = KNOWN_COLUMNS.to_vec();
    header.extend(detections.iter().map(|(k, _)| k.name()));
    header.extend(detections.iter().filter_map(|(k, _)| k.score_column()));
    wtr.write_record(&header)?;

    for (i, tx) in batch.records.iter().enumerate() {
        let mut row = tx.to_row();
        row.extend(
            detections
                .iter()
                .map(|(_, d)| String::from(if d.flags[i] { "1" } else { "0" })),
        );
        for (kind, detection) in detections {
            if kind.score_column().is_some() {
                row.push(format_score(detection, i));
            }
        }
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_flagged(
    path: &Path,
    batch: &TransactionBatch,
    kind: DetectorKind,
    detection: &Detection,
    rows: &[usize],
) -> Result<()> {
    let mut wtr = Writer::from_path(path)?;

    let mut header: Vec<&str> = KNOWN_COLUMNS.to_vec();
    if let Some(score) = kind.score_column() {
        header.push(score);
    }
    wtr.write_record(&header)?;

    for &i in rows {
        let mut row = batch.records[i].to_row();
        if kind.score_column().is_some() {
            row.push(format_score(detection, i));
        }
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

fn format_score(detection: &Detection, row: usize) -> String {
    detection
        .scores
        .as_ref()
        .and_then(|s| s.get(row))
        .map(|s| s.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csv_reader::{Schema, Transaction};
    use crate::features::FeatureEngine;
    use chrono::NaiveDate;
    use ndarray::Array2;

    fn fixture() -> (TransactionBatch, ScoredBatch) {
        let records: Vec<Transaction> = (0..4)
            .map(|i| {
                Transaction {
                    id: format!("t{i}"),
                    card_number: Some(format!("card{}", i % 2)),
                    ..Transaction::default()
                }
            })
            .collect();
        let batch = TransactionBatch::from_records(records, Schema::new(["id", "card_number"])).unwrap();
        let features = FeatureEngine::new(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap())
            .compute(&batch)
            .unwrap();
        let scored = ScoredBatch {
            layout: features.layout(),
            matrix: Array2::zeros((4, features.layout().len())),
            features,
            detections: vec![
                (
                    DetectorKind::DensityCluster,
                    Detection {
                        flags: vec![false, true, false, false],
                        scores: None,
                    },
                ),
                (
                    DetectorKind::IsolationForest,
                    Detection {
                        flags: vec![false, true, true, false],
                        scores: Some(vec![0.4, 0.9, 0.8, 0.3]),
                    },
                ),
            ],
        };
        (batch, scored)
    }

    #[test]
    fn writes_combined_and_per_detector_files() {
        let dir = tempfile::tempdir().unwrap();
        let (batch, scored) = fixture();
        let report = EnsembleReport::build(&batch, &scored).unwrap();

        let written = write_results(dir.path(), "run", &batch, &scored, &report).unwrap();
        assert_eq!(written.len(), 4);
        assert!(written.iter().all(|p| p.exists()));

        let mut rdr = csv::Reader::from_path(combined_path(dir.path(), "run")).unwrap();
        let header: Vec<String> = rdr.headers().unwrap().iter().map(str::to_string).collect();
        assert_eq!(&header[..2], &["id", "card_id"]);
        assert_eq!(
            &header[KNOWN_COLUMNS.len()..],
            &["dbscan", "isolation_forest", "isolation_forest_score"]
        );
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 4);
        assert_eq!(&rows[1][KNOWN_COLUMNS.len()], "1");
        assert_eq!(&rows[2][KNOWN_COLUMNS.len()], "0");
        assert_eq!(&rows[2][KNOWN_COLUMNS.len() + 2], "0.8");

        let mut rdr =
            csv::Reader::from_path(detector_path(dir.path(), "run", DetectorKind::IsolationForest)).unwrap();
        let ids: Vec<String> = rdr.records().map(|r| r.unwrap()[0].to_string()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[test]
    fn summary_is_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let (batch, scored) = fixture();
        let report = EnsembleReport::build(&batch, &scored).unwrap();
        write_results(dir.path(), "run", &batch, &scored, &report).unwrap();

        let text = fs::read_to_string(summary_path(dir.path(), "run")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["total_records"], 4);
        assert_eq!(value["overlaps"][0]["both"], 1);
        assert_eq!(value["detectors"][0]["summary"]["detector"], "dbscan");
    }

    #[test]
    fn misaligned_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let (batch, scored) = fixture();
        let report = EnsembleReport::build(&batch, &scored).unwrap();
        let shorter = TransactionBatch::from_records(batch.records[..2].to_vec(), batch.schema.clone()).unwrap();

        assert!(write_results(&out, "run", &shorter, &scored, &report).is_err());
        assert!(!out.exists());
    }

    #[test]
    fn misaligned_detection_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let (batch, mut scored) = fixture();
        let report = EnsembleReport::build(&batch, &scored).unwrap();
        scored.detections[1].1.scores = Some(vec![0.9]);

        let err = write_results(&out, "run", &batch, &scored, &report).unwrap_err();
        assert!(matches!(err, FraudError::RowMismatch { expected: 4, actual: 1 }));
        assert!(!out.exists());
    }

    #[test]
    fn detector_missing_from_report_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let (batch, scored) = fixture();
        let mut report = EnsembleReport::build(&batch, &scored).unwrap();
        report.detectors.pop();

        let err = write_results(&out, "run", &batch, &scored, &report).unwrap_err();
        assert!(matches!(&err, FraudError::Detector(msg) if msg.contains("isolation_forest")));
        assert!(!out.exists());
    }

    #[test]
    fn anomaly_file_follows_report_subset() {
        let dir = tempfile::tempdir().unwrap();
        let (batch, scored) = fixture();
        let report = EnsembleReport::build(&batch, &scored).unwrap();
        assert_eq!(report.subset(DetectorKind::DensityCluster), Some(&[1][..]));
        write_results(dir.path(), "run", &batch, &scored, &report).unwrap();

        let mut rdr =
            csv::Reader::from_path(detector_path(dir.path(), "run", DetectorKind::DensityCluster)).unwrap();
        let ids: Vec<String> = rdr.records().map(|r| r.unwrap()[0].to_string()).collect();
        assert_eq!(ids, vec!["t1"]);
    }
}
