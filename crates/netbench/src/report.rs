//! Persistence boundary: snapshots and monitoring reports as pretty JSON.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::PersistError;
use crate::types::{MonitoringReport, RunSnapshot};

pub fn to_json<T: Serialize>(value: &T) -> Result<String, PersistError> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Write `value` to `path`, creating parent directories as needed.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| PersistError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let json = to_json(value)?;
    std::fs::write(path, json).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistError> {
    let content = std::fs::read_to_string(path).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// `<label>-<unix ms>.json`, with anything outside `[A-Za-z0-9_-]` replaced.
pub fn file_name(label: &str, timestamp_ms: u64) -> String {
    let safe: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}-{timestamp_ms}.json")
}

pub fn save_snapshot(dir: &Path, snapshot: &RunSnapshot) -> Result<PathBuf, PersistError> {
    let path = dir.join(file_name(&snapshot.label, snapshot.created_at_ms));
    write_json(&path, snapshot)?;
    Ok(path)
}

pub fn save_monitoring_report(
    dir: &Path,
    report: &MonitoringReport,
    timestamp_ms: u64,
) -> Result<PathBuf, PersistError> {
    let path = dir.join(file_name(&format!("monitor-{}", report.network), timestamp_ms));
    write_json(&path, report)?;
    Ok(path)
}

pub fn read_snapshot(path: &Path) -> Result<RunSnapshot, PersistError> {
    read_json(path)
}

pub fn read_monitoring_report(path: &Path) -> Result<MonitoringReport, PersistError> {
    read_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MetricsCollector;

    #[test]
    fn test_file_name_is_sanitized() {
        assert_eq!(file_name("l2 stress/test", 42), "l2_stress_test-42.json");
        assert_eq!(file_name("load-l1_a", 7), "load-l1_a-7.json");
    }

    #[test]
    fn test_snapshot_survives_disk() {
        let collector = MetricsCollector::new("load");
        collector.record_success("create", "l1", 21_000, 30, Some(1_000_000_000));
        collector.record_failure("read", "l2", 5, "timeout".to_string());
        let snapshot = collector
            .export_snapshot()
            .with_monitoring(vec![MonitoringReport::exhausted(
                "l1",
                3,
                3,
                "all sources failed".to_string(),
            )]);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = save_snapshot(&dir.path().join("nested"), &snapshot).expect("save");
        assert!(path.exists());

        let loaded = read_snapshot(&path).expect("read");
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_snapshot_without_monitoring_field_loads() {
        let collector = MetricsCollector::new("old");
        collector.record_success("read", "l1", 0, 1, None);
        let mut value = serde_json::to_value(collector.export_snapshot()).expect("to value");
        value
            .as_object_mut()
            .expect("object")
            .remove("monitoring");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("old.json");
        std::fs::write(&path, value.to_string()).expect("write");

        let loaded = read_snapshot(&path).expect("read");
        assert!(loaded.monitoring.is_empty());
        assert_eq!(loaded.summary.total_observations, 1);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_monitoring_report(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, PersistError::Io { .. }));
    }
}
