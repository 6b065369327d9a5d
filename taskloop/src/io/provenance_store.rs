//! Durable provenance records: one JSON file per task under the audit directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::core::provenance::ProvenanceRecord;
use crate::core::state::validate_task_id;

pub fn provenance_path(audit_dir: &Path, task_id: &str) -> PathBuf {
    audit_dir.join(format!("{task_id}.json"))
}

/// Persist `record` as `<audit_dir>/<task_id>.json`.
///
/// Write-once: fails if a record for the task already exists. The file
/// appears atomically (uniquely named temp file + hard link), so concurrent
/// writers for one task id never share a temp path and exactly one wins.
pub fn write_provenance(audit_dir: &Path, record: &ProvenanceRecord) -> Result<PathBuf> {
    validate_task_id(record.task_id())?;
    fs::create_dir_all(audit_dir)
        .with_context(|| format!("create audit dir {}", audit_dir.display()))?;
    let path = provenance_path(audit_dir, record.task_id());
    if path.exists() {
        bail!("provenance record already exists {}", path.display());
    }

    let mut buf = serde_json::to_string_pretty(record).context("serialize provenance")?;
    buf.push('\n');
    let mut tmp = NamedTempFile::new_in(audit_dir)
        .with_context(|| format!("create temp provenance in {}", audit_dir.display()))?;
    tmp.write_all(buf.as_bytes())
        .and_then(|()| tmp.as_file().sync_all())
        .with_context(|| format!("write temp provenance {}", tmp.path().display()))?;
    fs::hard_link(tmp.path(), &path)
        .with_context(|| format!("publish provenance {}", path.display()))?;

    info!(task_id = %record.task_id(), path = %path.display(), "provenance written");
    Ok(path)
}

pub fn load_provenance(audit_dir: &Path, task_id: &str) -> Result<ProvenanceRecord> {
    validate_task_id(task_id)?;
    let path = provenance_path(audit_dir, task_id);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let record =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    debug!(task_id, "provenance loaded");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provenance::build_provenance;
    use crate::core::state::{RuntimeConfig, TaskState};
    use crate::core::types::{FinalStatus, TerminationReason};
    use crate::test_support::finish_record;

    fn record() -> ProvenanceRecord {
        let mut state =
            TaskState::new("task-store", "check disk", RuntimeConfig::default()).expect("state");
        state
            .push_step(finish_record(FinalStatus::Success, "ok"))
            .expect("push");
        state
            .terminate(TerminationReason::Finished {
                status: FinalStatus::Success,
                reason: "ok".to_string(),
            })
            .expect("terminate");
        build_provenance(&state, chrono::Utc::now())
    }

    #[test]
    fn write_then_load_returns_same_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let record = record();
        let path = write_provenance(temp.path(), &record).expect("write");
        assert!(path.ends_with("task-store.json"));
        let loaded = load_provenance(temp.path(), "task-store").expect("load");
        assert_eq!(loaded, record);
    }

    #[test]
    fn second_write_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let record = record();
        write_provenance(temp.path(), &record).expect("first");
        assert!(write_provenance(temp.path(), &record).is_err());
        let entries: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["task-store.json".to_string()]);
    }

    #[test]
    fn concurrent_writers_publish_exactly_one_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        let records: Vec<ProvenanceRecord> = (0..8).map(|_| record()).collect();
        let results: Vec<Result<PathBuf>> = std::thread::scope(|scope| {
            let handles: Vec<_> = records
                .iter()
                .map(|record| scope.spawn(move || write_provenance(dir, record)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("writer thread"))
                .collect()
        });

        let winners: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, result)| result.is_ok())
            .map(|(index, _)| index)
            .collect();
        assert_eq!(winners.len(), 1, "{results:?}");
        let loaded = load_provenance(dir, "task-store").expect("load");
        assert_eq!(loaded, records[winners[0]]);

        let entries: Vec<_> = fs::read_dir(dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["task-store.json".to_string()]);
    }

    #[test]
    fn load_rejects_path_like_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_provenance(temp.path(), "../secret").is_err());
    }
}
