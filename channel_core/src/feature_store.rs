/// feature_store.rs — append-with-upsert journal of per-trade feature
/// snapshots, keyed by a stable transaction id.
///
/// One JSON array on disk per journal file. Every write goes through a
/// temp-file-then-rename so a crash mid-write never leaves a truncated
/// journal behind.
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::error::Result;

/// One journaled record: a trade's denormalized identity plus whatever
/// feature values were computed for it at write time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub transaction_id: String,
    pub symbol: String,
    pub entry_dt: NaiveDate,
    pub exit_dt: NaiveDate,
    pub ret: f64,
    pub exit_reason: String,
    pub feature_snapshot: Value,
    pub feature_snapshot_original: Value,
    pub params_snapshot: Option<Value>,
    pub updated_at: String,
}

/// Strips an exchange suffix (`.SH`, `.SZ`, `.HK`, ...) for equality
/// comparisons — the same underlying security can be journaled under
/// either form across data vendors.
fn normalize_symbol(symbol: &str) -> &str {
    symbol.split('.').next().unwrap_or(symbol)
}

/// Deterministic transaction id over the fields that define a unique
/// trade occurrence: symbol, entry/exit dates, and exit reason. Two
/// re-analyses of the same trade with different feature values produce
/// the same id and therefore upsert rather than duplicate.
pub fn transaction_id(symbol: &str, entry_dt: NaiveDate, exit_dt: NaiveDate, exit_reason: &str) -> String {
    let canonical = format!("{}|{}|{}|{}", normalize_symbol(symbol), entry_dt, exit_dt, exit_reason);
    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct FeatureStore {
    path: PathBuf,
}

impl FeatureStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FeatureStore { path: path.into() }
    }

    fn read_all(&self) -> Result<Vec<FeatureRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_all(&self, records: &[FeatureRecord]) -> Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(
            ".{}.tmp",
            self.path.file_name().and_then(|n| n.to_str()).unwrap_or("feature_store")
        ));
        fs::write(&tmp, serde_json::to_string_pretty(records)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Merge `record` into the journal by `transaction_id`. Preserves
    /// the first-ever `feature_snapshot_original` if one is already on
    /// disk; only `feature_snapshot`, `updated_at`, `params_snapshot`,
    /// and the denormalized trade keys are refreshed on a re-analysis.
    pub fn upsert(&self, mut record: FeatureRecord) -> Result<()> {
        let mut records = self.read_all()?;
        match records.iter_mut().find(|r| r.transaction_id == record.transaction_id) {
            Some(existing) => {
                record.feature_snapshot_original = existing.feature_snapshot_original.clone();
                *existing = record;
            }
            None => {
                record.feature_snapshot_original = record.feature_snapshot.clone();
                records.push(record);
            }
        }
        self.write_all(&records)
    }

    pub fn get(&self, transaction_id: &str) -> Result<Option<FeatureRecord>> {
        Ok(self.read_all()?.into_iter().find(|r| r.transaction_id == transaction_id))
    }

    /// List records filtered by normalized symbol equality and an
    /// optional inclusive `[start, end]` window on `entry_dt`.
    pub fn list(&self, symbol: Option<&str>, window: Option<(NaiveDate, NaiveDate)>) -> Result<Vec<FeatureRecord>> {
        let records = self.read_all()?;
        Ok(records
            .into_iter()
            .filter(|r| match symbol {
                Some(s) => normalize_symbol(&r.symbol) == normalize_symbol(s),
                None => true,
            })
            .filter(|r| match window {
                Some((start, end)) => r.entry_dt >= start && r.entry_dt <= end,
                None => true,
            })
            .collect())
    }

    /// Export the journal as a BOM-prefixed UTF-8 CSV with metadata
    /// header lines and percent-scaled return fields, in a stable
    /// column order.
    pub fn export_csv(&self, out_path: impl AsRef<Path>) -> Result<()> {
        let records = self.read_all()?;
        let mut out = String::new();
        out.push('\u{feff}');
        out.push_str(&format!("# generated_at,{}\n", chrono::Utc::now().to_rfc3339()));
        out.push_str(&format!("# record_count,{}\n", records.len()));
        out.push_str("transaction_id,symbol,entry_dt,exit_dt,return_pct,exit_reason,updated_at\n");
        for r in &records {
            out.push_str(&format!(
                "{},{},{},{},{:.4},{},{}\n",
                r.transaction_id,
                r.symbol,
                r.entry_dt,
                r.exit_dt,
                r.ret * 100.0,
                r.exit_reason,
                r.updated_at
            ));
        }
        fs::write(out_path, out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn sample(id: &str, snapshot: Value) -> FeatureRecord {
        FeatureRecord {
            transaction_id: id.into(),
            symbol: "600000.SH".into(),
            entry_dt: d(2024, 1, 2),
            exit_dt: d(2024, 1, 10),
            ret: 0.05,
            exit_reason: "SellTarget".into(),
            feature_snapshot: snapshot.clone(),
            feature_snapshot_original: snapshot,
            params_snapshot: None,
            updated_at: "2024-01-10T00:00:00Z".into(),
        }
    }

    #[test]
    fn transaction_id_ignores_exchange_suffix() {
        let a = transaction_id("600000.SH", d(2024, 1, 2), d(2024, 1, 10), "SellTarget");
        let b = transaction_id("600000.SZ", d(2024, 1, 2), d(2024, 1, 10), "SellTarget");
        assert_eq!(a, b);
    }

    #[test]
    fn upsert_preserves_original_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::new(dir.path().join("journal.json"));
        let id = "abc123".to_string();

        store.upsert(sample(&id, json!({"mid": 10.0}))).unwrap();
        store.upsert(sample(&id, json!({"mid": 11.0}))).unwrap();

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.feature_snapshot_original, json!({"mid": 10.0}));
        assert_eq!(record.feature_snapshot, json!({"mid": 11.0}));
    }

    #[test]
    fn list_filters_by_normalized_symbol_and_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::new(dir.path().join("journal.json"));
        store.upsert(sample("t1", json!({}))).unwrap();

        let hits = store.list(Some("600000.SZ"), Some((d(2024, 1, 1), d(2024, 1, 31)))).unwrap();
        assert_eq!(hits.len(), 1);

        let misses = store.list(Some("600000.SZ"), Some((d(2024, 2, 1), d(2024, 2, 28)))).unwrap();
        assert!(misses.is_empty());
    }
}
