/// data.rs — CSV bar loader, quality inspector, realtime overlay
///
/// Column detection is deliberately permissive: real data exports vary
/// in case, language, and column order far more than they vary in
/// actual content. Everything downstream (Broker, Event Engine,
/// Strategy) only ever sees a validated `Vec<Bar>`.
use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde::Deserialize;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::types::{Anomaly, AnomalyKind, Bar};

const DATE_ALIASES: &[&str] = &["date", "dt", "datetime", "trade_date", "日期"];
const OPEN_ALIASES: &[&str] = &["open", "开盘", "开盘价"];
const HIGH_ALIASES: &[&str] = &["high", "最高", "最高价"];
const LOW_ALIASES: &[&str] = &["low", "最低", "最低价"];
const CLOSE_ALIASES: &[&str] = &["close", "收盘", "收盘价"];
const VOLUME_ALIASES: &[&str] = &["volume", "vol", "成交量"];

fn normalize_header(h: &str) -> String {
    h.trim().trim_start_matches('\u{feff}').to_lowercase()
}

fn find_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    headers.iter().position(|h| aliases.contains(&h.as_str()))
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y/%m/%d"))
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y%m%d"))
        .ok()
}

fn parse_f64(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok()
}

/// Load and validate a single symbol's bars from a CSV file.
///
/// Malformed rows are skipped (count logged); an optional inclusive
/// `[start, end]` window filters after parsing. `index` is assigned
/// 0-based after the final sort, so it is stable regardless of the
/// file's on-disk row order.
pub fn load_bars_from_csv(
    path: impl AsRef<Path>,
    symbol: &str,
    bounds: Option<(NaiveDate, NaiveDate)>,
) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new().has_headers(true).flexible(true).from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(normalize_header).collect();
    let date_col = find_column(&headers, DATE_ALIASES)
        .ok_or_else(|| EngineError::InvalidInput(format!("{}: no recognizable date column", path.display())))?;
    let open_col = find_column(&headers, OPEN_ALIASES)
        .ok_or_else(|| EngineError::InvalidInput(format!("{}: no recognizable open column", path.display())))?;
    let high_col = find_column(&headers, HIGH_ALIASES)
        .ok_or_else(|| EngineError::InvalidInput(format!("{}: no recognizable high column", path.display())))?;
    let low_col = find_column(&headers, LOW_ALIASES)
        .ok_or_else(|| EngineError::InvalidInput(format!("{}: no recognizable low column", path.display())))?;
    let close_col = find_column(&headers, CLOSE_ALIASES)
        .ok_or_else(|| EngineError::InvalidInput(format!("{}: no recognizable close column", path.display())))?;
    let volume_col = find_column(&headers, VOLUME_ALIASES);

    let mut rows: Vec<(NaiveDate, f64, f64, f64, f64, Option<f64>)> = Vec::new();
    let mut skipped = 0usize;

    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        let parsed = (|| {
            let dt = parse_date(record.get(date_col)?)?;
            let open = parse_f64(record.get(open_col)?)?;
            let high = parse_f64(record.get(high_col)?)?;
            let low = parse_f64(record.get(low_col)?)?;
            let close = parse_f64(record.get(close_col)?)?;
            let volume = volume_col.and_then(|c| record.get(c)).and_then(parse_f64);
            Some((dt, open, high, low, close, volume))
        })();
        match parsed {
            Some(row) => rows.push(row),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!(symbol, skipped, "malformed rows skipped while loading bars");
    }

    rows.sort_by_key(|r| r.0);
    rows.dedup_by_key(|r| r.0);

    let mut bars = Vec::with_capacity(rows.len());
    for (index, (dt, open, high, low, close, volume)) in rows.into_iter().enumerate() {
        if let Some((start, end)) = bounds {
            if dt < start || dt > end {
                continue;
            }
        }
        match Bar::new(symbol, dt, open, high, low, close, volume, index) {
            Ok(bar) => bars.push(bar),
            Err(_) => skipped += 1,
        }
    }

    for w in bars.windows(2) {
        if w[1].has_ohlc_violation() {
            warn!(symbol, dt = %w[1].dt, "OHLC ordering violation");
        }
        if w[0].close > 0.0 && (w[1].close / w[0].close - 1.0).abs() > 0.25 {
            warn!(symbol, dt = %w[1].dt, "day-over-day gap exceeds 25%, possible un-adjusted split");
        }
    }

    Ok(bars)
}

#[derive(Debug, Clone)]
pub struct QualityThresholds {
    pub stale_days: i64,
    pub min_rows: usize,
    pub min_avg_turnover: f64,
    pub min_price: f64,
    pub abnormal_gap_pct: f64,
    /// Calendar-day gap between consecutive bars past which a symbol is
    /// considered to have had a long trading halt.
    pub max_gap_days: i64,
    /// Minimum days since the first loaded bar; 0 disables the check.
    pub min_list_days: i64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        QualityThresholds {
            stale_days: 10,
            min_rows: 60,
            min_avg_turnover: 0.0,
            min_price: 1.0,
            abnormal_gap_pct: 0.20,
            max_gap_days: 15,
            min_list_days: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityReport {
    pub symbol: String,
    pub ok: bool,
    pub anomalies: Vec<Anomaly>,
}

/// Load `path` and classify the resulting bar sequence against the
/// thresholds in §4.1's quality inspector. `name` is the security's
/// display name, used only for the ST-name check; pass `None` when
/// unavailable. Never rejects data outright — callers decide whether
/// to use a non-`ok` symbol. A CSV that fails to load at all is itself
/// a fatal anomaly (`ParseFailed`) rather than a propagated error.
pub fn inspect_quality(
    path: impl AsRef<Path>,
    symbol: &str,
    name: Option<&str>,
    today: NaiveDate,
    thresholds: &QualityThresholds,
) -> QualityReport {
    let bars = match load_bars_from_csv(path.as_ref(), symbol, None) {
        Ok(bars) => bars,
        Err(e) => {
            let anomalies = vec![Anomaly {
                symbol: symbol.into(),
                kind: AnomalyKind::ParseFailed,
                detail: e.to_string(),
                dt: None,
            }];
            return QualityReport { symbol: symbol.into(), ok: false, anomalies };
        }
    };

    let mut anomalies = Vec::new();

    if bars.is_empty() {
        anomalies.push(Anomaly { symbol: symbol.into(), kind: AnomalyKind::Empty, detail: "no bars".into(), dt: None });
        return QualityReport { symbol: symbol.into(), ok: false, anomalies };
    }
    if bars.len() < thresholds.min_rows {
        anomalies.push(Anomaly {
            symbol: symbol.into(),
            kind: AnomalyKind::InsufficientRows,
            detail: format!("{} rows", bars.len()),
            dt: None,
        });
    }

    let mut seen_dates = HashMap::new();
    for bar in &bars {
        if bar.close <= 0.0 || bar.open <= 0.0 {
            anomalies.push(Anomaly { symbol: symbol.into(), kind: AnomalyKind::NonPositivePrice, detail: "non-positive price".into(), dt: Some(bar.dt) });
        }
        if bar.close < thresholds.min_price {
            anomalies.push(Anomaly { symbol: symbol.into(), kind: AnomalyKind::LowPrice, detail: format!("close {:.4}", bar.close), dt: Some(bar.dt) });
        }
        if bar.has_ohlc_violation() {
            anomalies.push(Anomaly { symbol: symbol.into(), kind: AnomalyKind::OhlcViolation, detail: "low/high inconsistent".into(), dt: Some(bar.dt) });
        }
        *seen_dates.entry(bar.dt).or_insert(0u32) += 1;
    }
    for (dt, count) in seen_dates {
        if count > 1 {
            anomalies.push(Anomaly { symbol: symbol.into(), kind: AnomalyKind::DuplicateDates, detail: format!("{count} rows"), dt: Some(dt) });
        }
    }

    for w in bars.windows(2) {
        if w[0].close > 0.0 {
            let pct = (w[1].close / w[0].close - 1.0).abs();
            if pct > thresholds.abnormal_gap_pct {
                anomalies.push(Anomaly { symbol: symbol.into(), kind: AnomalyKind::AbnormalGap, detail: format!("{:.1}%", pct * 100.0), dt: Some(w[1].dt) });
            }
        }
        if thresholds.max_gap_days > 0 {
            let gap_days = (w[1].dt - w[0].dt).num_days();
            if gap_days > thresholds.max_gap_days {
                anomalies.push(Anomaly {
                    symbol: symbol.into(),
                    kind: AnomalyKind::LongHalt,
                    detail: format!("gap={gap_days}d ({}->{})", w[0].dt, w[1].dt),
                    dt: Some(w[1].dt),
                });
            }
        }
    }

    if let Some(last) = bars.last() {
        let staleness = (today - last.dt).num_days();
        if staleness > thresholds.stale_days {
            anomalies.push(Anomaly { symbol: symbol.into(), kind: AnomalyKind::Stale, detail: format!("{staleness} days stale"), dt: Some(last.dt) });
        }
    }

    if thresholds.min_list_days > 0 {
        if let Some(first) = bars.first() {
            let age_days = (today - first.dt).num_days();
            if age_days < thresholds.min_list_days {
                anomalies.push(Anomaly {
                    symbol: symbol.into(),
                    kind: AnomalyKind::ListingTooNew,
                    detail: format!("listed {age_days}d < {}d", thresholds.min_list_days),
                    dt: Some(first.dt),
                });
            }
        }
    }

    if let Some(name) = name {
        if name.to_uppercase().contains("ST") {
            anomalies.push(Anomaly { symbol: symbol.into(), kind: AnomalyKind::StName, detail: format!("name contains ST: {name}"), dt: None });
        }
    }

    let avg_turnover: f64 = bars.iter().map(|b| b.close * b.volume.unwrap_or(0.0)).sum::<f64>() / bars.len() as f64;
    if avg_turnover < thresholds.min_avg_turnover {
        anomalies.push(Anomaly { symbol: symbol.into(), kind: AnomalyKind::LowAvgTurnover, detail: format!("{avg_turnover:.2}"), dt: None });
    }

    let ok = !anomalies.iter().any(|a| a.kind.is_fatal());
    QualityReport { symbol: symbol.into(), ok, anomalies }
}

/// A single-day snapshot overlay, as fetched by a `QuoteSource`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RealtimeSnapshot {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

/// A same-day quote provider for the realtime overlay described in
/// §4.1. Kept as a trait so the engine's tests never touch the
/// network — `NullQuoteSource` always reports "no update".
pub trait QuoteSource: Send + Sync {
    fn fetch(&self, symbol: &str, dt: NaiveDate) -> Option<RealtimeSnapshot>;
}

pub struct NullQuoteSource;

impl QuoteSource for NullQuoteSource {
    fn fetch(&self, _symbol: &str, _dt: NaiveDate) -> Option<RealtimeSnapshot> {
        None
    }
}

#[derive(Deserialize)]
struct RemoteQuotePayload {
    f46: Option<String>,
    f44: Option<String>,
    f45: Option<String>,
    f43: Option<String>,
    f47: Option<String>,
}

fn parse_scaled(raw: &Option<String>, scale: f64) -> Option<f64> {
    let s = raw.as_deref()?;
    if s == "-" {
        return None;
    }
    s.parse::<f64>().ok().map(|v| v / scale)
}

/// Fetches a single same-day snapshot over HTTP. Price fields arrive as
/// scaled integers (`f46`=open, `f44`=high, `f45`=low, `f43`=close,
/// `f47`=volume), price scale 100.0. Failure leaves history untouched —
/// callers treat `None` as "no update", never as an error.
pub struct HttpQuoteSource {
    client: reqwest::Client,
    url_template: String,
}

impl HttpQuoteSource {
    pub fn new(url_template: impl Into<String>) -> Self {
        HttpQuoteSource {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .expect("failed to build HTTP client"),
            url_template: url_template.into(),
        }
    }

    pub async fn fetch_async(&self, symbol: &str) -> Option<RealtimeSnapshot> {
        let url = self.url_template.replace("{symbol}", symbol);
        let payload: RemoteQuotePayload = self.client.get(&url).send().await.ok()?.json().await.ok()?;
        Some(RealtimeSnapshot {
            open: parse_scaled(&payload.f46, 100.0)?,
            high: parse_scaled(&payload.f44, 100.0)?,
            low: parse_scaled(&payload.f45, 100.0)?,
            close: parse_scaled(&payload.f43, 100.0)?,
            volume: parse_scaled(&payload.f47, 1.0),
        })
    }
}

impl QuoteSource for HttpQuoteSource {
    fn fetch(&self, symbol: &str, _dt: NaiveDate) -> Option<RealtimeSnapshot> {
        tokio::runtime::Handle::try_current()
            .ok()
            .and_then(|handle| tokio::task::block_in_place(|| handle.block_on(self.fetch_async(symbol))))
    }
}

/// Append or replace the last bar with a realtime snapshot, if the
/// latest loaded bar's date is today or earlier. Never errors: a
/// failed fetch simply leaves `bars` unchanged.
pub fn apply_realtime_overlay(bars: &mut Vec<Bar>, symbol: &str, today: NaiveDate, source: &dyn QuoteSource) {
    let Some(last) = bars.last() else { return };
    if last.dt > today {
        return;
    }
    let Some(snapshot) = source.fetch(symbol, today) else { return };
    let index = if last.dt == today { last.index } else { last.index + 1 };
    let Ok(bar) = Bar::new(symbol, today, snapshot.open, snapshot.high, snapshot.low, snapshot.close, snapshot.volume, index) else {
        return;
    };
    if last.dt == today {
        *bars.last_mut().unwrap() = bar;
    } else {
        bars.push(bar);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_basic_csv_with_sorted_index() {
        let f = write_csv("date,open,high,low,close,volume\n2024-01-03,10,11,9,10.5,1000\n2024-01-02,9,10,8,9.5,900\n");
        let bars = load_bars_from_csv(f.path(), "AAA", None).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].index, 0);
        assert_eq!(bars[1].index, 1);
        assert!(bars[0].dt < bars[1].dt);
    }

    #[test]
    fn recognizes_chinese_aliases() {
        let f = write_csv("日期,开盘,最高,最低,收盘,成交量\n20240101,10,11,9,10.5,1000\n");
        let bars = load_bars_from_csv(f.path(), "AAA", None).unwrap();
        assert_eq!(bars.len(), 1);
    }

    #[test]
    fn skips_malformed_rows() {
        let f = write_csv("date,open,high,low,close\n2024-01-01,10,11,9,10.5\nnotadate,x,y,z,w\n2024-01-02,9,10,8,9.5\n");
        let bars = load_bars_from_csv(f.path(), "AAA", None).unwrap();
        assert_eq!(bars.len(), 2);
    }

    #[test]
    fn quality_report_flags_insufficient_rows() {
        let f = write_csv("date,open,high,low,close\n2024-01-01,10,11,9,10.5\n");
        let report = inspect_quality(f.path(), "AAA", None, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), &QualityThresholds::default());
        assert!(!report.ok);
        assert!(report.anomalies.iter().any(|a| a.kind == AnomalyKind::InsufficientRows));
    }

    #[test]
    fn quality_report_flags_parse_failed_for_missing_file() {
        let report = inspect_quality("/nonexistent/path/does-not-exist.csv", "AAA", None, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), &QualityThresholds::default());
        assert!(!report.ok);
        assert!(report.anomalies.iter().any(|a| a.kind == AnomalyKind::ParseFailed));
    }

    #[test]
    fn quality_report_flags_st_name_and_listing_age() {
        let f = write_csv(
            "date,open,high,low,close\n2024-06-01,10,11,9,10.5\n2024-06-02,10,11,9,10.5\n",
        );
        let thresholds = QualityThresholds { min_list_days: 365, ..QualityThresholds::default() };
        let report = inspect_quality(f.path(), "AAA", Some("ST Sample Corp"), NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(), &thresholds);
        assert!(report.anomalies.iter().any(|a| a.kind == AnomalyKind::StName));
        assert!(report.anomalies.iter().any(|a| a.kind == AnomalyKind::ListingTooNew));
    }

    #[test]
    fn quality_report_flags_long_halt() {
        let f = write_csv("date,open,high,low,close\n2024-01-01,10,11,9,10.5\n2024-02-01,10,11,9,10.5\n");
        let report = inspect_quality(f.path(), "AAA", None, NaiveDate::from_ymd_opt(2024, 2, 2).unwrap(), &QualityThresholds::default());
        assert!(report.anomalies.iter().any(|a| a.kind == AnomalyKind::LongHalt));
    }

    #[test]
    fn null_quote_source_never_updates() {
        let mut bars = vec![Bar::new("AAA", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 10.0, 11.0, 9.0, 10.5, Some(100.0), 0).unwrap()];
        apply_realtime_overlay(&mut bars, "AAA", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), &NullQuoteSource);
        assert_eq!(bars.len(), 1);
    }
}
