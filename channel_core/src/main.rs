/// main.rs — `backtest` CLI entry point
///
/// Loads one symbol's bars, runs the ChannelHF strategy through the
/// Event Engine, and prints either a compact metrics summary or the
/// full result as JSON.
use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDate;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use channel_core::config::{BacktestConfig, ChannelHFConfig};
use channel_core::error::EngineError;
use channel_core::scanner::{backtest_for_symbol, symbol_from_path, BacktestOutcome, ScanRequest};

#[derive(Parser, Debug)]
#[command(name = "backtest", about = "Run the ChannelHF mean-reversion strategy over one symbol's daily bars")]
struct Args {
    /// CSV file with date/open/high/low/close[/volume] columns
    #[arg(long)]
    data: PathBuf,

    /// Optional benchmark index CSV, same format
    #[arg(long)]
    index: Option<PathBuf>,

    /// Symbol name; defaults to the data file's stem
    #[arg(long)]
    symbol: Option<String>,

    /// Inclusive window start, YYYY-MM-DD
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Inclusive window end, YYYY-MM-DD
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Starting cash
    #[arg(long, default_value_t = 1_000_000.0)]
    initial_cash: f64,

    /// Emit the full result (equity curve, trades, signal logs) as JSON
    #[arg(long)]
    detail: bool,

    /// Number of equal segments for robust subperiod scoring
    #[arg(long)]
    robust_segments: Option<usize>,
}

fn run(args: Args) -> channel_core::error::Result<BacktestOutcome> {
    let symbol = args.symbol.clone().unwrap_or_else(|| symbol_from_path(&args.data));
    let window = match (args.start, args.end) {
        (Some(s), Some(e)) => Some((s, e)),
        _ => None,
    };

    let req = ScanRequest {
        symbol,
        data_path: args.data,
        index_path: args.index,
        window,
        detail: args.detail,
        robust_segments: args.robust_segments,
        backtest_cfg: BacktestConfig { initial_cash: args.initial_cash, ..BacktestConfig::default() }.validated()?,
        strategy_cfg: ChannelHFConfig::default().validated()?,
        lot_size: 100,
    };

    backtest_for_symbol(&req)
}

#[derive(serde::Serialize)]
struct SerializableResult<'a> {
    equity_curve: &'a [channel_core::types::EquityPoint],
    benchmark_curve: &'a [channel_core::types::EquityPoint],
    trades: &'a [channel_core::types::Trade],
    metrics: &'a channel_core::metrics::Metrics,
    anomalies: &'a [channel_core::types::Anomaly],
    signal_logs: &'a [channel_core::types::SignalLogEntry],
}

impl<'a> From<&'a channel_core::types::RunResult> for SerializableResult<'a> {
    fn from(r: &'a channel_core::types::RunResult) -> Self {
        SerializableResult {
            equity_curve: &r.equity_curve,
            benchmark_curve: &r.benchmark_curve,
            trades: &r.trades,
            metrics: &r.metrics,
            anomalies: &r.anomalies,
            signal_logs: &r.signal_logs,
        }
    }
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!(data = %args.data.display(), detail = args.detail, "starting backtest");

    match run(args) {
        Ok(BacktestOutcome::Detail(result)) => {
            match serde_json::to_string_pretty(&SerializableResult::from(&*result)) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "failed to serialize result");
                    ExitCode::from(1)
                }
            }
        }
        Ok(BacktestOutcome::Compact(summary)) => {
            println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_else(|_| format!("{summary:?}")));
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "backtest failed");
            match e {
                EngineError::InvalidInput(_) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}
