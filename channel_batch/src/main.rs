/// main.rs — `batchscan` CLI: grid batch runner and symbol selector
///
/// `scan` fans a parameter grid × symbol universe out over a bounded
/// rayon worker pool and streams one NDJSON record per line to stdout.
/// `select` ranks two already-produced result CSVs (`selector.rs`).
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::error;

use channel_batch::batch::{BatchTaskManager, JobResult};
use channel_batch::selector::{select, Criteria};
use channel_core::config::{BacktestConfig, ChannelHFConfig};
use channel_core::error::EngineError;
use channel_core::scanner::{backtest_for_symbol, symbol_from_path, BacktestOutcome, ScanRequest};

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "batchscan")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ChannelHF strategy over every symbol CSV in a directory,
    /// for each `channel_period` in the given grid.
    Scan {
        #[arg(long)]
        symbols_dir: PathBuf,
        #[arg(long)]
        index: Option<PathBuf>,
        #[arg(long, value_delimiter = ',', default_value = "20")]
        channel_periods: Vec<usize>,
        #[arg(long, default_value_t = 8)]
        max_in_flight: usize,
    },
    /// Rank two result CSVs (one per exit mode) and print the top-N.
    Select {
        #[arg(long)]
        mode_a: String,
        #[arg(long)]
        mode_a_path: PathBuf,
        #[arg(long)]
        mode_b: String,
        #[arg(long)]
        mode_b_path: PathBuf,
        #[arg(long, default_value_t = 20)]
        top_n: usize,
        #[arg(long, default_value_t = 0.0)]
        min_annualized_return: f64,
        #[arg(long, default_value_t = 0.0)]
        min_sharpe: f64,
        #[arg(long, default_value_t = 1.0)]
        max_drawdown: f64,
        #[arg(long, default_value_t = 0)]
        min_trades: u64,
    },
}

struct Job {
    combo_idx: usize,
    combo_label: String,
    symbol: String,
    data_path: PathBuf,
    index_path: Option<PathBuf>,
    channel_period: usize,
}

fn build_jobs(symbols_dir: &PathBuf, index: &Option<PathBuf>, channel_periods: &[usize]) -> anyhow::Result<Vec<Job>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(symbols_dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("csv"))
        .collect();
    paths.sort();

    let mut jobs = Vec::new();
    let mut combo_idx = 0;
    for period in channel_periods {
        for path in &paths {
            let symbol = symbol_from_path(path);
            jobs.push(Job {
                combo_idx,
                combo_label: format!("channel_period={period}"),
                symbol,
                data_path: path.clone(),
                index_path: index.clone(),
                channel_period: *period,
            });
            combo_idx += 1;
        }
    }
    Ok(jobs)
}

fn run_job(job: &Job) -> anyhow::Result<(serde_json::Value, f64, f64)> {
    let req = ScanRequest {
        symbol: job.symbol.clone(),
        data_path: job.data_path.clone(),
        index_path: job.index_path.clone(),
        window: None,
        detail: false,
        robust_segments: None,
        backtest_cfg: BacktestConfig::default().validated()?,
        strategy_cfg: ChannelHFConfig { channel_period: job.channel_period, ..ChannelHFConfig::default() }.validated()?,
        lot_size: 100,
    };

    match backtest_for_symbol(&req)? {
        BacktestOutcome::Compact(summary) => {
            let total_return = summary.total_return;
            let win_rate = summary.win_rate;
            Ok((serde_json::to_value(&summary)?, total_return, win_rate))
        }
        BacktestOutcome::Detail(_) => unreachable!("scan always requests compact summaries"),
    }
}

type JobOutcome = (usize, String, String, anyhow::Result<(serde_json::Value, f64, f64)>);

fn scan(symbols_dir: PathBuf, index: Option<PathBuf>, channel_periods: Vec<usize>, max_in_flight: usize) -> anyhow::Result<()> {
    let jobs = build_jobs(&symbols_dir, &index, &channel_periods)?;
    let total = jobs.len();

    let manager = BatchTaskManager::new(64, 3600, 5_000, 2_000);
    let task_id = manager.create_task(total, Some(json!({"channel_periods": channel_periods})));
    println!("{}", json!({"type": "start", "task_id": task_id, "total": total}));

    let pool = rayon::ThreadPoolBuilder::new().num_threads(max_in_flight.min(16).max(1)).build()?;
    let (tx, rx) = mpsc::channel::<JobOutcome>();

    for job in jobs {
        let tx = tx.clone();
        pool.spawn(move || {
            let outcome = run_job(&job);
            let _ = tx.send((job.combo_idx, job.combo_label, job.symbol, outcome));
        });
    }
    drop(tx);

    let mut done = 0usize;
    loop {
        if manager.is_cancel_requested(&task_id) {
            break;
        }
        match rx.recv_timeout(HEARTBEAT_TIMEOUT) {
            Ok((combo_idx, combo_label, symbol, outcome)) => {
                done += 1;
                match outcome {
                    Ok((data, total_return, win_rate)) => {
                        manager.update_progress(&task_id, Some(JobResult { combo: combo_idx, combo_label, total_return, win_rate }))?;
                        println!("{}", json!({"type": "result", "status": "success", "combo_idx": combo_idx, "symbol": symbol, "data": data, "progress": format!("{done}/{total}")}));
                    }
                    Err(e) => {
                        manager.update_progress(&task_id, None)?;
                        println!("{}", json!({"type": "error", "message": e.to_string(), "combo_idx": combo_idx, "symbol": symbol, "progress": format!("{done}/{total}")}));
                    }
                }
                if done >= total {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let status = manager.get_status(&task_id)?;
                println!("{}", json!({"type": "heartbeat", "progress": format!("{}/{}", status.done, status.total)}));
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    if manager.is_cancel_requested(&task_id) {
        manager.mark_cancelled(&task_id)?;
        println!("{}", json!({"type": "cancelled", "progress": format!("{done}/{total}")}));
        println!("{}", json!({"type": "end", "status": "cancelled"}));
    } else {
        manager.mark_completed(&task_id)?;
        let status = manager.get_status(&task_id)?;
        println!("{}", json!({"type": "end", "status": "completed", "aggregation": status.aggregation}));
    }
    Ok(())
}

fn run_select(mode_a: String, mode_a_path: PathBuf, mode_b: String, mode_b_path: PathBuf, top_n: usize, criteria: Criteria) -> anyhow::Result<()> {
    let (ranked, summaries) = select((mode_a.as_str(), mode_a_path), (mode_b.as_str(), mode_b_path), &criteria, top_n)?;
    for summary in &summaries {
        println!(
            "{}",
            json!({"type": "mode_summary", "mode": summary.mode, "candidates": summary.candidate_count, "avg_annualized_return": summary.avg_annualized_return, "avg_sharpe": summary.avg_sharpe})
        );
    }
    for row in &ranked {
        println!(
            "{}",
            json!({"type": "ranked", "mode": row.mode, "symbol": row.row.symbol, "calmar": row.calmar, "rank_sum": row.rank_sum, "annualized_return": row.row.annualized_return, "sharpe": row.row.sharpe, "max_drawdown": row.row.max_drawdown})
        );
    }
    Ok(())
}

/// Exit code 2 for argument/validation errors (`EngineError::InvalidInput`
/// anywhere in the error chain), 1 for every other runtime failure.
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    for cause in err.chain() {
        if let Some(EngineError::InvalidInput(_)) = cause.downcast_ref::<EngineError>() {
            return ExitCode::from(2);
        }
    }
    ExitCode::from(1)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Scan { symbols_dir, index, channel_periods, max_in_flight } => scan(symbols_dir, index, channel_periods, max_in_flight),
        Command::Select { mode_a, mode_a_path, mode_b, mode_b_path, top_n, min_annualized_return, min_sharpe, max_drawdown, min_trades } => {
            let criteria = Criteria { min_annualized_return, min_sharpe, max_drawdown, min_trades, min_calmar: 0.0 };
            run_select(mode_a, mode_a_path, mode_b, mode_b_path, top_n, criteria)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "batchscan failed");
            exit_code_for(&e)
        }
    }
}
