/// batch.rs — Batch Task Manager
///
/// Tracks one in-flight (or finished) grid sweep: progress, bounded
/// aggregation, and cooperative cancellation. The manager itself never
/// dispatches work — it is state the orchestrator (`main.rs`) reads and
/// writes as jobs complete.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use channel_core::error::{EngineError, Result};
use serde::Serialize;
use serde_json::Value;

const TOP_COMBO_LIMIT: usize = 20;

fn now_ts() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Running,
    RunningCancelling,
    Completed,
    Cancelled,
}

/// One per-job result fed into `update_progress`'s aggregation fold.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub combo: usize,
    pub combo_label: String,
    pub total_return: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Default)]
struct ComboAccumulator {
    combo: usize,
    sum_return: f64,
    sum_win_rate: f64,
    count: usize,
    examples: Vec<JobResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComboTopEntry {
    pub label: String,
    pub avg_return: f64,
    pub win_rate: f64,
    pub samples: usize,
    pub combo: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Aggregation {
    pub return_sum: f64,
    pub return_count: usize,
    pub win_rate_sum: f64,
    pub return_samples: Vec<f64>,
    pub combo_top: Vec<ComboTopEntry>,
}

impl Default for Aggregation {
    fn default() -> Self {
        Aggregation { return_sum: 0.0, return_count: 0, win_rate_sum: 0.0, return_samples: Vec::new(), combo_top: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchTaskState {
    pub task_id: String,
    pub status: TaskStatus,
    pub done: usize,
    pub total: usize,
    pub cancel_requested: bool,
    pub grid_metadata: Option<Value>,
    pub aggregation: Aggregation,
    #[serde(skip)]
    updated_at_ts: i64,
    #[serde(skip)]
    combo_accumulators: AHashMap<String, ComboAccumulator>,
}

impl BatchTaskState {
    fn new(task_id: String, total: usize, grid_metadata: Option<Value>) -> Self {
        BatchTaskState {
            task_id,
            status: TaskStatus::Running,
            done: 0,
            total,
            cancel_requested: false,
            grid_metadata,
            aggregation: Aggregation::default(),
            updated_at_ts: now_ts(),
            combo_accumulators: AHashMap::default(),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    fn recompute_combo_top(&mut self) {
        let mut ranked: Vec<ComboTopEntry> = self
            .combo_accumulators
            .iter()
            .map(|(label, acc)| ComboTopEntry {
                label: label.clone(),
                avg_return: if acc.count > 0 { acc.sum_return / acc.count as f64 } else { 0.0 },
                win_rate: if acc.count > 0 { acc.sum_win_rate / acc.count as f64 } else { 0.0 },
                samples: acc.count,
                combo: acc.combo,
            })
            .collect();
        ranked.sort_by(|a, b| b.avg_return.partial_cmp(&a.avg_return).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(TOP_COMBO_LIMIT);
        self.aggregation.combo_top = ranked;
    }
}

/// Guards every accessor with a single mutex, per the reentrant-lock
/// shape described for this component; eviction runs opportunistically
/// on both `create_task` and any read.
pub struct BatchTaskManager {
    max_tasks: usize,
    ttl_seconds: i64,
    max_return_samples: usize,
    max_combo_examples: usize,
    tasks: Mutex<HashMap<String, BatchTaskState>>,
}

impl BatchTaskManager {
    pub fn new(max_tasks: usize, ttl_seconds: i64, max_return_samples: usize, max_combo_examples: usize) -> Self {
        BatchTaskManager { max_tasks, ttl_seconds, max_return_samples, max_combo_examples, tasks: Mutex::new(HashMap::new()) }
    }

    fn evict_stale_locked(&self, tasks: &mut HashMap<String, BatchTaskState>) {
        let cutoff = now_ts() - self.ttl_seconds;
        tasks.retain(|_, t| t.updated_at_ts >= cutoff);
    }

    pub fn create_task(&self, total: usize, grid_metadata: Option<Value>) -> String {
        let mut tasks = self.tasks.lock().unwrap();
        self.evict_stale_locked(&mut tasks);

        if tasks.len() >= self.max_tasks {
            if let Some(oldest_id) = tasks.iter().min_by_key(|(_, t)| t.updated_at_ts).map(|(id, _)| id.clone()) {
                tasks.remove(&oldest_id);
            }
        }

        let task_id = format!("task-{}-{}", now_ts(), tasks.len());
        tasks.insert(task_id.clone(), BatchTaskState::new(task_id.clone(), total, grid_metadata));
        task_id
    }

    pub fn update_progress(&self, task_id: &str, result: Option<JobResult>) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task_id).ok_or_else(|| EngineError::NotFound(task_id.into()))?;

        task.done = (task.done + 1).min(task.total);
        task.updated_at_ts = now_ts();

        if let Some(res) = result {
            if task.status == TaskStatus::Running || task.status == TaskStatus::RunningCancelling {
                task.aggregation.return_sum += res.total_return;
                task.aggregation.return_count += 1;
                task.aggregation.win_rate_sum += res.win_rate;
                if task.aggregation.return_samples.len() < self.max_return_samples {
                    task.aggregation.return_samples.push(res.total_return);
                }

                let acc = task.combo_accumulators.entry(res.combo_label.clone()).or_default();
                acc.combo = res.combo;
                acc.sum_return += res.total_return;
                acc.sum_win_rate += res.win_rate;
                acc.count += 1;
                if acc.examples.len() < self.max_combo_examples {
                    acc.examples.push(res);
                }
                task.recompute_combo_top();
            }
        }
        Ok(())
    }

    pub fn request_cancel(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task_id).ok_or_else(|| EngineError::NotFound(task_id.into()))?;
        if task.is_terminal() {
            return Err(EngineError::AlreadyCompleted(task_id.into()));
        }
        task.cancel_requested = true;
        task.status = TaskStatus::RunningCancelling;
        task.updated_at_ts = now_ts();
        Ok(())
    }

    pub fn mark_completed(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task_id).ok_or_else(|| EngineError::NotFound(task_id.into()))?;
        if task.status == TaskStatus::Cancelled {
            return Err(EngineError::AlreadyCompleted(task_id.into()));
        }
        task.status = TaskStatus::Completed;
        task.updated_at_ts = now_ts();
        Ok(())
    }

    pub fn mark_cancelled(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task_id).ok_or_else(|| EngineError::NotFound(task_id.into()))?;
        if task.status == TaskStatus::Completed {
            return Err(EngineError::AlreadyCompleted(task_id.into()));
        }
        task.status = TaskStatus::Cancelled;
        task.updated_at_ts = now_ts();
        Ok(())
    }

    pub fn get_status(&self, task_id: &str) -> Result<BatchTaskState> {
        let mut tasks = self.tasks.lock().unwrap();
        self.evict_stale_locked(&mut tasks);
        tasks.get(task_id).cloned().ok_or_else(|| EngineError::NotFound(task_id.into()))
    }

    pub fn is_cancel_requested(&self, task_id: &str) -> bool {
        self.tasks.lock().unwrap().get(task_id).map(|t| t.cancel_requested).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> BatchTaskManager {
        BatchTaskManager::new(64, 3600, 5_000, 2_000)
    }

    #[test]
    fn progress_caps_at_total_and_folds_results() {
        let mgr = manager();
        let id = mgr.create_task(2, None);
        mgr.update_progress(&id, Some(JobResult { combo: 0, combo_label: "A".into(), total_return: 0.1, win_rate: 0.6 })).unwrap();
        mgr.update_progress(&id, Some(JobResult { combo: 0, combo_label: "A".into(), total_return: 0.2, win_rate: 0.4 })).unwrap();
        mgr.update_progress(&id, None).unwrap(); // overshoot, still caps

        let status = mgr.get_status(&id).unwrap();
        assert_eq!(status.done, 2);
        assert_eq!(status.aggregation.return_count, 2);
        assert_eq!(status.aggregation.combo_top.len(), 1);
        assert!((status.aggregation.combo_top[0].avg_return - 0.15).abs() < 1e-9);
    }

    #[test]
    fn cancel_then_complete_is_rejected() {
        let mgr = manager();
        let id = mgr.create_task(1, None);
        mgr.request_cancel(&id).unwrap();
        mgr.mark_cancelled(&id).unwrap();
        assert!(mgr.mark_completed(&id).is_err());
    }

    #[test]
    fn cancel_on_unknown_task_is_not_found() {
        let mgr = manager();
        assert!(mgr.request_cancel("missing").is_err());
    }

    #[test]
    fn double_cancel_request_is_idempotent_while_running() {
        let mgr = manager();
        let id = mgr.create_task(5, None);
        mgr.request_cancel(&id).unwrap();
        assert!(mgr.is_cancel_requested(&id));
        // A second cancel request on an already-cancelling task is fine:
        // the state is still non-terminal.
        mgr.request_cancel(&id).unwrap();
    }

    #[test]
    fn eviction_drops_oldest_task_when_full() {
        let mgr = BatchTaskManager::new(1, 3600, 100, 100);
        let first = mgr.create_task(1, None);
        let second = mgr.create_task(1, None);
        assert!(mgr.get_status(&first).is_err());
        assert!(mgr.get_status(&second).is_ok());
    }
}
