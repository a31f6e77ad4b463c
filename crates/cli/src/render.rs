//! Plain-text rendering of orchestrator events

use agent_runner::color::{paint, ColorTag, Palette};
use agent_runner::{ParallelEvent, ParallelSummary, WorkerResult, WorkerStatus};

const OUTPUT_PREVIEW_CHARS: usize = 120;

/// One line per event; progress without new output renders as `None`
pub struct EventPrinter {
    palette: Palette,
    last_output: std::collections::HashMap<String, String>,
}

impl EventPrinter {
    pub fn new(palette: Palette) -> Self {
        Self {
            palette,
            last_output: Default::default(),
        }
    }

    pub fn render(&mut self, event: &ParallelEvent) -> Option<String> {
        let line = match event {
            ParallelEvent::TaskClaimed { worker_id, task_id } => {
                format!("{} claimed {}", self.worker(worker_id), task_id)
            }
            ParallelEvent::WorkerStarted {
                worker_id, state, ..
            } => format!(
                "{} started \"{}\" on {}",
                self.worker(worker_id),
                state.task.title,
                state.branch_name
            ),
            ParallelEvent::WorkerProgress {
                worker_id, state, ..
            } => {
                if state.last_output.is_empty() {
                    return None;
                }
                let previous = self.last_output.get(worker_id);
                if previous == Some(&state.last_output) {
                    return None;
                }
                self.last_output
                    .insert(worker_id.clone(), state.last_output.clone());
                format!(
                    "{} [{}/{}] {}",
                    self.worker(worker_id),
                    state.current_iteration,
                    state.max_iterations,
                    preview(&state.last_output)
                )
            }
            ParallelEvent::WorkerCompleted {
                worker_id,
                task_id,
                result,
            }
            | ParallelEvent::WorkerFailed {
                worker_id,
                task_id,
                result,
            } => {
                self.last_output.remove(worker_id);
                format!(
                    "{} {} {}",
                    self.worker(worker_id),
                    task_id,
                    self.outcome(result)
                )
            }
            ParallelEvent::AllComplete { summary } => self.summary(summary),
        };
        Some(line)
    }

    pub fn summary(&self, summary: &ParallelSummary) -> String {
        let mut out = format!(
            "{} tasks: {} completed, {} failed, {} cancelled, {} commits in {:.1}s",
            summary.total_tasks,
            paint(&summary.completed.to_string(), ColorTag::Success, self.palette),
            paint(&summary.failed.to_string(), ColorTag::Error, self.palette),
            paint(&summary.cancelled.to_string(), ColorTag::Warning, self.palette),
            summary.total_commits,
            summary.duration_ms as f64 / 1000.0
        );
        for task in &summary.results {
            out.push_str(&format!(
                "\n  {} {} ({}) {}",
                task.task_id,
                task.branch_name,
                task.worker_id,
                self.outcome(&task.result)
            ));
        }
        out
    }

    fn worker(&self, worker_id: &str) -> String {
        paint(worker_id, ColorTag::for_worker(worker_id), self.palette)
    }

    fn outcome(&self, result: &WorkerResult) -> String {
        let (label, status) = if result.is_cancelled() {
            ("cancelled".to_string(), WorkerStatus::Cancelled)
        } else if !result.success {
            (
                format!("failed: {}", result.error.as_deref().unwrap_or("unknown error")),
                WorkerStatus::Error,
            )
        } else if result.task_completed {
            ("done".to_string(), WorkerStatus::Completed)
        } else {
            ("stopped before completion".to_string(), WorkerStatus::Paused)
        };
        format!(
            "{} after {} iterations, {} commits",
            paint(&label, ColorTag::for_status(status), self.palette),
            result.iterations,
            result.commit_count
        )
    }
}

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > OUTPUT_PREVIEW_CHARS {
        let cut: String = line.chars().take(OUTPUT_PREVIEW_CHARS).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}
