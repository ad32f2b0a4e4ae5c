//! Progress bars driven by task events

use crate::output::format_speed;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use multiwan_types::{TaskEvent, TaskId, TaskStatus};
use std::collections::HashMap;

const TEMPLATE: &str =
    "{spinner:.green} {prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// Manages one progress bar per task
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<TaskId, ProgressBar>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Create the bar for a task that just started
    pub fn add_task(&mut self, id: TaskId, label: &str) -> ProgressBar {
        if let Some(pb) = self.bars.get(&id) {
            return pb.clone();
        }

        let pb = self.multi.add(ProgressBar::new(0));
        if let Ok(bar_style) = ProgressStyle::default_bar().template(TEMPLATE) {
            pb.set_style(bar_style.progress_chars("█▓▒░  "));
        }
        pb.set_prefix(label.to_string());
        pb.set_message("starting");

        self.bars.insert(id, pb.clone());
        pb
    }

    /// Update a progress bar from an event
    pub fn handle_event(&self, event: &TaskEvent) {
        let Some(pb) = self.bars.get(&event.task_id()) else {
            return;
        };

        match event {
            TaskEvent::Progress { progress, .. } => {
                if progress.total > 0 {
                    pb.set_length(progress.total);
                }
                pb.set_position(progress.downloaded);
                pb.set_message(format!(
                    "{} ETA {}",
                    format_speed(progress.speed_mbps),
                    progress.eta
                ));
            }

            TaskEvent::StatusChanged { status, .. } => match status {
                TaskStatus::Paused => pb.set_message(format!("{} Paused", style("⏸").yellow())),
                TaskStatus::Downloading => pb.set_message("downloading"),
                _ => {}
            },

            TaskEvent::Completed { path, .. } => {
                if let Some(total) = pb.length() {
                    pb.set_position(total);
                }
                pb.finish_with_message(format!(
                    "{} {}",
                    style("✓").green().bold(),
                    path.display()
                ));
            }

            TaskEvent::Failed { message, .. } => {
                pb.abandon_with_message(format!("{} Failed: {}", style("✗").red().bold(), message));
            }

            TaskEvent::Cancelled { .. } => {
                pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
            }
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
