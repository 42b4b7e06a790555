//! Prometheus metrics formatting.
//!
//! This module renders queue statistics in Prometheus text exposition format.

use std::fmt::Write;

use crate::queue::QueueStats;

/// Format queue statistics as Prometheus text.
pub fn render_metrics(stats: &QueueStats) -> String {
    let mut output = String::new();

    render_worker_metrics(stats, &mut output);
    render_task_metrics(stats, &mut output);

    output
}

fn render_worker_metrics(stats: &QueueStats, output: &mut String) {
    writeln!(output, "# HELP findr_workers Worker slots by status").ok();
    writeln!(output, "# TYPE findr_workers gauge").ok();
    writeln!(output, "findr_workers{{status=\"idle\"}} {}", stats.workers_idle).ok();
    writeln!(output, "findr_workers{{status=\"busy\"}} {}", stats.workers_busy).ok();
    writeln!(
        output,
        "findr_workers{{status=\"removed\"}} {}",
        stats.workers_removed
    )
    .ok();
}

fn render_task_metrics(stats: &QueueStats, output: &mut String) {
    writeln!(output).ok();
    writeln!(output, "# HELP findr_tasks Tasks in the queue by state").ok();
    writeln!(output, "# TYPE findr_tasks gauge").ok();
    writeln!(output, "findr_tasks{{state=\"waiting\"}} {}", stats.tasks_waiting).ok();
    writeln!(output, "findr_tasks{{state=\"running\"}} {}", stats.tasks_running).ok();

    writeln!(output).ok();
    writeln!(output, "# HELP findr_tasks_submitted_total Tasks submitted this session").ok();
    writeln!(output, "# TYPE findr_tasks_submitted_total counter").ok();
    writeln!(output, "findr_tasks_submitted_total {}", stats.tasks_submitted).ok();

    writeln!(output).ok();
    writeln!(output, "# HELP findr_tasks_finished_total Tasks finished this session").ok();
    writeln!(output, "# TYPE findr_tasks_finished_total counter").ok();
    writeln!(output, "findr_tasks_finished_total {}", stats.tasks_complete).ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP findr_execute_seconds_total Time spent executing tasks"
    )
    .ok();
    writeln!(output, "# TYPE findr_execute_seconds_total counter").ok();
    writeln!(
        output,
        "findr_execute_seconds_total {:.3}",
        stats.total_execute_time_ms as f64 / 1000.0
    )
    .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_metrics_empty() {
        let output = render_metrics(&QueueStats::default());

        assert!(output.contains("findr_workers{status=\"idle\"} 0"));
        assert!(output.contains("findr_tasks{state=\"waiting\"} 0"));
        assert!(output.contains("findr_execute_seconds_total 0.000"));
    }

    #[test]
    fn test_render_metrics_counts() {
        let stats = QueueStats {
            workers_connected: 3,
            workers_busy: 2,
            workers_idle: 1,
            tasks_submitted: 10,
            tasks_running: 2,
            tasks_waiting: 5,
            tasks_complete: 3,
            total_execute_time_ms: 1500,
            ..QueueStats::default()
        };
        let output = render_metrics(&stats);

        assert!(output.contains("findr_workers{status=\"busy\"} 2"));
        assert!(output.contains("findr_tasks_submitted_total 10"));
        assert!(output.contains("findr_tasks_finished_total 3"));
        assert!(output.contains("findr_execute_seconds_total 1.500"));
    }
}
