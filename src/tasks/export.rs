//! Plain-text rendering of a task and its log

use chrono::{DateTime, Utc};

use crate::model::{Task, TaskLogEntry};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|at| at.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn render(task: &Task, logs: &[TaskLogEntry]) -> String {
    let mut out = format!(
        "Task: {}\nKind: {}\nStatus: {}\nCreated: {}\nStarted: {}\nCompleted: {}\nProgress: {}%\n",
        task.name,
        task.kind,
        task.status.label(),
        timestamp(Some(task.created_at)),
        timestamp(task.started_at),
        timestamp(task.completed_at),
        task.progress,
    );
    if let Some(error) = &task.error_message {
        out.push_str(&format!("Error: {error}\n"));
    }
    out.push_str(&format!("\n{}\n\n", "=".repeat(80)));

    for entry in logs {
        out.push_str(&format!(
            "[{}] {} ({}): {}\n",
            entry.timestamp.format(TIME_FORMAT),
            entry.level,
            entry.source,
            entry.message
        ));
        if let Some(stdout) = &entry.stdout {
            out.push_str(&format!("  STDOUT:\n{stdout}\n"));
        }
        if let Some(stderr) = &entry.stderr {
            out.push_str(&format!("  STDERR:\n{stderr}\n"));
        }
        if let Some(code) = entry.return_code {
            out.push_str(&format!("  Return Code: {code}\n"));
        }
        out.push('\n');
    }

    out
}
