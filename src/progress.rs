use std::time::Duration;

use async_trait::async_trait;
use log::info;

use crate::aggregator::{BatchSummary, ProgressSnapshot};

const MIN_EMIT_INTERVAL: Duration = Duration::from_secs(2);
const TOP_FAILURES_SHOWN: usize = 5;

/// Receives a snapshot after every folded outcome.
///
/// Sinks decide on their own how often to surface anything.
#[async_trait]
pub trait ProgressSink: Send {
    async fn on_progress(&mut self, snapshot: &ProgressSnapshot);
}

/// Decides when a progress snapshot is worth surfacing.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    label: String,
    every_items: usize,
    last_emit: Duration,
    last_text: Option<String>,
}

impl ProgressThrottle {
    pub fn new(label: impl Into<String>, total: usize) -> Self {
        Self {
            label: label.into(),
            every_items: (total / 10).clamp(10, 100),
            last_emit: Duration::ZERO,
            last_text: None,
        }
    }

    /// Returns the text to show for `snapshot`, or `None` when it should be skipped.
    pub fn next_update(&mut self, snapshot: &ProgressSnapshot) -> Option<String> {
        let due = snapshot.elapsed.saturating_sub(self.last_emit) > MIN_EMIT_INTERVAL
            || snapshot.processed % self.every_items == 0
            || snapshot.processed == snapshot.total;
        if !due {
            return None;
        }

        let text = progress_text(&self.label, snapshot);
        if self.last_text.as_deref() == Some(text.as_str()) {
            return None;
        }
        self.last_emit = snapshot.elapsed;
        self.last_text = Some(text.clone());
        Some(text)
    }
}

/// Sink for unattended runs: throttled progress goes to the log.
pub struct LogProgress {
    throttle: ProgressThrottle,
}

impl LogProgress {
    pub fn new(label: impl Into<String>, total: usize) -> Self {
        Self {
            throttle: ProgressThrottle::new(label, total),
        }
    }
}

#[async_trait]
impl ProgressSink for LogProgress {
    async fn on_progress(&mut self, snapshot: &ProgressSnapshot) {
        if self.throttle.next_update(snapshot).is_some() {
            info!(
                "{}: {}/{} processed ({} ok, {} failed)",
                self.throttle.label, snapshot.processed, snapshot.total, snapshot.successes, snapshot.failures
            );
        }
    }
}

pub fn progress_text(label: &str, snapshot: &ProgressSnapshot) -> String {
    let percentage = if snapshot.total > 0 {
        snapshot.processed as f64 / snapshot.total as f64 * 100.0
    } else {
        0.0
    };
    let elapsed = snapshot.elapsed.as_secs_f64();
    let remaining = if snapshot.processed > 5 && elapsed > 2.0 {
        let per_item = elapsed / snapshot.processed as f64;
        Some(per_item * (snapshot.total - snapshot.processed) as f64)
    } else {
        None
    };

    format!(
        "🔄 <b>Processing Accounts ({})...</b>\n\n\
         Progress: {}/{} ({:.1}%)\n\
         ✅ Success: {} | ❌ Failed: {}\n\
         ⏱️ Elapsed: {}\n\
         ⏳ Est. Remaining: {}",
        escape_html(label),
        snapshot.processed,
        snapshot.total,
        percentage,
        snapshot.successes,
        snapshot.failures,
        format_duration_short(Some(elapsed)),
        format_duration_short(remaining),
    )
}

/// Final report sent once a run has folded every outcome.
pub fn summary_text(title: &str, summary: &BatchSummary, elapsed: Duration) -> String {
    let mut parts = vec![
        format!("🏁 <b>{}</b>\n", escape_html(title)),
        format!("📊 Total Accounts Processed: {}", summary.total),
        format!("✅ Successful Tokens: {}", summary.successes.len()),
        format!("❌ Failed/Invalid Accounts: {}", summary.failures.len()),
        format!("⏱️ Total Time Taken: {}", format_duration_short(Some(elapsed.as_secs_f64()))),
    ];

    if summary.by_region_tokens.is_empty() {
        parts.push("\n<b>Successful by Region:</b> 0 tokens found.".to_string());
    } else {
        parts.push("\n<b>Successful by Region:</b>".to_string());
        for (region, tokens) in &summary.by_region_tokens {
            parts.push(format!("- {}: {} tokens", escape_html(region), tokens.len()));
        }
    }

    let failures = summary.top_failures();
    if !failures.is_empty() {
        parts.push(format!("\n<b>Error Summary (Top {} Types):</b>", TOP_FAILURES_SHOWN));
        for (reason, count) in failures.iter().take(TOP_FAILURES_SHOWN) {
            parts.push(format!("- <code>{}</code>: {} times", escape_html(reason), count));
        }
        if failures.len() > TOP_FAILURES_SHOWN {
            parts.push(format!(
                "... and {} more error types.",
                failures.len() - TOP_FAILURES_SHOWN
            ));
        }
    }

    parts.join("\n")
}

/// Formats seconds as `45s`, `2m 5s` or `1h 0m 5s`; `N/A` when unknown.
pub fn format_duration_short(seconds: Option<f64>) -> String {
    let seconds = match seconds {
        Some(s) if s >= 0.0 && s.is_finite() => s as u64,
        _ => return "N/A".to_string(),
    };
    if seconds < 60 {
        return format!("{}s", seconds);
    }

    let (hours, minutes, secs) = (seconds / 3600, seconds % 3600 / 60, seconds % 60);
    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 || (hours > 0 && secs > 0) {
        parts.push(format!("{}m", minutes));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{}s", secs));
    }
    parts.join(" ")
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
