//! Rate limit status formatting.

use tokio::time::Instant;

use crate::window::WindowLimit;

/// Point-in-time state of one window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStatus {
    pub name: String,
    pub limit: WindowLimit,
    /// Units that could be taken right now.
    pub available: u64,
}

impl WindowStatus {
    /// Capacity of the window.
    pub fn capacity(&self) -> u64 {
        match self.limit {
            WindowLimit::Resetting { limit, .. } => limit,
            WindowLimit::TokenBucket { burst, .. } => burst,
        }
    }

    /// Percentage of capacity still available.
    pub fn available_percent(&self) -> f32 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0.0;
        }
        100.0 * self.available as f32 / capacity as f32
    }
}

/// Format window states for display, one line per window.
pub fn format_status(statuses: &[WindowStatus]) -> Vec<String> {
    let now = Instant::now();
    let width = statuses.iter().map(|s| s.name.len()).max().unwrap_or(0);

    statuses
        .iter()
        .map(|status| {
            let percent = status.available_percent();
            let mut line = format!(
                "{:<width$} {} [{:>3.0}%] {}/{}",
                status.name,
                create_bar(percent, 20),
                percent,
                format_number(status.available),
                format_number(status.capacity()),
            );
            match status.limit {
                WindowLimit::Resetting { resets_at, .. } => {
                    let secs = resets_at.saturating_duration_since(now).as_secs();
                    if secs > 0 {
                        line.push_str(&format!(" resets in {secs}s"));
                    }
                }
                WindowLimit::TokenBucket { rate, .. } => {
                    line.push_str(&format!(" +{rate}/s"));
                }
            }
            line
        })
        .collect()
}

/// Format window states as a single line for a status bar.
pub fn format_status_compact(statuses: &[WindowStatus]) -> String {
    if statuses.is_empty() {
        return "Rate limits: unknown".to_string();
    }
    statuses
        .iter()
        .map(|s| {
            format!(
                "{}:{}/{}",
                s.name,
                format_number(s.available),
                format_number(s.capacity())
            )
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Create a progress bar.
fn create_bar(percent: f32, width: usize) -> String {
    let filled = (((percent / 100.0) * width as f32).round() as usize).min(width);
    let empty = width.saturating_sub(filled);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

/// Format a number with K/M suffixes.
fn format_number(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(500), "500");
        assert_eq!(format_number(1500), "1.5K");
        assert_eq!(format_number(1500000), "1.5M");
    }

    #[test]
    fn test_create_bar() {
        let bar = create_bar(50.0, 10);
        assert_eq!(bar.chars().count(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_format_status() {
        let statuses = vec![
            WindowStatus {
                name: "requests".to_string(),
                limit: WindowLimit::resetting(100, Duration::from_secs(60)),
                available: 50,
            },
            WindowStatus {
                name: "tokens".to_string(),
                limit: WindowLimit::token_bucket(10.0, 2000),
                available: 1500,
            },
        ];

        let lines = format_status(&statuses);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("requests [██████████░░░░░░░░░░] [ 50%] 50/100"));
        assert!(lines[0].ends_with("resets in 60s"));
        assert!(lines[1].ends_with("1.5K/2.0K +10/s"));

        assert_eq!(
            format_status_compact(&statuses),
            "requests:50/100 | tokens:1.5K/2.0K"
        );
        assert_eq!(format_status_compact(&[]), "Rate limits: unknown");
    }
}
