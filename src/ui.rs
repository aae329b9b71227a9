use chrono::{DateTime, Duration, Utc};
use console::{strip_ansi_codes, Term};
use owo_colors::OwoColorize;
use unicode_width::UnicodeWidthStr;

/// Terminal output helpers
pub struct UI {
    term: Term,
}

impl UI {
    pub fn new() -> Self {
        Self {
            term: Term::stdout(),
        }
    }

    /// Helper method to conditionally apply color based on terminal support
    fn colorize<F>(&self, text: &str, color_fn: F) -> String
    where
        F: FnOnce(&str) -> String,
    {
        if self.supports_color() {
            color_fn(text)
        } else {
            text.to_string()
        }
    }

    pub fn success(&self, message: &str) {
        let output = self.colorize(message, |m| m.green().bold().to_string());
        println!("{}", output);
    }

    pub fn error(&self, message: &str) {
        let output = self.colorize(message, |m| m.red().bold().to_string());
        eprintln!("{}", output);
    }

    pub fn warning(&self, message: &str) {
        let output = self.colorize(message, |m| m.yellow().bold().to_string());
        println!("{}", output);
    }

    pub fn info(&self, message: &str) {
        let output = self.colorize(message, |m| m.blue().bold().to_string());
        println!("{}", output);
    }

    /// Authentication state, green/yellow/red when color is available
    pub fn format_auth_status(&self, authenticated: bool, expired: bool) -> String {
        let text = if !authenticated {
            "Not authenticated"
        } else if expired {
            "Token expired"
        } else {
            "Authenticated"
        };

        if self.supports_color() {
            if !authenticated {
                text.red().to_string()
            } else if expired {
                text.yellow().to_string()
            } else {
                text.green().to_string()
            }
        } else {
            text.to_string()
        }
    }

    /// Access token expiry with the time left, yellow once inside the refresh window
    pub fn format_expiry(
        &self,
        expires_at: Option<DateTime<Utc>>,
        remaining: Option<Duration>,
        expiring_soon: bool,
    ) -> String {
        let (Some(expires_at), Some(remaining)) = (expires_at, remaining) else {
            return "Unknown".to_string();
        };

        let text = format!(
            "{} ({})",
            expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
            format_remaining(remaining)
        );

        if !self.supports_color() {
            text
        } else if remaining <= Duration::zero() {
            text.red().to_string()
        } else if expiring_soon {
            text.yellow().to_string()
        } else {
            text.green().to_string()
        }
    }

    /// Format user field with fallback for missing data
    pub fn format_user_field(&self, value: Option<String>) -> String {
        value.unwrap_or_else(|| "-".to_string())
    }

    pub fn format_yes_no(&self, value: bool) -> String {
        if value { "Yes" } else { "No" }.to_string()
    }

    /// Create a card-style display for information
    pub fn card(&self, title: &str, content: Vec<(&str, String)>) {
        let term_width = self.width();
        let card_width = term_width
            .saturating_sub(4) // Leave more space for terminal margins
            .clamp(50, 80);

        let supports_color = self.supports_color();

        println!("╭{}╮", "─".repeat(card_width - 2));
        let title_width = title.width();
        let title_spaces = card_width.saturating_sub(title_width + 4);
        if supports_color {
            println!("│ {} {}│", title.cyan().bold(), " ".repeat(title_spaces));
        } else {
            println!("│ {} {}│", title, " ".repeat(title_spaces));
        }
        println!("├{}┤", "─".repeat(card_width - 2));

        for (label, value) in content {
            // Strip ANSI codes for width calculations
            let label_plain = strip_ansi_codes(label);
            let value_plain = strip_ansi_codes(&value);

            let content_width = label_plain.width() + value_plain.width() + 4;
            let spaces = if content_width < card_width - 1 {
                card_width - content_width - 1
            } else {
                1
            };

            if supports_color {
                println!("│ {}: {}{}│", label.dimmed(), value, " ".repeat(spaces));
            } else {
                println!("│ {}: {}{}│", label, value, " ".repeat(spaces));
            }
        }

        println!("╰{}╯", "─".repeat(card_width - 2));
        println!();
    }

    /// Get terminal width for responsive layout
    pub fn width(&self) -> usize {
        self.term.size().1 as usize
    }

    pub fn supports_color(&self) -> bool {
        self.term.features().colors_supported()
    }
}

impl Default for UI {
    fn default() -> Self {
        Self::new()
    }
}

/// Human readable duration such as `4m 10s`, `2h 5m` or `expired 30s ago`
pub fn format_remaining(remaining: Duration) -> String {
    if remaining <= Duration::zero() {
        return format!("expired {} ago", format_span(-remaining));
    }
    format!("{} left", format_span(remaining))
}

fn format_span(span: Duration) -> String {
    let secs = span.num_seconds();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
