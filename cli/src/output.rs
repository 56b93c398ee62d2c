use colored::Colorize;

/// Print a section heading.
pub fn heading(text: &str) {
    println!("{}", text.bold().underline());
}

/// Print an aligned key/value row.
pub fn field(key: &str, value: impl std::fmt::Display) {
    println!("  {:<22} {}", format!("{key}:").dimmed(), value);
}

/// Colorize a health/status label.
pub fn status_label(status: &str) -> colored::ColoredString {
    match status {
        "healthy" | "active" => status.green(),
        "degraded" | "idle" => status.yellow(),
        _ => status.red(),
    }
}

/// Render a millisecond count for humans.
pub fn format_millis(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000)
    } else if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{ms}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(250), "250ms");
        assert_eq!(format_millis(1500), "1.5s");
        assert_eq!(format_millis(90_500), "1m 30s");
    }
}
