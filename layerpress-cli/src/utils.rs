use console::style;
use indicatif::{ProgressBar, ProgressStyle};

pub fn print_success(message: &str) {
    println!("{} {}", style("✅").green(), style(message).green());
}

pub fn print_error(message: &str) {
    println!("{} {}", style("❌").red(), style(message).red());
}

pub fn print_info(message: &str) {
    println!("{} {}", style("ℹ️").blue(), style(message).blue());
}

pub fn print_warning(message: &str) {
    println!("{} {}", style("⚠️").yellow(), style(message).yellow());
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size as u64, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// First 12 hex characters of a digest, the way image tools print ids.
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.split_once(':').map_or(digest, |(_, hex)| hex);
    &hex[..12.min(hex.len())]
}

pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.blue} {msg}")
    {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

pub fn print_separator() {
    println!("{}", style("─".repeat(60)).dim());
}

pub fn print_header(title: &str) {
    println!();
    print_separator();
    println!("{}", style(title).bold().cyan());
    print_separator();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(
            short_digest("sha256:0123456789abcdef0123456789abcdef"),
            "0123456789ab"
        );
        assert_eq!(short_digest("abc"), "abc");
    }
}
