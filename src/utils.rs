/// Progress reporting utilities
pub mod progress {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    pub fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
        let pb = ProgressBar::new(total);

        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} {msg} [{bar:25.green/bright_black}] {percent:>3}% {elapsed_precise}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏ "),
        );

        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    }

    pub fn create_spinner(message: &str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();

        pb.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );

        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    }
}

/// Time and formatting utilities
pub mod time {
    use std::time::Duration;

    /// Format duration as human readable string
    pub fn format_duration(duration: Duration) -> String {
        let secs = duration.as_secs();
        let hours = secs / 3600;
        let minutes = (secs % 3600) / 60;
        let seconds = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else if secs > 0 {
            format!("{}s", seconds)
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_format_duration() {
            assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
            assert_eq!(format_duration(Duration::from_secs(59)), "59s");
            assert_eq!(format_duration(Duration::from_secs(61)), "1m 1s");
            assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
        }
    }
}
