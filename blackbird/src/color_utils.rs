//! Color and styling utilities with support for NO_COLOR and TERM environment variables.
//!
//! Colors are disabled by:
//! - `--no-color` CLI flag
//! - `NO_COLOR` environment variable (https://no-color.org/)
//! - `BLACKBIRD_NO_COLOR` environment variable (application-specific)
//! - `TERM=dumb` environment variable
//! - stderr not being a TTY

use colored::ColoredString;
use std::io::{stderr, IsTerminal};
use std::sync::OnceLock;

/// Global color configuration state
static COLOR_CONFIG: OnceLock<ColorConfig> = OnceLock::new();

/// Check environment variables and TTY state for color support
fn should_disable_colors_from_env() -> bool {
    // log messages go to stderr
    colors_disabled_by(|name| std::env::var(name).ok(), stderr().is_terminal())
}

/// Color decision from a variable lookup and the stderr TTY state.
fn colors_disabled_by<F>(var: F, stderr_is_terminal: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let set = |name: &str| var(name).is_some_and(|value| !value.is_empty());
    set("NO_COLOR")
        || set("BLACKBIRD_NO_COLOR")
        || var("TERM").as_deref() == Some("dumb")
        || !stderr_is_terminal
}

#[derive(Debug, Clone)]
struct ColorConfig {
    colors_enabled: bool,
}

impl ColorConfig {
    fn new(no_color_flag: bool) -> Self {
        let colors_enabled = !no_color_flag && !should_disable_colors_from_env();
        Self { colors_enabled }
    }

    fn is_enabled(&self) -> bool {
        self.colors_enabled
    }
}

/// Initialize the color configuration with the CLI flag state.
/// Call once at startup, after parsing CLI arguments.
pub fn init_color_config(no_color_flag: bool) {
    let config = ColorConfig::new(no_color_flag);
    if COLOR_CONFIG.set(config).is_err() {
        log::debug!("Color configuration already initialized");
    }
}

/// Check if colors are enabled based on configuration
pub fn colors_enabled() -> bool {
    COLOR_CONFIG
        .get()
        .map(|config| config.is_enabled())
        .unwrap_or_else(|| !should_disable_colors_from_env())
}

/// Apply color to a string only if colors are enabled for stderr output
pub fn maybe_color_stderr<F>(text: &str, color_fn: F) -> String
where
    F: FnOnce(&str) -> ColoredString,
{
    if colors_enabled() {
        color_fn(text).to_string()
    } else {
        text.to_string()
    }
}

/// Semantic color functions for log level labels
pub mod colors {
    use super::maybe_color_stderr;
    use colored::Colorize;

    pub fn error_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.red().bold())
    }

    pub fn warning_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.yellow())
    }

    pub fn info_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.green())
    }

    pub fn debug_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.blue())
    }

    pub fn trace_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.magenta())
    }
}

/// Semantic symbols for different operation types and states
pub mod symbols {
    use super::colors_enabled;

    fn pick(fancy: &'static str, plain: &'static str) -> &'static str {
        if colors_enabled() {
            fancy
        } else {
            plain
        }
    }

    /// Symbol for starting an experiment analysis
    pub fn analysis_start() -> &'static str {
        pick("🔬 ", "")
    }

    /// Symbol for building a threshold report
    pub fn report_start() -> &'static str {
        pick("📊 ", "")
    }

    pub fn operation_failed() -> &'static str {
        pick("❌ ", "[FAILED] ")
    }

    /// Symbol for technical setup and configuration
    pub fn system_setup() -> &'static str {
        pick("⚙️  ", "")
    }

    pub fn resources_found() -> &'static str {
        pick("🎯 ", "")
    }

    pub fn completed_successfully() -> &'static str {
        pick("✅ ", "[SUCCESS] ")
    }

    /// Symbol for partial success (some samples failed)
    pub fn completed_partially_successfully() -> &'static str {
        pick("⚠️  ", "[PARTIAL-SUCCESS] ")
    }

    pub fn cancelled() -> &'static str {
        pick("🛑 ", "[CANCELLED] ")
    }

    pub fn warning() -> &'static str {
        pick("⚠️  ", "")
    }
}

/// Progress bar utilities that respect TTY state
pub mod progress {
    use super::colors_enabled;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::io::{stderr, IsTerminal};

    /// Create a progress bar for an analysis run, only if stderr is interactive.
    /// The bar length is 1000 so fractional progress maps onto it directly.
    pub fn create_analysis_progress_bar(total_images: usize) -> Option<ProgressBar> {
        if total_images == 0 || !stderr().is_terminal() {
            return None;
        }

        let pb = ProgressBar::new(1000);
        let template = if colors_enabled() {
            "[{elapsed_precise}] [{bar:30.green/black}] {msg}"
        } else {
            "[{elapsed_precise}] [{bar:30}] {msg}"
        };
        let style = ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars(if colors_enabled() { "█▓▒░" } else { "#> " });
        pb.set_style(style);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Some(pb)
    }
}
