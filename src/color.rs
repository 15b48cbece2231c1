//! Terminal color for the CLI's one-line status output.
//!
//! Precedence for deciding whether to emit ANSI codes:
//! SPRITE_PIPELINE_COLOR env var > --color flag > NO_COLOR > TTY detection.

use clap::ValueEnum;
use once_cell::sync::OnceCell;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn parse(s: &str) -> Option<ColorMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(ColorMode::Auto),
            "always" | "on" | "true" | "yes" => Some(ColorMode::Always),
            "never" | "off" | "false" | "no" => Some(ColorMode::Never),
            _ => None,
        }
    }

    fn allows(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => is_tty,
        }
    }
}

/// Mode requested via --color; set once at startup.
static CLI_MODE: OnceCell<ColorMode> = OnceCell::new();

pub fn set_color_mode(mode: ColorMode) {
    let _ = CLI_MODE.set(mode);
}

fn effective_mode() -> ColorMode {
    if let Ok(v) = std::env::var("SPRITE_PIPELINE_COLOR") {
        if let Some(m) = ColorMode::parse(&v) {
            return m;
        }
    }
    if let Some(m) = CLI_MODE.get() {
        return *m;
    }
    // https://no-color.org/ applies only when nothing above decided.
    if std::env::var_os("NO_COLOR").is_some() {
        return ColorMode::Never;
    }
    ColorMode::Auto
}

/// Severity of a CLI line. Each tone maps to one ANSI style so run output
/// stays scannable: cyan progress, yellow stop/resume hints, red failures.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Tone {
    Info,
    Warn,
    Error,
}

impl Tone {
    fn ansi(self) -> &'static str {
        match self {
            Tone::Info => "\x1b[36;1m",
            Tone::Warn => "\x1b[33m",
            Tone::Error => "\x1b[31;1m",
        }
    }
}

/// Apply a tone to `s` when `enabled`; otherwise return it unchanged.
pub fn colorize(enabled: bool, tone: Tone, s: &str) -> String {
    if enabled {
        format!("{}{s}\x1b[0m", tone.ansi())
    } else {
        s.to_string()
    }
}

pub fn color_enabled_stdout() -> bool {
    effective_mode().allows(atty::is(atty::Stream::Stdout))
}

pub fn color_enabled_stderr() -> bool {
    effective_mode().allows(atty::is(atty::Stream::Stderr))
}

/// Toned one-liner on stderr; enablement is decided per call so env changes
/// in tests behave predictably.
pub fn stderr_line(tone: Tone, msg: &str) {
    eprintln!("{}", colorize(color_enabled_stderr(), tone, msg));
}

/// Toned one-liner on stdout (the `status` command's output channel).
pub fn stdout_line(tone: Tone, msg: &str) {
    println!("{}", colorize(color_enabled_stdout(), tone, msg));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_common_spellings() {
        assert_eq!(ColorMode::parse("AUTO"), Some(ColorMode::Auto));
        assert_eq!(ColorMode::parse(" on "), Some(ColorMode::Always));
        assert_eq!(ColorMode::parse("off"), Some(ColorMode::Never));
        assert_eq!(ColorMode::parse("rainbow"), None);
    }

    #[test]
    fn test_allows_matrix() {
        assert!(ColorMode::Always.allows(false));
        assert!(!ColorMode::Never.allows(true));
        assert!(ColorMode::Auto.allows(true));
        assert!(!ColorMode::Auto.allows(false));
    }

    #[test]
    fn test_colorize_wraps_and_resets() {
        assert_eq!(colorize(false, Tone::Error, "boom"), "boom");
        let painted = colorize(true, Tone::Warn, "hm");
        assert!(painted.starts_with("\x1b[33m"));
        assert!(painted.ends_with("\x1b[0m"));
    }
}
