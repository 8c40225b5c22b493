//! Terminal color policy for log output.
//!
//! Resolution order:
//! - An explicit `always` / `never` on the command line wins.
//! - `NO_COLOR` (any value) disables colors.
//! - `EMACS` marks a non-interactive buffer, colors off.
//! - Otherwise colors follow whether the stream is a TTY.

use std::env;

/// When to emit ANSI colors. Parsed directly by `clap` as `--color <WHEN>`.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorWhen {
    /// Enable colors only when output is a TTY.
    #[default]
    Auto,

    /// Always enable colors.
    Always,

    /// Never enable colors.
    Never,
}

impl ColorWhen {
    // ---
    /// Returns whether ANSI color should be used for the given stream.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => env_allows_color() && atty::is(stream),
        }
    }

    /// Log output goes to stderr, so that is the stream that matters.
    pub fn should_color_stderr(self) -> bool {
        self.should_color(atty::Stream::Stderr)
    }
}

fn env_allows_color() -> bool {
    // ---
    env::var_os("NO_COLOR").is_none() && env::var_os("EMACS").is_none()
}
