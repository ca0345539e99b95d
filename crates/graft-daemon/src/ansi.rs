//! ANSI escape sequences for the pusher-facing transcript.

/// Red foreground.
pub const RED: &str = "\x1b[31m";
/// Green foreground.
pub const GREEN: &str = "\x1b[32m";
/// Blue foreground.
pub const BLUE: &str = "\x1b[34m";
/// Reset all attributes.
pub const RESET: &str = "\x1b[0m";
