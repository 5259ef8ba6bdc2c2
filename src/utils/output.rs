//! Operator-facing output for the signer.
//!
//! Messages are diagnostics for the person at the card reader, not a
//! machine-readable format.

use std::sync::atomic::{AtomicBool, Ordering};

/// How chatty a message is allowed to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OutputLevel {
    /// Always printed.
    Normal,
    /// Only printed with `--verbose`.
    Verbose,
}

impl OutputLevel {
    /// Level threshold for a run, from the `--verbose` flag.
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            OutputLevel::Verbose
        } else {
            OutputLevel::Normal
        }
    }

    /// Whether a message at `self` should be shown under `threshold`.
    pub fn enabled(self, threshold: OutputLevel) -> bool {
        self <= threshold
    }
}

/// Print an error message to stderr with red color
pub fn print_error(message: &str) {
    eprintln!("\x1b[31mERROR:\x1b[0m {message}");
}

/// Print a success message to stdout with green color
pub fn print_success(message: &str, level: OutputLevel) {
    if level.enabled(threshold()) {
        println!("\x1b[32mSUCCESS:\x1b[0m {message}");
    }
}

/// Print an info message to stdout with blue color
pub fn print_info(message: &str, level: OutputLevel) {
    if level.enabled(threshold()) {
        println!("\x1b[34mINFO:\x1b[0m {message}");
    }
}

/// Print a warning message to stderr with yellow color
pub fn print_warning(message: &str) {
    eprintln!("\x1b[33mWARNING:\x1b[0m {message}");
}

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Enable or disable verbose messages for the rest of the process.
pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

fn threshold() -> OutputLevel {
    OutputLevel::from_verbose(VERBOSE.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_level_gate() {
        assert!(OutputLevel::Normal.enabled(OutputLevel::Normal));
        assert!(OutputLevel::Normal.enabled(OutputLevel::Verbose));
        assert!(!OutputLevel::Verbose.enabled(OutputLevel::Normal));
        assert!(OutputLevel::Verbose.enabled(OutputLevel::Verbose));
    }

    #[test]
    fn test_from_verbose() {
        assert_eq!(OutputLevel::from_verbose(true), OutputLevel::Verbose);
        assert_eq!(OutputLevel::from_verbose(false), OutputLevel::Normal);
    }

    #[test]
    fn test_print_functions() {
        // These tests mainly ensure the functions compile and don't panic
        print_error("Test error");
        print_success("Test success", OutputLevel::Normal);
        print_info("Test info", OutputLevel::Verbose);
        print_warning("Test warning");
    }
}
