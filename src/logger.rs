use std::io::Write;
use std::fs::File;

/// The notification sink of the pipeline.
///
/// Level 0 messages are always shown, level 1 is per-volume progress and
/// level 2 is per-item tracing. The scanner, grouper and deduper only ever
/// write to it.
#[derive(Debug)]
pub struct Logger {
    verbosity: u32,
    log_file: Option<File>,
}

impl Logger {
    /// Create a new logger.
    pub fn new(verbosity: u32, log_file: Option<File>) -> Self
    {
        Self {
            verbosity,
            log_file,
        }
    }

    /// Log a message, with a specified level.
    /// The log file, if present, receives it regardless of verbosity.
    pub fn log(&mut self, level: u32, msg: &str)
    {
        if self.verbosity >= level {
            eprintln!("{}", msg);
        }

        if let Some(log_file) = &mut self.log_file {
            writeln!(log_file, "{}", msg).unwrap_or_else(|_| {
                eprintln!("error: couldn't write into the log file")
            });
        }
    }
}
