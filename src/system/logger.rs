//! Config-driven logger construction.
//!
//! The runtime takes any `slog::Logger` through [`Parameters`]; this module
//! builds one from a `[log]` config section for callers who configure
//! through a file instead of wiring a drain themselves. Records are printed
//! as plain `{level} [{module}] {body}` lines.
//!
//! [`Parameters`]: crate::Parameters

use slog::{o, Discard, Drain, Level, Logger, OwnedKVList, Record};

use crate::config::LogConfig;

struct PrintlnDrain {
    to_stderr: bool,
}

impl Drain for PrintlnDrain {
    type Ok = ();
    type Err = slog::Never;

    fn log(&self, record: &Record<'_>, _values: &OwnedKVList) -> Result<(), Self::Err> {
        let line = format!(
            "{} [{}] {}",
            record.level().as_short_str(),
            record.module(),
            record.msg()
        );

        if self.to_stderr {
            eprintln!("{}", line);
        } else {
            println!("{}", line);
        }

        Ok(())
    }
}

fn parse_level(name: &str) -> Level {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Level::Trace,
        "debug" => Level::Debug,
        "info" => Level::Info,
        "warning" | "warn" => Level::Warning,
        "error" => Level::Error,
        "critical" => Level::Critical,
        _ => Level::Info,
    }
}

/// Builds a logger for the configured level and destination.
pub(crate) fn from_config(config: &LogConfig) -> Logger {
    match config.destination.to_ascii_lowercase().as_str() {
        "discard" => Logger::root(Discard, o!()),
        destination => {
            let drain = PrintlnDrain {
                to_stderr: destination == "stderr",
            };
            Logger::root(drain.filter_level(parse_level(&config.level)).fuse(), o!())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse_with_a_fallback() {
        assert_eq!(parse_level("debug"), Level::Debug);
        assert_eq!(parse_level("WARN"), Level::Warning);
        assert_eq!(parse_level("gibberish"), Level::Info);
    }

    #[test]
    fn builds_a_logger_for_every_destination() {
        for destination in ["stdout", "stderr", "discard"] {
            let config = LogConfig {
                level: "info".into(),
                destination: destination.into(),
            };
            // Only exercising construction; nothing is logged here.
            let _ = from_config(&config);
        }
    }
}
