use anyhow::Result;
use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;

/// Initialize the logging system with pretty formatting
pub fn init(verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(level)
        .parse_env("PROCCLAMP_LOG")
        .format(format_log)
        .try_init()?;

    Ok(())
}

fn level_label(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "\x1b[31mERROR\x1b[0m", // Red
        log::Level::Warn => "\x1b[33mWARN \x1b[0m",  // Yellow
        log::Level::Info => "\x1b[32mINFO \x1b[0m",  // Green
        log::Level::Debug => "\x1b[36mDEBUG\x1b[0m", // Cyan
        log::Level::Trace => "\x1b[35mTRACE\x1b[0m", // Magenta
    }
}

/// Last path component of a log target, e.g. `supervisor`.
fn module_name(target: &str) -> &str {
    target.split("::").last().unwrap_or(target)
}

fn format_log(buf: &mut env_logger::fmt::Formatter, record: &log::Record) -> std::io::Result<()> {
    let time = chrono::Local::now().format("%H:%M:%S");

    // Module name right-aligned to 10 characters
    writeln!(
        buf,
        "{} {} [{:>10}] {}",
        time,
        level_label(record.level()),
        module_name(record.target()),
        record.args()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_name() {
        assert_eq!(module_name("procclamp::service::supervisor"), "supervisor");
        assert_eq!(module_name("procclamp"), "procclamp");
    }

    #[test]
    fn test_level_label_has_reset_code() {
        for level in [log::Level::Error, log::Level::Info, log::Level::Trace] {
            assert!(level_label(level).ends_with("\x1b[0m"));
        }
    }
}
