use std::io::Write;
use std::{env, thread};

use flexi_logger::{DeferredNow, Duplicate, FileSpec, Logger, LoggerHandle, WriteMode};
use log::Record;

/// Initializes the logger with custom formatting. Log files land in a
/// `logs` directory next to the service binary; `--foreground` runs also
/// mirror everything to stderr.
pub fn init_logger(foreground: bool) -> Result<LoggerHandle, Box<dyn std::error::Error>> {
    let mut logs_dir = env::current_exe()?;
    logs_dir.pop();
    logs_dir.push("logs");

    let mut logger = Logger::try_with_env_or_str("tunserv=info")?
        .log_to_file(FileSpec::default().directory(logs_dir).suppress_timestamp())
        .append()
        .write_mode(WriteMode::BufferAndFlush)
        .format(log_format);
    if foreground {
        logger = logger.duplicate_to_stderr(Duplicate::All);
    }
    Ok(logger.start()?)
}

/// Custom log line format: includes timestamp, level, source file/line, thread name, and message.
fn log_format(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    write!(
        w,
        "{} [{:<5}] [{}:{}] [{}] {}",
        now.format("%Y-%m-%d %H:%M:%S"),
        record.level(),
        record.file().unwrap_or("<unknown>"),
        record.line().unwrap_or(0),
        thread::current().name().unwrap_or("<unnamed>"),
        &record.args()
    )
}
