use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};

use anyhow::Result;
use slog::{o, Drain};

use tinymq_conf::logging::{Log, To};

pub use slog::Logger;

/// Builds the slog backend described by `log` and routes the `log` facade into it.
pub fn logger_init(log: &Log) -> Result<Logger> {
    let level = log.level.inner();
    let logger = config_logger(log.filename(), log.to, level)?;
    log::set_boxed_logger(Box::new(LoggerEx(logger.clone())))
        .map_err(|e| anyhow::Error::msg(format!("logger already initialized, {:?}", e)))?;
    log::set_max_level(slog_log_to_level(level).to_level_filter());
    Ok(logger)
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error => log::Level::Error,
        slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

pub fn config_logger(filename: String, to: To, level: slog::Level) -> Result<Logger> {
    let decorator = slog_term::PlainDecorator::new(WriteFilter::new(filename, to)?);
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(|io: &mut dyn io::Write| {
            write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        })
        .build()
        .fuse();

    let drain = LevelFilter { drain, level }.fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Ok(Logger::root(drain, o!()))
}

struct LevelFilter<D> {
    drain: D,
    level: slog::Level,
}

impl<D> Drain for LevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(&self, record: &slog::Record, values: &slog::OwnedKVList) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

struct WriteFilter {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(filename: String, to: To) -> Result<Self> {
        let file = if to.file() { Some(open_file(&filename)?) } else { None };
        Ok(Self { to, file, console: io::stdout() })
    }

    fn write_file(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.to {
            To::Console => self.console.write(buf)?,
            To::File => self.write_file(buf)?,
            To::Both => {
                let _ = self.console.write(buf)?;
                self.write_file(buf)?
            }
            To::Off => buf.len(),
        };
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> Result<File> {
    if let Some(dir) = std::path::Path::new(filename).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow::Error::msg(format!("logger dir config error, {:?}, {:?}", dir, e)))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| anyhow::Error::msg(format!("logger file config error, filename: {}, {:?}", filename, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(log_to_slog_level(log::Level::Warn), slog::Level::Warning);
        assert_eq!(slog_log_to_level(slog::Level::Critical), log::Level::Error);
        assert_eq!(slog_log_to_level(log_to_slog_level(log::Level::Debug)), log::Level::Debug);
    }

    #[test]
    fn test_file_logger() {
        let dir = std::env::temp_dir().join(format!("tinymq-logger-{}", std::process::id()));
        let filename = dir.join("test.log").to_string_lossy().to_string();

        let logger = config_logger(filename.clone(), To::File, slog::Level::Info).unwrap();
        slog::info!(logger, "broker started");
        slog::debug!(logger, "filtered out");
        drop(logger);

        let content = std::fs::read_to_string(&filename).unwrap();
        assert!(content.contains("broker started"));
        assert!(!content.contains("filtered out"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_off_writes_nothing() {
        let mut w = WriteFilter::new(String::new(), To::Off).unwrap();
        assert_eq!(w.write(b"abc").unwrap(), 3);
        assert!(w.file.is_none());
        w.flush().unwrap();
    }
}
