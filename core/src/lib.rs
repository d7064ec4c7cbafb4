use anyhow::Context;
use log::LevelFilter;
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Config, Root},
    encode::{pattern::PatternEncoder, Encode},
    filter::threshold::ThresholdFilter,
};
use std::backtrace::{Backtrace, BacktraceStatus};

pub mod constants;
pub mod latch;
pub mod latch_buffer;
pub mod net;
pub mod player;
pub mod pool;
pub mod settings;
pub mod world;

/// Pattern encoder that appends a backtrace to error records.
///
/// Whether one is captured follows `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE`,
/// as decided by [`Backtrace::capture`].
#[derive(Debug)]
struct ErrorBacktraceEncoder {
    inner: PatternEncoder,
}

impl ErrorBacktraceEncoder {
    fn new(pattern: &str) -> Self {
        ErrorBacktraceEncoder {
            inner: PatternEncoder::new(pattern),
        }
    }
}

impl Encode for ErrorBacktraceEncoder {
    fn encode(
        &self,
        w: &mut dyn log4rs::encode::Write,
        record: &log::Record<'_>,
    ) -> anyhow::Result<()> {
        if record.level() != log::Level::Error {
            return self.inner.encode(w, record);
        }
        let backtrace = Backtrace::capture();
        if backtrace.status() != BacktraceStatus::Captured {
            return self.inner.encode(w, record);
        }
        self.inner.encode(
            w,
            &record
                .to_builder()
                .args(format_args!("{}\nBacktrace:\n{}", record.args(), backtrace))
                .build(),
        )
    }
}

/// Installs the process logger: stderr filtered at `log_level`, plus an
/// optional log file at the same level. Call once per process.
pub fn initialize_logger(log_level: LevelFilter, file_path: Option<&str>) -> anyhow::Result<()> {
    const LOGGING_PATTERN: &str = "{d} {l} {f}:{L} - {m}\n";

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(ErrorBacktraceEncoder::new(LOGGING_PATTERN)))
        .build();

    let mut config_builder = Config::builder().appender(
        Appender::builder()
            .filter(Box::new(ThresholdFilter::new(log_level)))
            .build("stderr", Box::new(stderr)),
    );
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = file_path {
        // Pattern: https://docs.rs/log4rs/*/log4rs/encode/pattern/index.html
        let logfile = FileAppender::builder()
            .encoder(Box::new(ErrorBacktraceEncoder::new(LOGGING_PATTERN)))
            .build(path)
            .with_context(|| format!("opening log file {path}"))?;
        config_builder =
            config_builder.appender(Appender::builder().build("logfile", Box::new(logfile)));
        root = root.appender("logfile");
    }

    let config = config_builder
        .build(root.build(log_level))
        .context("building logger config")?;

    log4rs::init_config(config).context("installing logger")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use log4rs::encode::{writer::simple::SimpleWriter, Encode};

    use super::ErrorBacktraceEncoder;

    #[test]
    fn records_below_error_use_the_plain_pattern() {
        let encoder = ErrorBacktraceEncoder::new("{l} - {m}");
        let mut out = SimpleWriter(Vec::new());
        encoder
            .encode(
                &mut out,
                &log::Record::builder()
                    .args(format_args!("dust expired"))
                    .level(log::Level::Warn)
                    .build(),
            )
            .unwrap();
        assert_eq!(out.0, b"WARN - dust expired");
    }
}
