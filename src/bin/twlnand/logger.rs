//! Minimal stderr logger, filtering is left to `log::set_max_level`.

use log::{Log, Metadata, Record};

#[derive(Debug)]
pub struct Logger(());

const LOGGER: &Logger = &Logger(());

impl Logger {
    pub fn init() -> Result<(), log::SetLoggerError> {
        log::set_logger(LOGGER)
    }
}

impl Log for Logger {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        match (record.file(), record.line()) {
            (Some(file), Some(line)) => {
                eprintln!("{}|{}|{}:{}: {}", record.level(), record.target(), file, line, record.args());
            }
            (Some(file), None) => {
                eprintln!("{}|{}|{}: {}", record.level(), record.target(), file, record.args());
            }
            _ => {
                eprintln!("{}|{}: {}", record.level(), record.target(), record.args());
            }
        }
    }

    fn flush(&self) {}
}
