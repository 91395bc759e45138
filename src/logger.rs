use log::{Log, Metadata, Record};
use std::{
    fmt,
    io::{self, Write},
};

static LOGGER: Logger = Logger;

pub fn setup_logger(max_level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

/// Writes to stderr; stdout is reserved for prompts.
struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "{} {} -- {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

/// Space-separated hex bytes, for packet dumps.
pub fn fmt_slice_hex(data: &[u8]) -> impl fmt::Display + '_ {
    struct HexSlice<'a>(&'a [u8]);
    impl fmt::Display for HexSlice<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let mut bytes = self.0.iter();
            if let Some(first) = bytes.next() {
                write!(f, "{first:02x}")?;
            }
            for b in bytes {
                write!(f, " {b:02x}")?;
            }
            Ok(())
        }
    }
    HexSlice(data)
}
