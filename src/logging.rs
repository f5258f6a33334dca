use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use env_logger::{fmt::Formatter, Builder, Target};
use log::{LevelFilter, Record};

/// Install the process-wide logger.
///
/// `verbose` counts `-v` flags: 0 logs `info` and above, 1 enables `debug`
/// for this crate, 2 enables `trace` for this crate, anything higher enables
/// `trace` everywhere. `RUST_LOG` is applied last and wins.
///
/// With `log_file` set, records are appended to that file instead of stderr.
pub fn init(verbose: u8, log_file: Option<&Path>) -> io::Result<()> {
    let mut log_builder = Builder::new();
    log_builder.filter(None, LevelFilter::Info);

    match verbose {
        0 => {
            log_builder.format(log_time);
        }
        1 => {
            log_builder
                .format(log_time_module)
                .filter(Some(crate_name()), LevelFilter::Debug);
        }
        2 => {
            log_builder
                .format(log_time_module)
                .filter(Some(crate_name()), LevelFilter::Trace);
        }
        _ => {
            log_builder.format(log_time_module).filter(None, LevelFilter::Trace);
        }
    }

    if let Ok(env_conf) = env::var("RUST_LOG") {
        log_builder.parse_filters(&env_conf);
    }

    if let Some(path) = log_file {
        log_builder.target(Target::Pipe(Box::new(open_log_file(path)?)));
    }

    log_builder.init();
    Ok(())
}

/// Open `path` for appending, creating missing parent directories.
pub fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn crate_name() -> &'static str {
    env!("CARGO_CRATE_NAME")
}

fn log_time(fmt: &mut Formatter, record: &Record) -> io::Result<()> {
    writeln!(fmt, "[{}][{}] {}", fmt.timestamp_millis(), record.level(), record.args())
}

fn log_time_module(fmt: &mut Formatter, record: &Record) -> io::Result<()> {
    writeln!(
        fmt,
        "[{}][{}] [{}] {}",
        fmt.timestamp_millis(),
        record.level(),
        record.module_path().unwrap_or("*"),
        record.args()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;

    #[test]
    fn test_open_log_file_appends() {
        let dir = env::temp_dir().join(format!("socks5d-log-{}", std::process::id()));
        let path = dir.join("nested").join("socks5d.log");

        writeln!(open_log_file(&path).unwrap(), "first").unwrap();
        writeln!(open_log_file(&path).unwrap(), "second").unwrap();

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "first\nsecond\n");

        fs::remove_dir_all(&dir).unwrap();
    }
}
