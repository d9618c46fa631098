use crate::kernel_metadata::errno_name;
use backtrace::Backtrace;
use nix::errno::errno;
use std::collections::HashMap;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Result, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    // Possibly buffered
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let mut f: Box<dyn Write + Send>;
        if let Ok(filename) = env::var("FASTFWD_LOG_FILE") {
            f = Box::new(File::create(&filename).unwrap());
        } else if let Ok(filename) = env::var("FASTFWD_APPEND_LOG_FILE") {
            f = Box::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&filename)
                    .unwrap(),
            );
        } else {
            f = Box::new(io::stderr());
        }

        if let Ok(buf_size) = env::var("FASTFWD_LOG_BUFFER") {
            let buf_size = buf_size.parse::<usize>().unwrap();
            f = Box::new(BufWriter::with_capacity(buf_size, f));
        }

        let (maybe_default, level_map) = match env::var("FASTFWD_LOG") {
            Ok(spec) => parse_log_spec(&spec),
            Err(_) => (None, HashMap::new()),
        };

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file: f,
            default_level: maybe_default.unwrap_or(LogError),
        })
    };
}

/// Parse a `module:level` list, e.g. `all:warn,fast_forward:debug`.
/// The pseudo-module `all` sets the default level. Unparseable entries
/// are dropped silently so a bad env var can't take the tracer down.
fn parse_log_spec(spec: &str) -> (Option<LogLevel>, HashMap<String, LogLevel>) {
    let mut maybe_default = None;
    let mut map = HashMap::new();
    for entry in spec.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut it = entry.splitn(2, ':');
        let name = it.next().unwrap();
        let level = match it.next().map(log_level_from_str) {
            Some(Some(level)) => level,
            _ => continue,
        };
        if name.eq_ignore_ascii_case("all") {
            maybe_default = Some(level);
        } else {
            map.insert(name.to_owned(), level);
        }
    }
    (maybe_default, map)
}

fn log_level_from_str(s: &str) -> Option<LogLevel> {
    match s.to_ascii_lowercase().as_str() {
        "fatal" => Some(LogFatal),
        "error" => Some(LogError),
        "warn" => Some(LogWarn),
        "info" => Some(LogInfo),
        "debug" => Some(LogDebug),
        _ => None,
    }
}

/// Given a module name, what is its log level?
fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // Filenames are case sensitive on Linux, don't lowercase.
    match l.level_map.get(module_name) {
        Some(level) => *level,
        None => l.default_level,
    }
}

/// Given a filename, the corresponding module name.
fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    path.file_stem().unwrap().to_string_lossy().to_string()
}

/// Given the filename get the corresponding LogModule.
fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(module) = l.log_modules_cache.get(filename) {
        return module.to_owned();
    }
    let name = filename_to_module_name(filename);
    let level = get_log_level(&name, l);
    let m = LogModule { level, name };
    l.log_modules_cache.insert(filename.to_owned(), m.clone());
    m
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        func_name: &str,
        always_enabled: bool,
    ) -> NewLineTerminatingOstream {
        let mut lock = LOG_GLOBALS.lock().unwrap();
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        let mut this = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if enabled {
            if level == LogDebug {
                write!(this, "[{}] ", m.name).unwrap();
            } else {
                write_prefix(&mut this, level, filename, line, func_name);
            }
        }

        this
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write_all(b"\n").unwrap();
            self.flush().unwrap();
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
            self.lock.log_file.flush()?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Pretend these were written even when disabled, otherwise
        // callers get WriteZero errors.
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    func_name: &str,
) {
    write!(stream, "[{} ", log_name(level)).unwrap();
    if level <= LogError {
        write!(stream, "{}:{} ", filename, line).unwrap();
    }

    write!(stream, "{}()", func_name).unwrap();
    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> NewLineTerminatingOstream {
    NewLineTerminatingOstream::new(log_level, filename, line, module_path, always_enabled)
}

/// Write a leveled message to the log sink (stderr unless a log file was
/// configured). Execution continues normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let mut stream = crate::log::log(
                $log_level,
                file!(),
                line!(),
                module_path!(),
                false
            );
            write!(stream, $($args)+).unwrap()
        }
    };
}

/// Log at fatal level, dump a backtrace and abort.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let mut stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                write!(stream, $($args)+).unwrap();
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
        }
    };
}

/// Assert a condition that must hold for the tracee `$task` to be in a
/// sound state. Failure indicates a tracer or kernel bug, not a user
/// error, so this logs with task context and aborts.
macro_rules! ed_assert {
    ($task:expr, $cond:expr$(,)?) => {
        if !$cond {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let mut stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                write!(
                    stream,
                    "Assertion `{}' failed to hold (task tid: {})",
                    stringify!($cond),
                    $task.tid()
                )
                .unwrap();
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
        }
    };
    ($task:expr, $cond:expr, $($args:tt)+) => {
        if !$cond {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let mut stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                write!(
                    stream,
                    "Assertion `{}' failed to hold (task tid: {}): ",
                    stringify!($cond),
                    $task.tid()
                )
                .unwrap();
                write!(stream, $($args)+).unwrap();
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
        }
    };
}

macro_rules! ed_assert_eq {
    ($task:expr, $left:expr, $right:expr$(,)?) => {{
        let left = &$left;
        let right = &$right;
        ed_assert!(
            $task,
            left == right,
            "`{}` is {:?}, expected {:?}",
            stringify!($left),
            left,
            right
        );
    }};
    ($task:expr, $left:expr, $right:expr, $($args:tt)+) => {{
        let left = &$left;
        let right = &$right;
        ed_assert!(
            $task,
            left == right,
            "`{}` is {:?}, expected {:?}: {}",
            stringify!($left),
            left,
            right,
            format_args!($($args)+)
        );
    }};
}

/// Dump the backtrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    write!(io::stderr(), "=== Start backtrace:\n").unwrap();
    write!(io::stderr(), "{:?}", bt).unwrap();
    write!(io::stderr(), "=== End backtrace\n").unwrap();
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_name_from_filename() {
        assert_eq!(filename_to_module_name("src/fast_forward.rs"), "fast_forward");
        assert_eq!(filename_to_module_name("lib.rs"), "lib");
    }

    #[test]
    fn log_spec_parsing() {
        let (default, map) = parse_log_spec("all:warn,fast_forward:debug");
        assert!(default == Some(LogWarn));
        assert!(map.get("fast_forward") == Some(&LogDebug));

        let (default, map) = parse_log_spec("bogus,also:bogus");
        assert!(default.is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn level_ordering() {
        assert!(LogFatal < LogError);
        assert!(LogError < LogDebug);
    }
}
