use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

static RUST_LOG_ONCE: Once = Once::new();
static INSTALLED_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

fn env_level() -> LevelFilter {
    std::env::var("AD5933_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize stderr logging from `AD5933_LOG`/`RUST_LOG`.
pub fn init_rust_logging() {
    init_logging_with(None);
}

/// Same as [`init_rust_logging`], with an explicit level taking precedence
/// over the environment. Only the first call installs a logger.
pub fn init_logging_with(level: Option<LevelFilter>) {
    let level = level.unwrap_or_else(env_level);
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        let installed = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init()
            .is_ok();
        if installed {
            let _ = INSTALLED_LEVEL.set(level);
        }
    });
}

/// Level passed to the logger at installation, if this crate installed one.
pub fn installed_level() -> Option<LevelFilter> {
    INSTALLED_LEVEL.get().copied()
}
