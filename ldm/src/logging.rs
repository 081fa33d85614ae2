use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Map the numeric `-v` verbosity onto a tracing level.
/// 0..=2 error, 3 warn, 4 info, 5 debug, 6 and above trace.
pub fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0..=2 => LevelFilter::ERROR,
        3 => LevelFilter::WARN,
        4 => LevelFilter::INFO,
        5 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the JSON subscriber. `RUST_LOG` takes precedence over `verbosity`.
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_logging(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .try_init();
}

pub fn print_version() {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "ldm starting"
    );
}
