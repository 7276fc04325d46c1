//! Logging configuration for kernelfall.
//!
//! The library only emits through the `log` facade; binaries and tests pick
//! a sink with one of the helpers below.
//!
//! - `warn!` - a kernel fell back from the GPU to the CPU executor
//! - `info!` - backend selection
//! - `debug!` - cache hits/misses, physical program builds
//! - `trace!` - per-dispatch detail (buffer sizes, workgroup counts)
//!
//! ```bash
//! RUST_LOG=kernelfall_gpu=debug kernelfall run scale
//! RUST_LOG=kernelfall_gpu::kernel_cache=trace kernelfall run matmul
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging with the default level (Warn). Subsequent calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize logging with a specific level. Subsequent calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize logging from `RUST_LOG`, defaulting to Warn.
pub fn init_from_env() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Initialize logging for tests. Never panics when called repeatedly.
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .is_test(true)
        .try_init();
}
