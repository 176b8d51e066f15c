// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod id;

pub use id::ResourceId;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

/// Log an unrecoverable error with its full cause chain and the location of
/// the caller that gave up on it. The caller is expected to exit afterwards.
#[track_caller]
pub fn report_fatal(err: &anyhow::Error) {
    let loc = std::panic::Location::caller();
    tracing::error!("fatal at {}:{}: {}", loc.file(), loc.line(), err);
    for (depth, cause) in err.chain().skip(1).enumerate() {
        tracing::error!("  {}: {}", depth + 1, cause);
    }
    tracing::error!("root cause: {}", err.root_cause());
}
