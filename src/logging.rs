// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Installs the global `tracing` subscriber used by the binary.

use crate::config::LogFormat;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter applied when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Builds the filter from `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initializes logging; calling it more than once keeps the first subscriber.
pub fn init(format: LogFormat) {
    let builder = fmt::Subscriber::builder().with_env_filter(env_filter());

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
