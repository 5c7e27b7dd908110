use serde::Serialize;
use std::{io, path::Path};

#[cfg(not(debug_assertions))]
use human_panic::setup_panic;
use tracing::subscriber::{self, DefaultGuard, SetGlobalDefaultError};

#[cfg(debug_assertions)]
extern crate better_panic;

use tracing_subscriber::{self, fmt};

// [NOTE] tracing
//
// Library code logs through `tracing::{debug, info, warn}` and puts
// `#[instrument]` spans on the construction and per-call entry points.
// Nothing is printed unless the binary (or a test) installs a subscriber.

pub fn install_logger() -> Result<(), SetGlobalDefaultError> {
  let subscriber = tracing_subscriber::fmt().compact();

  #[cfg(debug_assertions)]
  let subscriber = subscriber.with_max_level(tracing::Level::DEBUG);

  subscriber::set_global_default(subscriber.finish())
}

pub fn init_logging() -> Result<(), SetGlobalDefaultError> {
  // Human Panic. Only enabled when *not* debugging.
  #[cfg(not(debug_assertions))]
  {
    setup_panic!();
  }

  // Better Panic. Only enabled *when* debugging.
  #[cfg(debug_assertions)]
  {
    better_panic::Settings::debug()
      .most_recent_first(false)
      .lineno_suffix(true)
      .verbosity(better_panic::Verbosity::Full)
      .install();
  }

  install_logger()?;

  Ok(())
}

/// Thread-local subscriber for a single test; logging stops when the guard drops.
pub fn init_logging_tests() -> DefaultGuard {
  let subscriber = fmt()
    .compact()
    .with_max_level(tracing::Level::DEBUG)
    .with_test_writer()
    .finish();
  subscriber::set_default(subscriber)
}

pub fn serialize_to_file<T: Serialize>(path: &Path, obj: &T) -> io::Result<()> {
  let buff = serde_json::to_string_pretty(obj)?;
  std::fs::write(path, buff)
}
