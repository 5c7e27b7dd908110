use std::{error::Error, path::Path};

use partial_program::Config;
use serde::Deserialize;

/// Defines the config file format (Option fields can be omitted).
#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
  /// Start in training mode
  pub training: Option<bool>,
  /// Keep the scope of the last call for inspection
  pub keep_scope: Option<bool>,
  /// Warn about non-tensor outputs
  pub check_outputs: Option<bool>,
  /// Drop recorded call stacks from derived programs
  pub strip_op_callstack: Option<bool>,
}

impl AppConfig {
  pub fn from_file(path: &Path) -> Result<Self, Box<dyn Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
  }

  // merge configs where the second overwrites the first
  pub fn merge(self, other: Self) -> Self {
    Self {
      training: other.training.or(self.training),
      keep_scope: other.keep_scope.or(self.keep_scope),
      check_outputs: other.check_outputs.or(self.check_outputs),
      strip_op_callstack: other.strip_op_callstack.or(self.strip_op_callstack),
    }
  }

  pub fn into_config(self) -> Config {
    let default = Config::default();
    Config {
      training: self.training.unwrap_or(default.training),
      keep_scope: self.keep_scope.unwrap_or(default.keep_scope),
      check_outputs: self.check_outputs.unwrap_or(default.check_outputs),
      strip_op_callstack: self.strip_op_callstack.unwrap_or(default.strip_op_callstack),
    }
  }
}
