use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Initial mode; switch later with `PartialProgram::set_training`.
  pub training: bool,
  /// Keep the scope of the most recent call reachable through `last_scope`.
  pub keep_scope: bool,
  /// Warn at construction when traced outputs hold non-tensor values.
  pub check_outputs: bool,
  /// Remove recorded call stacks from operators of derived programs.
  pub strip_op_callstack: bool,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      training: true,
      keep_scope: false,
      check_outputs: true,
      strip_op_callstack: true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_config_keeps_defaults() {
    let c: Config = serde_json::from_str(r#"{"keep_scope": true}"#).unwrap();
    assert!(c.training);
    assert!(c.keep_scope);
    assert!(c.strip_op_callstack);
  }
}
