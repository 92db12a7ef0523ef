use std::fmt;

use serde::{Deserialize, Serialize};

/// JSON-compatible runtime value carried in payloads and settings.
pub use serde_json::Value;

/// String-keyed payload map. Used for call payloads, handler settings and
/// the runtime configuration tree.
pub type Map = serde_json::Map<String, Value>;

/// Result code reported by a successful call.
pub const OK_CODE: i32 = 0;

/// Result code reported by every runtime-generated failure.
pub const ERROR_CODE: i32 = 1;

/// Outcome of a handler call: `{code, state, description}`.
///
/// The registry never inspects or rewrites a `Res` produced by a handler;
/// it travels back to the caller untouched, across the bus if necessary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Res {
    pub code: i32,
    pub state: String,
    pub description: String,
}

impl Res {
    /// The canonical success result.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: OK_CODE,
            state: "ok".to_string(),
            description: String::new(),
        }
    }

    /// Builds a result with an explicit code, state and description.
    #[must_use]
    pub fn new(code: i32, state: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code,
            state: state.into(),
            description: description.into(),
        }
    }

    /// Builds a failure result with [`ERROR_CODE`].
    #[must_use]
    pub fn fail(state: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(ERROR_CODE, state, description)
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == OK_CODE
    }

    #[must_use]
    pub fn is_fail(&self) -> bool {
        !self.is_ok()
    }
}

impl Default for Res {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Display for Res {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{} ({})", self.state, self.code)
        } else {
            write!(f, "{} ({}): {}", self.state, self.code, self.description)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_is_ok() {
        let res = Res::ok();
        assert!(res.is_ok());
        assert_eq!(res.code, OK_CODE);
        assert_eq!(res.state, "ok");
    }

    #[test]
    fn fail_uses_error_code() {
        let res = Res::fail("bus.not_ready", "bus is not ready");
        assert!(res.is_fail());
        assert_eq!(res.code, ERROR_CODE);
        assert_eq!(res.to_string(), "bus.not_ready (1): bus is not ready");
    }

    #[test]
    fn display_without_description() {
        assert_eq!(Res::ok().to_string(), "ok (0)");
    }
}
