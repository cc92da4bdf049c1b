//! Request/task context carrying the trace id.
//!
//! Command timeouts and deploy timeouts are correlated through the trace id:
//! `CmdRunner` publishes `run_timeout.<trace_id>` when a deadline fires, and
//! the deploy worker subscribes to that topic for the task it is executing.

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Ctx {
    pub trace_id: String,
}

impl Ctx {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn with_trace(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
        }
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_trace_ids() {
        assert_ne!(Ctx::new().trace_id, Ctx::new().trace_id);
    }

    #[test]
    fn test_with_trace() {
        assert_eq!(Ctx::with_trace("abc").trace_id, "abc");
    }
}
