use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

// Clone because a single batch failure is delivered to every waiter.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("config error: {message}")]
    Config { message: String },

    #[error("{location}: upstream error: {message}")]
    Upstream {
        location: &'static str,
        message: String,
    },

    #[error("deadline exceeded: {message}")]
    Deadline { message: String },

    #[error("parse mismatch: got {got} {unit}, want {want}")]
    Parse {
        got: usize,
        want: usize,
        unit: &'static str,
    },

    #[error("rate limited: next slot in {wait_ms} ms exceeds the request budget")]
    RateLimited { wait_ms: u64 },
}

impl LlmError {
    pub fn config(e: impl std::fmt::Display) -> Self {
        Self::Config {
            message: e.to_string(),
        }
    }

    pub fn upstream(location: &'static str, e: impl std::fmt::Display) -> Self {
        Self::Upstream {
            location,
            message: e.to_string(),
        }
    }
}
