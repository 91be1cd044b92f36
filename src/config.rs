use clap::Parser;
use std::time::Duration;

use crate::error::{LlmError, Result};

// CLI argument structure for the standalone driver
#[derive(Parser, Debug, Clone)]
#[command(name = "quack-llm")]
#[command(about = "Run an instruction list over a columnar file through the LLM dispatch layer")]
pub struct Args {
    // Arrow IPC file with an `id` column (int32/int64) and a `text` column
    #[arg(default_value = "animals.arrow")]
    pub input: String,

    // Instruction to run per row; repeat the flag for several output columns
    #[arg(short, long = "prompt")]
    pub prompts: Vec<String>,

    // Worker pool size (defaults to the number of cpus)
    #[arg(long)]
    pub parallel: Option<usize>,
}

/// Dispatch strategy, from `QUACK_LLM_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Single,
    Fused,
    Batch,
}

impl Mode {
    pub fn from_env() -> Result<Mode> {
        let raw = std::env::var("QUACK_LLM_MODE").unwrap_or_default();
        match raw.trim() {
            "" | "batch" => Ok(Mode::Batch),
            "single" => Ok(Mode::Single),
            "fused" => Ok(Mode::Fused),
            other => Err(LlmError::Config {
                message: format!("unrecognized QUACK_LLM_MODE {other:?}"),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Single => "single",
            Mode::Fused => "fused",
            Mode::Batch => "batch",
        }
    }
}

/// Tunables of the fused dispatcher.
#[derive(Debug, Clone)]
pub struct FusedOptions {
    pub separator: String,
    /// Collection window before a batch freezes.
    pub fuse_delay: Duration,
    /// Extra grace added to the collection window.
    pub fuse_grace: Duration,
    /// Overall deadline for one fused upstream request.
    pub max_wait: Duration,
    /// Requests/sec pacing; None disables the pacer.
    pub rps: Option<u32>,
    /// In-band diagnostics instead of structured errors.
    pub debug: bool,
    pub multi: bool,
    pub multi_max_texts: usize,
    pub multi_batch_wait: Duration,
}

impl Default for FusedOptions {
    fn default() -> Self {
        Self {
            separator: ";".to_string(),
            fuse_delay: Duration::from_millis(10),
            fuse_grace: Duration::ZERO,
            max_wait: Duration::from_secs(30),
            rps: None,
            debug: false,
            multi: false,
            multi_max_texts: 16,
            multi_batch_wait: Duration::from_millis(5),
        }
    }
}

impl FusedOptions {
    pub fn from_env() -> Self {
        let mut opts = Self::default();

        if let Some(ms) = env_int("QUACK_FUSE_DELAY_MS") {
            if ms >= 0 {
                opts.fuse_delay = Duration::from_millis(ms as u64);
            }
        }
        if let Some(ms) = env_int("QUACK_FUSE_GRACE_MS") {
            if ms >= 0 {
                opts.fuse_grace = Duration::from_millis(ms as u64);
            }
        }

        opts.multi = env_flag("QUACK_FUSED_MULTI");
        if let Some(n) = env_int("QUACK_FUSED_MAX_TEXTS") {
            if n > 0 {
                opts.multi_max_texts = n as usize;
            }
        }
        if let Some(ms) = env_int("QUACK_FUSED_BATCH_MS") {
            if ms >= 0 {
                opts.multi_batch_wait = Duration::from_millis(ms as u64);
            }
        }

        if let Some(rps) = env_int("QUACK_FUSED_RPS") {
            if rps > 0 {
                opts.rps = Some(rps as u32);
            }
        }

        opts.debug = env_flag("QUACK_LLM_DEBUG");
        opts
    }
}

/// Tunables of the batch dispatcher.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub flush_delay: Duration,
    pub max_batch_size: usize,
    pub poll_every: Duration,
    pub poll_timeout: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(5),
            max_batch_size: 200,
            poll_every: Duration::from_millis(50),
            poll_timeout: Duration::from_secs(120),
        }
    }
}

fn env_int(key: &str) -> Option<i64> {
    let raw = std::env::var(key).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse().ok()
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| v.trim() == "1").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fused_defaults() {
        let opts = FusedOptions::default();
        assert_eq!(opts.separator, ";");
        assert_eq!(opts.fuse_delay, Duration::from_millis(10));
        assert_eq!(opts.max_wait, Duration::from_secs(30));
        assert_eq!(opts.multi_max_texts, 16);
        assert_eq!(opts.multi_batch_wait, Duration::from_millis(5));
        assert!(opts.rps.is_none());
        assert!(!opts.multi);
        assert!(!opts.debug);
    }

    #[test]
    fn batch_defaults() {
        let opts = BatchOptions::default();
        assert_eq!(opts.flush_delay, Duration::from_millis(5));
        assert_eq!(opts.max_batch_size, 200);
        assert_eq!(opts.poll_every, Duration::from_millis(50));
        assert_eq!(opts.poll_timeout, Duration::from_secs(120));
    }
}
