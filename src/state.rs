use std::sync::Arc;

use crate::batch::LlmDispatcher;
use crate::client::{AnthropicBatchClient, AnthropicSingleClient, SingleCall};
use crate::config::{BatchOptions, FusedOptions, Mode};
use crate::error::Result;
use crate::fused::FusedDispatcher;

/// The one dispatch strategy chosen at process init; exactly one variant
/// exists for the process lifetime.
pub enum Dispatch {
    Single(Arc<dyn SingleCall>),
    Fused(Arc<FusedDispatcher>),
    Batch(Arc<LlmDispatcher>),
}

impl Dispatch {
    /// Reads `QUACK_LLM_MODE` and the mode's tunables; construction failures
    /// (missing credentials, unknown mode) are fatal to init.
    pub fn from_env() -> Result<Self> {
        Self::for_mode(Mode::from_env()?)
    }

    pub fn for_mode(mode: Mode) -> Result<Self> {
        match mode {
            Mode::Single => {
                let client = AnthropicSingleClient::from_env()?;
                Ok(Dispatch::Single(Arc::new(client)))
            }
            Mode::Fused => {
                let client = Arc::new(AnthropicSingleClient::from_env()?);
                Ok(Dispatch::Fused(FusedDispatcher::new(
                    client,
                    FusedOptions::from_env(),
                )))
            }
            Mode::Batch => {
                let client = Arc::new(AnthropicBatchClient::from_env()?);
                Ok(Dispatch::Batch(LlmDispatcher::new(
                    client,
                    BatchOptions::default(),
                )))
            }
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            Dispatch::Single(_) => Mode::Single,
            Dispatch::Fused(_) => Mode::Fused,
            Dispatch::Batch(_) => Mode::Batch,
        }
    }
}
