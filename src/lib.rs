//! Request-coalescing dispatch for an `ai_llm(text, prompt)` scalar
//! function over columnar data.
//!
//! The upstream LLM service is latency-dominated, so the work here is
//! scheduling: fuse prompts per text ([`fused`]), batch deduplicated jobs
//! across rows ([`batch`]), or fan out one call per row ([`worker`]).
//! [`chunk`] routes vectorized chunks through whichever strategy
//! [`state::Dispatch`] selected at init, and [`udf`] exposes the whole
//! thing to DataFusion.

pub mod batch;
pub mod chunk;
pub mod client;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod fused;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod retry;
pub mod state;
pub mod udf;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;
