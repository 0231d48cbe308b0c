//! Kairos - Adaptive LLM Batch Orchestration
//!
//! This crate dispatches prompt workloads against a remote chat-completion
//! API while staying under a provider tokens-per-minute (TPM) budget:
//! - Limiter: sliding-window TPM accounting with a self-tuning concurrency gate
//! - Orchestrator: single and batch processing with retries and progress logging
//! - Stats: global and per-batch counters, cost, latency, and concurrency peaks
//! - Config: models catalog with per-1k-token pricing and capability flags
//! - Client: the `ChatClient` capability trait plus an OpenAI-compatible
//!   `reqwest` implementation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod limiter;
pub mod message;
pub mod openai_compat;
pub mod orchestrator;
pub mod outcome;
pub mod retry;
pub mod stats;
pub mod util;

pub use client::{ChatClient, ChatRequest, ChatResponse, PromptTokensDetails, ResponseFormat, TokenUsage};
pub use config::{ModelCatalog, ModelConfig};
pub use error::{Error, Result};
pub use limiter::{AdaptiveRateLimiter, LimiterConfig, LimiterEvent, RatePermit};
pub use message::{Message, MessageRole};
pub use openai_compat::{OpenAiCompatClient, OpenAiCompatConfig};
pub use orchestrator::{BatchOutput, Orchestrator, OrchestratorConfig, ProgressTracker};
pub use outcome::{ErrorDetails, RequestOutcome};
pub use retry::{RetryExhausted, RetryPolicy};
pub use stats::{StatsContainer, StatsManager};
