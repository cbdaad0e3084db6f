//! callsift: privacy-preserving, crash-safe LLM analysis of call transcripts.
//!
//! Sensitive values are swapped for opaque tokens before a transcript leaves
//! the process and restored in the structured result. Progress is committed
//! per call to a checkpoint that survives crashes, gateway calls are paced
//! against per-minute quotas, and every identifier in the final output is
//! audited against its source transcript.
//!
//! See `DESIGN.md` for the component map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod logging;

pub mod checkpoint;
pub mod scheduler;
pub mod vault;

pub mod gateway;
pub mod providers;

pub mod audit;
pub mod pipeline;
pub mod transcript;
