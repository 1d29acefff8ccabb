//! Floodgate - In-Process Rate Limiting for Messaging Bots
//!
//! This crate keeps a bot's outbound calls under the messaging platform's
//! flood-control thresholds. Each operation category (sending, editing,
//! answering callbacks) gets its own sliding window; callers that would
//! exceed it are suspended until a slot frees up. A separate per-user
//! cooldown suppresses duplicate rapid replies, and per-client budgets cap
//! how often one user may hit the bot at all.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod simulate;
