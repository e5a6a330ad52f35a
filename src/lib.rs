//! Party session coordination engine
//!
//! Keeps a small group of peers in agreement on a shared match: a
//! token-ordered distributed pause, an authority-anchored match clock,
//! bounded fixed-step scheduling, entity snapshot reconciliation and
//! batched interaction reporting.

pub mod config;
pub mod net;
pub mod session;
pub mod util;
