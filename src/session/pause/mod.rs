//! Distributed pause protocol

pub mod coordinator;
pub mod token_store;

pub use coordinator::{PauseCoordinator, PauseOutcome, PauseStats, PauseTransition};
pub use token_store::{AliasMap, PauseTokenEntry, PauseTokenStore, TokenMinter};
