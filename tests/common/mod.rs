//! Common test utilities for pipeline integration tests
//!
//! This module provides store fixtures, scripted processors, and checkers
//! for the chain invariants every run must preserve.

#![allow(dead_code)]

pub mod fixtures;
pub mod invariants;

pub use fixtures::{news_item, seeded_source, temp_store, FlakyProcessor, TempStore};
pub use invariants::{assert_chain_invariants, rows};
