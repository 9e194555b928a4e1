//! Shared test utilities for csv-migrator integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs against a temp database and an in-memory sink
//! - CSV fixture writers

pub mod harness;

pub use harness::{doc_id, write_people_csv, TestHarness, COLLECTION};
