//! Testing utilities for rustapi-treblle
//!
//! # Mock Collector
//!
//! [`MockCollector`] stands in for the Treblle ingestion endpoint in
//! integration tests. It records every payload and can be told to fail or
//! to stop answering.

pub mod collector;

pub use collector::{Behavior, MockCollector, ReceivedPayload};
