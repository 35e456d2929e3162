/// Testing utilities for cycle consensus
///
/// Provides:
/// - Seeded data generators
/// - Time fixtures for paused-clock cycle tests
/// - Proptest strategies for seeds and delivery orders

pub mod fixtures;
pub mod generators;
pub mod strategies;

pub use fixtures::*;
pub use generators::*;
