// tests/property_test.rs

//! Property-based tests for Tidegate
//!
//! These tests check invariants of the resilience primitives that must hold
//! for any sequence of inputs.

mod property {
    pub mod breaker_test;
    pub mod queue_test;
    pub mod sampler_test;
}
