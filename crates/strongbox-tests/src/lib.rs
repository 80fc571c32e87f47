//! Integration test suite for strongbox.
//!
//! The tests in `tests/` drive the wallet core end to end against an
//! in-memory chain ([`helpers::MockChain`]) and check selection invariants
//! with proptest.

pub mod helpers;
