//! Integration tests for the probe loop against real timers.

mod common;
mod probe_test;
