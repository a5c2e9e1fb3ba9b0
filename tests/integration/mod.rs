//! Integration test suite for conductor.
//!
//! These tests drive the execution manager, queue, task lifecycle manager,
//! health tracker and workflow engine together through their public API.
//!
//! # Test Categories
//!
//! - `execution_lifecycle`: start, capacity, timeout, kill and cleanup
//! - `queue_admission`: priority ordering and slot accounting
//! - `workflow_e2e`: full backlog runs, dependencies and retries
//! - `recovery`: zombie detection, auto-cleanup and failed kills
//!
//! # CI Compatibility
//!
//! Worker processes are played back by `MockSpawner`, so no worker binary is
//! needed and nothing leaves the machine.

mod fixtures;

mod execution_lifecycle;
mod queue_admission;
mod recovery;
mod workflow_e2e;
