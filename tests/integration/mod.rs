//! Integration test suite for washmap.
//!
//! These tests drive campaigns end to end through `CampaignService`: map
//! building, planning, the balance gate, concurrent dispatch and recovery.
//!
//! # Test Categories
//!
//! - `distribution_e2e`: Full distribution and collection runs
//! - `parallel_branches`: Concurrency limits and branch isolation
//! - `recovery`: Pause/resume, retries, timeouts and restarts
//!
//! # CI Compatibility
//!
//! Transfers go to a scripted client; no chain or network is involved.

mod fixtures;

mod distribution_e2e;
mod parallel_branches;
mod recovery;
