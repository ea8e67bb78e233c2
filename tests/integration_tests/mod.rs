//! Integration tests module
//!
//! End-to-end tests for the dispatch subsystem, including:
//! - Dispatch cycles across registry, balancer and ledger
//! - Offline sweeps, execution deadlines and retry exhaustion
//! - Worker execution against a live master runtime
//! - The master HTTP API driven through the worker client

pub mod api_test;
pub mod dispatch_test;
pub mod failover_test;
pub mod worker_test;
