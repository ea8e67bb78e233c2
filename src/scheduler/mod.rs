//! Task scheduling: placement, dispatch, assignment bookkeeping and the
//! master loops that drive them
//!
//! # Overview
//!
//! Tasks are submitted as `pending` and claimed by a periodic dispatch cycle.
//! Each claim is one atomic store operation that binds the task to a device,
//! opens an assignment and increments the device load counter. Workers pull
//! their assigned tasks and report outcomes through a completion channel
//! consumed by a single reconciliation loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        MasterRuntime                         │
//! │  dispatch ─┐   timeout ─┐   offline ─┐   reports (mpsc) ─┐   │
//! └────────────┼────────────┼────────────┼───────────────────┼───┘
//!              ▼            ▼            ▼                   ▼
//!        ┌───────────────────────────────────────────────────────┐
//!        │                    TaskDispatcher                     │
//!        │  LoadBalancer::select ──▶ DispatchStore::claim        │
//!        │  RetryPolicy::resolve ──▶ DispatchStore::close        │
//!        └──────────────────────────┬────────────────────────────┘
//!                                   ▼
//!                          AssignmentLedger
//!             (history, success rates, load reconciliation)
//! ```
//!
//! # Modules
//!
//! - [`backoff`] - retry law and exponential backoff
//! - [`balancer`] - device selection strategies
//! - [`dispatcher`] - submission, dispatch cycle, reports and sweeps
//! - [`ledger`] - assignment history queries and counter reconciliation
//! - [`runtime`] - periodic loops and the report reconciliation loop

pub mod backoff;
pub mod balancer;
pub mod dispatcher;
pub mod ledger;
pub mod runtime;

// Re-export main types
pub use backoff::RetryPolicy;
pub use balancer::{LoadBalanceStrategy, LoadBalancer};
pub use dispatcher::{
    DispatchReport, DispatchStats, DispatcherSettings, RebalanceReport, ReportOutcome, ReportQueue,
    ReportStatus, StatusReport, SubmitTask, SweepReport, TaskDispatcher, TaskMove,
};
pub use ledger::AssignmentLedger;
pub use runtime::{LoopIntervals, MasterRuntime, RuntimeHandle};
