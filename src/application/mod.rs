//! Application layer containing the business logic orchestration.
//!
//! `WalletService` owns every balance mutation, `OrderService` drives the
//! master order and sub-order state machines on top of it, and
//! `ReconciliationScheduler` advances the time-based transitions and settles
//! gateway outcomes without a human trigger.

pub mod orders;
pub mod scheduler;
pub mod wallet;
