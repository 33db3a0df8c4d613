//! Adapters for the domain ports: transactional stores, the clock and the
//! sandbox payment gateway.

pub mod clock;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod sandbox_gateway;
mod staging;
