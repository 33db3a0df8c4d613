//! Domain entities, value objects and the ports the application layer talks to.

pub mod gateway;
pub mod ledger;
pub mod money;
pub mod order;
pub mod ports;
pub mod user;
