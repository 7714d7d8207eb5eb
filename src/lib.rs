pub mod chain;
pub mod client;
pub mod countdown;
pub mod deployment;
pub mod history;
pub mod rpc;
pub mod session;
pub mod sync;
pub mod ticket;
pub mod ui;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
