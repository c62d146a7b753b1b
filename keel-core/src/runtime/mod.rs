//! Task lifecycle helpers

pub mod shutdown;

pub use shutdown::ShutdownSignal;
