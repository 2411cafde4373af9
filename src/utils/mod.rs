//! Shared runtime helpers: bootstrap, retry policies, shutdown signalling.

pub mod bootstrap;
pub mod retry;
pub mod shutdown;
