//! Coordinator core for the out-of-process plugin runtime: the plugin
//! registry, instance and continuation tables, the begin/resume relay
//! protocol, and the two worker-execution backends.
//!
//! Lifecycle:
//! 1. Load config, pick a worker backend
//! 2. Scan the plugin dir into the registry
//! 3. Spawn the expiry sweeper
//! 4. Serve dispatch frames through the method registry
//!
//! The gateway core drives this crate through `methods::MethodRegistry`;
//! plugin code only ever sees the `Facade` handed to its phase handler.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod facade;
pub mod instances;
pub mod loader;
pub mod methods;
pub mod pool;
pub mod registry;
pub mod scripted;
pub mod state;
pub mod sweeper;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
