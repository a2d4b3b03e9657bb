//! In-process service registry and dependency manager.
//!
//! Services are published into a [`registry::ServiceRegistry`] with
//! [`properties::Properties`], selected with LDAP-style [`filter::Filter`]s
//! and followed with [`tracker::ServiceTracker`]s. The
//! [`dm::DependencyManager`] wires components to the services they depend on
//! and drives their lifecycle while services come and go. Every registry
//! mutation and every component transition runs on the single thread of an
//! [`executor::EventExecutor`], so all observers see them in one order.

pub mod config;
pub mod dm;
pub mod error;
pub mod event;
pub mod executor;
pub mod filter;
pub mod framework;
pub mod properties;
pub mod registry;
pub mod tracker;
pub mod version;

// Re-exports
pub use error::*;
