//! Dependency graph of services, started and stopped in order.
//!
//! Services are registered with a [`ServiceGraphBuilder`] along with two kinds
//! of relationships:
//!
//! - a **dependency**: the dependent starts after the service it depends on
//!   is running, and stops before it
//! - an **enhancement**: an auxiliary service that starts right after its
//!   target and stops right before it; everything depending on the target
//!   also waits for the enhancement
//!
//! [`ServiceGraphBuilder::build`] checks the graph is a DAG and returns a
//! [`ServiceManager`]. Starting and stopping then proceeds purely from
//! service state changes: each node starts its service once everything
//! upstream runs, and stops it once everything downstream has terminated.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod builder;
mod config;
mod error;
mod key;
mod lazy;
mod link;
mod manager;
mod metadata;
mod node;

pub use builder::ServiceGraphBuilder;
pub use config::{FailurePolicy, ServiceManagerConfig};
pub use error::{Error, Result};
pub use key::ServiceKey;
pub use manager::{NodeHandle, ServiceManager};
pub use metadata::{GraphMetadata, NodeMetadata};
pub use node::NodeEvent;
