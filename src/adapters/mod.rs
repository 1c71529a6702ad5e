//! Adapters between the replication logic and the Kubernetes API

mod events;
mod memory;
mod secrets;
mod store;

pub use events::{actions, reasons, EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use memory::MemoryObjectStore;
pub use secrets::*;
pub use store::*;
