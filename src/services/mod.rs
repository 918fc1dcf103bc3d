//! Upload protocol core: leases, storage backends, the state machine and
//! completion notifications.

pub mod disk_store;
pub mod locker;
pub mod memory_store;
pub mod notifier;
pub mod store;
pub mod upload_service;
