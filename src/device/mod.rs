// Device connection pooling and per-device failover.

pub mod failover;
pub mod pool;

pub use failover::{DeviceDescriptor, DeviceState, FailoverController, FailoverStats, SelectionStrategy};
pub use pool::{Command, CommandOptions, DeviceClient, DevicePool};
