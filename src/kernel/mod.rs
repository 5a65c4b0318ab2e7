//! Kairo kernel - local process and service substrate
//!
//! A single daemon that:
//! - Spawns and controls child processes on behalf of connected clients
//! - Streams their stdio to subscribers with bounded buffering
//! - Bridges the event bus to topic subscribers
//! - Orchestrates long-running services (dependency order, health, restart)
//!
//! # Architecture
//!
//! Clients speak a small binary protocol (MessagePack bodies in 8-byte
//! headed frames) over a Unix domain socket.
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                  kairo kernel                  │
//! ├────────────────────────────────────────────────┤
//! │  KernelServer (socket, dispatch, permissions)  │
//! ├───────────────┬───────────────┬────────────────┤
//! │ StreamSubs    │ TopicSubs     │ ServiceManager │
//! │ (stdio fan)   │ (bus bridge)  │ (deps, health) │
//! ├───────────────┴───────────────┴────────────────┤
//! │        ProcessManager  +  ProcessStore         │
//! └────────────────────────────────────────────────┘
//! ```

pub mod bus;
#[cfg(unix)]
pub mod client;
pub mod connection;
pub mod devices;
pub mod fanout;
pub mod health;
pub mod metrics;
pub mod process;
pub mod protocol;
pub mod ring_buffer;
pub mod sandbox;
#[cfg(unix)]
pub mod server;
pub mod services;
pub mod store;
pub mod stream_subscription;
pub mod topic;
pub mod vault;

pub use bus::{EventBus, InMemoryBus, KernelEvent};
#[cfg(unix)]
pub use client::{Inbound, KernelClient};
pub use connection::{ConnectionHandle, ConnectionIdentity};
pub use devices::{DeviceInfo, DeviceRegistry, MemoryDeviceRegistry};
pub use health::{HealthCheckConfig, HealthStatus};
pub use process::{ProcessEvent, ProcessManager, ProcessOptions, ProcessStatus};
pub use protocol::{FrameBuffer, Packet, PacketKind};
pub use sandbox::{ResourceLimits, SandboxPolicy, SandboxWrapper, UlimitWrapper};
#[cfg(unix)]
pub use server::{KernelServer, KernelServerBuilder};
pub use services::{RestartPolicy, ServiceDefinition, ServiceEvent, ServiceManager, ServiceState, ServiceStatus};
pub use store::{FileProcessStore, MemoryProcessStore, ProcessStore};
pub use stream_subscription::{StreamMode, StreamSelector, StreamSubscriptionManager};
pub use topic::{TopicPattern, TopicSubscriptionManager};
pub use vault::{MemoryVault, Vault};
