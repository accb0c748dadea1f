pub mod api;
pub mod config;
pub mod echo;
pub mod kernel;
pub mod netns;
pub mod proxy;
pub mod segment;
pub mod tunnel;

// Re-export key types for easier access by consumers
pub use api::{ApiServer, Daemon};
pub use config::Options;
pub use kernel::{IpCommandKernel, KernelNet, MemoryKernel};
pub use netns::{ContainerRuntime, DockerRuntime, NsHandle};
pub use proxy::{EndpointResolver, Proxier, ProxierFactory, StreamProxierFactory};
pub use segment::{ConnectionInfo, SegmentManager};
pub use tunnel::TunnelManager;
