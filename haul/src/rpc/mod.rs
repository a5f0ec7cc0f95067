//! Host coordination: wire messages, the source-side proxy and the
//! target-side service.

pub mod messages;
pub mod proxy;
pub mod service;

pub use messages::{
    CompatProbe, ImageDirKind, ImagePayload, RpcRequest, RpcResponse, WorkloadDescriptor,
};
pub use proxy::{connect_tcp, HostCoordination, RemoteHost};
pub use service::TargetService;
