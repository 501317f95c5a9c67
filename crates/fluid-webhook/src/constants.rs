//! Contains various constant definitions, mostly for default ports, addresses
//! and the HTTP paths of the admission handlers.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// The default HTTPS port `8443`
pub const DEFAULT_HTTPS_PORT: u16 = 8443;

/// The default IP address [`Ipv4Addr::UNSPECIFIED`] (`0.0.0.0`) the webhook server binds to,
/// which represents binding on all network addresses.
pub const DEFAULT_LISTEN_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// The default socket address `0.0.0.0:8443` the webhook server binds to.
pub const DEFAULT_SOCKET_ADDRESS: SocketAddr =
    SocketAddr::new(DEFAULT_LISTEN_ADDRESS, DEFAULT_HTTPS_PORT);

/// The default directory the PEM files of the serving certificate are written to.
pub const DEFAULT_CERT_DIR: &str = "/etc/k8s-webhook-server/certs";

/// Path of the fuse sidecar injection handler.
pub const FUSE_HANDLER_PATH: &str = "/mutate-fluid-io-v1alpha1-fuse";

/// Path of the node affinity handler.
pub const NODE_AFFINITY_HANDLER_PATH: &str = "/mutate-fluid-io-v1alpha1-schedulepod";

/// Path of the liveness endpoint, served next to the admission handlers.
pub const HEALTH_PATH: &str = "/health";
