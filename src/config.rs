//! Peer configuration.

/// Knobs shared by the runtime and the peer facade.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Interface the listener binds to.
    pub bind_host: String,
    /// Listener port; 0 asks the OS for a free one.
    pub bind_port: u16,
    /// Capacity of the bounded channels between operators.
    pub channel_capacity: usize,
    /// Inactivity timeout for remote channels merged at receive ops.
    pub remote_timeout_ms: u64,
    /// Wall-clock budget for a top-level `query` call.
    pub query_timeout_ms: u64,
    /// Default hops-to-live stamped on new plans.
    pub default_htl: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_owned(),
            bind_port: 0,
            channel_capacity: 64,
            remote_timeout_ms: 5_000,
            query_timeout_ms: 30_000,
            default_htl: 8,
        }
    }
}

impl PeerConfig {
    /// Profile for peers discoverable on a local network.
    pub fn lan() -> Self {
        Self {
            bind_host: "0.0.0.0".to_owned(),
            ..Self::default()
        }
    }

    /// Profile with short timeouts, for tests.
    pub fn testing() -> Self {
        Self {
            channel_capacity: 16,
            remote_timeout_ms: 1_000,
            query_timeout_ms: 5_000,
            default_htl: 4,
            ..Self::default()
        }
    }
}
