//! Configuration for channels and messaging adapters.
//!
//! This module provides the tuning knobs shared by outbound channels
//! and adapter-owned back-channels.

/// Default upper bound on a single frame's payload (default: 64 MiB).
///
/// A length prefix above this bound is treated as a framing error
/// rather than an allocation request.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Configuration for a channel or adapter.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Maximum accepted payload length in bytes (default: 64 MiB).
    pub max_frame_size: usize,

    /// Whether to set TCP_NODELAY on new sockets (default: true).
    pub nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Creates a new configuration with default values.
    pub const fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            nodelay: true,
        }
    }

    /// Sets the maximum accepted payload length.
    pub const fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Sets whether TCP_NODELAY is applied to new sockets.
    pub const fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}
