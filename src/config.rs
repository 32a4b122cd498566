/// Tunables for the signed transport.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Presence republish interval (ms).
    pub heartbeat_interval_ms: i64,
    /// Packets older than this, and peers silent longer than this, are dropped (ms).
    pub peer_timeout_ms: i64,
    /// Seen-set size that triggers a trim on the heartbeat tick.
    pub seen_trim_threshold: usize,
    /// Entries retained by a trim, most recent first.
    pub seen_trim_keep: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            peer_timeout_ms: 5 * 60_000,
            seen_trim_threshold: 1_000,
            seen_trim_keep: 500,
        }
    }
}

/// Tunables for the encrypted overlay.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Interval between seen-id trims (ms).
    pub trim_interval_ms: i64,
    /// Seen-id set size that triggers a trim.
    pub trim_threshold: usize,
    /// Ids retained by a trim, most recent first.
    pub trim_keep: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            trim_interval_ms: 5 * 60_000,
            trim_threshold: 1_000,
            trim_keep: 500,
        }
    }
}

/// Tunables for the file-transfer engine.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Chunk size in base64 characters (~7.5 KB of raw bytes at the default).
    pub chunk_size: usize,
    /// Pacing between successive chunk writes (ms). The graph store is
    /// gossip-replicated; bursts overwhelm it. Must not go below 5.
    pub chunk_delay_ms: i64,
    /// How long the sender cache retains a completed upload (ms).
    pub cache_ttl_ms: i64,
    /// Interval between sender-cache eviction passes (ms).
    pub cache_sweep_interval_ms: i64,
    /// Maximum sweep passes per inbound transfer.
    pub max_sweeps: u32,
    /// Delay between sweep passes (ms).
    pub sweep_delay_ms: i64,
    /// Delay before the first sweep after the chunk count is reached (ms).
    pub recheck_delay_ms: i64,
    /// Floor of the inbound transfer timeout (ms).
    pub min_receive_timeout_ms: i64,
}

impl TransferConfig {
    /// Inbound timeout for a transfer of `total_chunks` chunks:
    /// `max(floor, 3 × total_chunks × chunk_delay)`.
    pub fn receive_timeout_ms(&self, total_chunks: usize) -> i64 {
        self.min_receive_timeout_ms
            .max(3 * total_chunks as i64 * self.chunk_delay_ms)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            chunk_delay_ms: 5,
            cache_ttl_ms: 5 * 60_000,
            cache_sweep_interval_ms: 60_000,
            max_sweeps: 5,
            sweep_delay_ms: 2_000,
            recheck_delay_ms: 1_000,
            min_receive_timeout_ms: 15_000,
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub channel: ChannelConfig,
    pub overlay: OverlayConfig,
    pub transfer: TransferConfig,
    /// Route the unified messaging surface through the encrypted overlay.
    pub encrypted: bool,
}
