/// Shaper configuration
///
/// Read-only from the scheduler's point of view; the host may swap a new
/// config in at runtime via `PacketShaper::update_config`.
#[derive(Debug, Clone)]
pub struct ShaperConfig {
    /// Soft budget in bytes per second. While the minimum bucket is
    /// positive, no throttling is applied at all.
    pub min_bandwidth: u64,
    /// Hard budget in bytes per second, shared between bulk and base traffic.
    pub max_bandwidth: u64,
    /// Chunks closer than this (world units, horizontal) are sent
    /// immediately instead of being queued, to avoid visible pop-in.
    pub min_safe_distance: f64,
    /// Stop draining a connection once its free outbound buffer drops below
    /// this fraction of the high watermark.
    pub buffer_reserve_fraction: f64,
    /// Throttle bulk traffic while the connection's ping is degraded.
    pub throttle_when_ping_degrades: bool,
    /// Apply shaping to locally-connected clients as well.
    pub throttle_local_connections: bool,
    /// Apply shaping to asset/config bulk downloads.
    pub throttle_asset_downloads: bool,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            min_bandwidth: 64 * 1024,
            max_bandwidth: 16 * 1024 * 1024,
            min_safe_distance: 96.0,
            buffer_reserve_fraction: 0.2,
            throttle_when_ping_degrades: true,
            throttle_local_connections: false,
            throttle_asset_downloads: true,
        }
    }
}

/// Errors from configuration validation
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("min_bandwidth must be at least 1 byte/s")]
    ZeroMinBandwidth,
    #[error("max_bandwidth ({max}) must not be below min_bandwidth ({min})")]
    MaxBelowMin { min: u64, max: u64 },
    #[error("buffer_reserve_fraction must be in [0, 1), got {0}")]
    InvalidBufferReserve(f64),
    #[error("min_safe_distance must be non-negative, got {0}")]
    NegativeSafeDistance(f64),
}

impl ShaperConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(min) = std::env::var("SHAPER_MIN_BANDWIDTH") {
            if let Ok(parsed) = min.parse::<u64>() {
                config.min_bandwidth = parsed;
            } else {
                tracing::warn!("Invalid SHAPER_MIN_BANDWIDTH '{}', using default", min);
            }
        }

        if let Ok(max) = std::env::var("SHAPER_MAX_BANDWIDTH") {
            if let Ok(parsed) = max.parse::<u64>() {
                config.max_bandwidth = parsed;
            } else {
                tracing::warn!("Invalid SHAPER_MAX_BANDWIDTH '{}', using default", max);
            }
        }

        if let Ok(dist) = std::env::var("SHAPER_MIN_SAFE_DISTANCE") {
            if let Ok(parsed) = dist.parse::<f64>() {
                config.min_safe_distance = parsed;
            } else {
                tracing::warn!("Invalid SHAPER_MIN_SAFE_DISTANCE '{}', using default", dist);
            }
        }

        if let Ok(frac) = std::env::var("SHAPER_BUFFER_RESERVE") {
            if let Ok(parsed) = frac.parse::<f64>() {
                config.buffer_reserve_fraction = parsed;
            } else {
                tracing::warn!("Invalid SHAPER_BUFFER_RESERVE '{}', using default", frac);
            }
        }

        if let Ok(v) = std::env::var("SHAPER_THROTTLE_ON_PING") {
            config.throttle_when_ping_degrades = v != "0" && !v.eq_ignore_ascii_case("false");
        }

        if let Ok(v) = std::env::var("SHAPER_THROTTLE_LOCAL") {
            config.throttle_local_connections = v == "1" || v.eq_ignore_ascii_case("true");
        }

        if let Ok(v) = std::env::var("SHAPER_THROTTLE_ASSETS") {
            config.throttle_asset_downloads = v != "0" && !v.eq_ignore_ascii_case("false");
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_bandwidth == 0 {
            return Err(ConfigError::ZeroMinBandwidth);
        }
        if self.max_bandwidth < self.min_bandwidth {
            return Err(ConfigError::MaxBelowMin {
                min: self.min_bandwidth,
                max: self.max_bandwidth,
            });
        }
        if !(0.0..1.0).contains(&self.buffer_reserve_fraction) {
            return Err(ConfigError::InvalidBufferReserve(self.buffer_reserve_fraction));
        }
        if self.min_safe_distance < 0.0 {
            return Err(ConfigError::NegativeSafeDistance(self.min_safe_distance));
        }
        Ok(())
    }
}
