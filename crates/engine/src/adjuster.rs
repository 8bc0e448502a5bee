//! Adaptive chunk sizing from observed per-chunk upload times.
//!
//! The adjuster steers toward a target upload time per chunk: fast
//! chunks double the next size, slow chunks halve it, anything near
//! the target leaves it alone. The negotiated plan of a running task
//! never changes; the adjusted size feeds the *next* task's preferred
//! chunk size.

use chunklift_protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_TARGET_TIME_MS, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};

use crate::error::EngineError;

/// Configuration for [`ChunkSizeAdjuster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjusterConfig {
    pub initial_size: u64,
    pub min_size: u64,
    pub max_size: u64,
    pub target_time_ms: u64,
}

impl Default for AdjusterConfig {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_CHUNK_SIZE,
            min_size: MIN_CHUNK_SIZE,
            max_size: MAX_CHUNK_SIZE,
            target_time_ms: DEFAULT_TARGET_TIME_MS,
        }
    }
}

/// Stateful feedback controller for chunk sizes. One per task; not
/// shared.
#[derive(Debug, Clone)]
pub struct ChunkSizeAdjuster {
    config: AdjusterConfig,
    current: u64,
}

impl ChunkSizeAdjuster {
    /// Validates the configuration and seeds the current size.
    pub fn new(config: AdjusterConfig) -> Result<Self, EngineError> {
        if config.min_size > config.max_size {
            return Err(EngineError::InvalidArgument(format!(
                "minSize {} exceeds maxSize {}",
                config.min_size, config.max_size
            )));
        }
        if config.initial_size < config.min_size || config.initial_size > config.max_size {
            return Err(EngineError::InvalidArgument(format!(
                "initialSize {} outside [{}, {}]",
                config.initial_size, config.min_size, config.max_size
            )));
        }
        if config.target_time_ms == 0 {
            return Err(EngineError::InvalidArgument(
                "targetTime must be positive".into(),
            ));
        }
        Ok(Self {
            current: config.initial_size,
            config,
        })
    }

    /// Feeds back one observed upload time and returns the next size.
    pub fn adjust(&mut self, upload_time_ms: u64) -> u64 {
        let target = self.config.target_time_ms;
        if upload_time_ms * 2 < target {
            self.current = (self.current * 2).min(self.config.max_size);
        } else if upload_time_ms * 2 > target * 3 {
            self.current = (self.current / 2).max(self.config.min_size);
        }
        self.current
    }

    pub fn current_size(&self) -> u64 {
        self.current
    }

    /// Restores the configured initial size.
    pub fn reset(&mut self) {
        self.current = self.config.initial_size;
    }

    pub fn config(&self) -> &AdjusterConfig {
        &self.config
    }
}

/// Picks a starting chunk size proportional to the file, clamped to
/// the protocol bounds. Small files keep the default; very large
/// files start bigger so the plan stays at a manageable chunk count.
pub fn recommended_initial_size(file_size: u64) -> u64 {
    let size = match file_size {
        0..=104_857_600 => DEFAULT_CHUNK_SIZE,            // <= 100 MiB
        104_857_601..=1_073_741_824 => 4 * 1024 * 1024,   // <= 1 GiB
        _ => MAX_CHUNK_SIZE,
    };
    size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

// ---------------------------------------------------------------------------
// TCP-style variant
// ---------------------------------------------------------------------------

/// Phase of the TCP-style controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionPhase {
    /// Exponential growth up to the slow-start threshold.
    SlowStart,
    /// Additive growth above the threshold.
    CongestionAvoidance,
    /// One recovery round after a slow chunk.
    FastRecovery,
}

/// Chunk sizing with TCP-flavored dynamics: exponential growth while
/// below a slow-start threshold, additive growth above it, and a
/// multiplicative cut that re-arms the threshold when a chunk comes in
/// slow. Compared to [`ChunkSizeAdjuster`] this converges less
/// aggressively after the first slowdown.
#[derive(Debug, Clone)]
pub struct TcpChunkAdjuster {
    config: AdjusterConfig,
    current: u64,
    ssthresh: u64,
    phase: CongestionPhase,
}

impl TcpChunkAdjuster {
    pub fn new(config: AdjusterConfig) -> Result<Self, EngineError> {
        // Same construction contract as the plain adjuster.
        let _ = ChunkSizeAdjuster::new(config)?;
        Ok(Self {
            current: config.initial_size,
            ssthresh: config.max_size,
            phase: CongestionPhase::SlowStart,
            config,
        })
    }

    /// Feeds back one observed upload time and returns the next size.
    pub fn adjust(&mut self, upload_time_ms: u64) -> u64 {
        let target = self.config.target_time_ms;
        if upload_time_ms * 2 > target * 3 {
            // Slow chunk: halve the threshold, drop to it, recover.
            self.ssthresh = (self.current / 2).max(self.config.min_size);
            self.current = self.ssthresh;
            self.phase = CongestionPhase::FastRecovery;
            return self.current;
        }

        if upload_time_ms * 2 < target {
            self.current = match self.phase {
                CongestionPhase::SlowStart if self.current < self.ssthresh => {
                    (self.current * 2).min(self.ssthresh)
                }
                CongestionPhase::FastRecovery => {
                    self.phase = CongestionPhase::CongestionAvoidance;
                    self.current + self.config.min_size
                }
                _ => {
                    self.phase = CongestionPhase::CongestionAvoidance;
                    self.current + self.config.min_size
                }
            }
            .min(self.config.max_size);
        }
        if self.phase == CongestionPhase::SlowStart && self.current >= self.ssthresh {
            self.phase = CongestionPhase::CongestionAvoidance;
        }
        self.current
    }

    pub fn current_size(&self) -> u64 {
        self.current
    }

    pub fn phase(&self) -> CongestionPhase {
        self.phase
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_size;
        self.ssthresh = self.config.max_size;
        self.phase = CongestionPhase::SlowStart;
    }
}
