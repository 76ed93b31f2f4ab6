use std::time::Duration;

use thiserror::Error;

use crate::error::GpuError;
use crate::events::MAX_EVENTS;
use crate::ring::min_ring_words;

/// Upper bound of the frequency scale; the core clock is divided by `1 << scale`.
pub const MAX_FREQ_SCALE: u32 = 6;

/// Tunables for one [`crate::GpuCore`] instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuCoreConfig {
    /// Number of hardware event slots to manage (at most [`MAX_EVENTS`]).
    pub event_slots: usize,
    /// Bound on the wait for each individual slot during `submit`.
    pub event_timeout: Duration,
    /// Wall-clock budget of one reset attempt, measured from entry.
    pub reset_timeout: Duration,
    /// Hold time of the reset pulse.
    pub reset_pulse_delay: Duration,
    /// Use the AHB reset line instead of the soft-reset bit.
    pub secure_mode: bool,
    /// Initial frequency scale, `0..=MAX_FREQ_SCALE`.
    pub freq_scale: u32,
    /// Size of the front-end ring in 32-bit words.
    pub ring_words: usize,
    /// GPU address of the ring buffer.
    pub ring_gpu_addr: u32,
    /// Period of the hang-check watchdog; `None` disables the thread.
    pub hangcheck_period: Option<Duration>,
}

impl Default for GpuCoreConfig {
    fn default() -> Self {
        Self {
            event_slots: MAX_EVENTS,
            event_timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(1),
            reset_pulse_delay: Duration::from_micros(20),
            secure_mode: false,
            freq_scale: 0,
            ring_words: 4096,
            ring_gpu_addr: 0x4000_0000,
            hangcheck_period: None,
        }
    }
}

impl GpuCoreConfig {
    /// Builds a configuration from `VIVGPU_*` environment variables, falling
    /// back to [`Default`] for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] but with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = parse_var::<usize>(&lookup, "VIVGPU_EVENT_SLOTS")? {
            cfg.event_slots = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "VIVGPU_EVENT_TIMEOUT_MS")? {
            cfg.event_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "VIVGPU_RESET_TIMEOUT_MS")? {
            cfg.reset_timeout = Duration::from_millis(v);
        }
        if let Some(raw) = lookup("VIVGPU_SECURE_MODE") {
            cfg.secure_mode = match raw.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => return Err(ConfigError::InvalidEnv("VIVGPU_SECURE_MODE")),
            };
        }
        if let Some(v) = parse_var::<u32>(&lookup, "VIVGPU_FREQ_SCALE")? {
            cfg.freq_scale = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "VIVGPU_HANGCHECK_MS")? {
            cfg.hangcheck_period = (v != 0).then(|| Duration::from_millis(v));
        }
        if let Some(v) = parse_var::<usize>(&lookup, "VIVGPU_RING_SIZE")? {
            cfg.ring_words = v;
        }

        cfg.validate().map_err(|err| match err {
            GpuError::InvalidConfig(name) => ConfigError::OutOfRange(name),
            _ => ConfigError::OutOfRange("config"),
        })?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), GpuError> {
        if self.event_slots == 0 || self.event_slots > MAX_EVENTS {
            return Err(GpuError::InvalidConfig("event_slots"));
        }
        if self.event_timeout.is_zero() {
            return Err(GpuError::InvalidConfig("event_timeout"));
        }
        if self.reset_timeout.is_zero() {
            return Err(GpuError::InvalidConfig("reset_timeout"));
        }
        if self.freq_scale > MAX_FREQ_SCALE {
            return Err(GpuError::InvalidConfig("freq_scale"));
        }
        if self.ring_words < min_ring_words(self.event_slots) {
            return Err(GpuError::InvalidConfig("ring_words"));
        }
        if self.ring_gpu_addr % 8 != 0 {
            return Err(GpuError::InvalidConfig("ring_gpu_addr"));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv(key)),
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
    #[error("config value out of range: {0}")]
    OutOfRange(&'static str),
}
