// src/engine/firewall.rs
//
// Upload firewall configuration and enforcement helpers.
// Runs before decode (byte length, embedded metadata) and right after
// probing (pixel count), so oversized uploads never reach a codec.

use crate::engine::io::extract_icc_profile;
use crate::error::CompressError;

const STRICT_MAX_PIXELS: u64 = 40_000_000; // ~8K x 5K
const LENIENT_MAX_PIXELS: u64 = 75_000_000; // generous but below global MAX_PIXELS
const STRICT_MAX_INPUT_BYTES: u64 = 32 * 1024 * 1024; // 32MB input cap
const LENIENT_MAX_INPUT_BYTES: u64 = 200 * 1024 * 1024; // large-format TIFF scans
const STRICT_ICC_LIMIT: u64 = 64 * 1024;
const LENIENT_ICC_LIMIT: u64 = 512 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirewallPolicy {
    Disabled,
    Strict,
    Lenient,
    Custom,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallConfig {
    pub enabled: bool,
    pub policy: FirewallPolicy,
    pub max_pixels: Option<u64>,
    pub max_input_bytes: Option<u64>,
    pub max_icc_bytes: Option<u64>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: FirewallPolicy::Disabled,
            max_pixels: None,
            max_input_bytes: None,
            max_icc_bytes: None,
        }
    }
}

impl FirewallConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            enabled: true,
            policy: FirewallPolicy::Strict,
            max_pixels: Some(STRICT_MAX_PIXELS),
            max_input_bytes: Some(STRICT_MAX_INPUT_BYTES),
            max_icc_bytes: Some(STRICT_ICC_LIMIT),
        }
    }

    pub fn lenient() -> Self {
        Self {
            enabled: true,
            policy: FirewallPolicy::Lenient,
            max_pixels: Some(LENIENT_MAX_PIXELS),
            max_input_bytes: Some(LENIENT_MAX_INPUT_BYTES),
            max_icc_bytes: Some(LENIENT_ICC_LIMIT),
        }
    }

    /// Enabled with no limits; set the fields you need.
    pub fn custom() -> Self {
        Self {
            enabled: true,
            policy: FirewallPolicy::Custom,
            ..Self::default()
        }
    }

    pub fn apply_policy(policy: FirewallPolicy) -> Self {
        match policy {
            FirewallPolicy::Disabled => Self::disabled(),
            FirewallPolicy::Strict => Self::strict(),
            FirewallPolicy::Lenient => Self::lenient(),
            FirewallPolicy::Custom => Self::custom(),
        }
    }

    pub fn with_max_pixels(mut self, limit: u64) -> Self {
        self.max_pixels = Some(limit);
        self
    }

    pub fn with_max_input_bytes(mut self, limit: u64) -> Self {
        self.max_input_bytes = Some(limit);
        self
    }

    pub fn enforce_source_len(&self, len: usize) -> Result<(), CompressError> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(limit) = self.max_input_bytes {
            let len_u64 = len as u64;
            if len_u64 > limit {
                return Err(CompressError::firewall_violation(format!(
                    "input size {len_u64} bytes exceeds limit of {limit} bytes \
                     ({:?} policy)",
                    self.policy
                )));
            }
        }
        Ok(())
    }

    pub fn enforce_pixels(&self, width: u32, height: u32) -> Result<(), CompressError> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(limit) = self.max_pixels {
            let pixels = width as u64 * height as u64;
            if pixels > limit {
                return Err(CompressError::firewall_violation(format!(
                    "{width}x{height} ({pixels} pixels) exceeds limit of {limit} pixels \
                     ({:?} policy)",
                    self.policy
                )));
            }
        }
        Ok(())
    }

    /// Reject oversized embedded ICC profiles. A valid profile is a few KB;
    /// anything near the limit is malformed or hostile.
    pub fn scan_metadata(&self, data: &[u8]) -> Result<(), CompressError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(limit) = self.max_icc_bytes else {
            return Ok(());
        };
        let Some(icc) = extract_icc_profile(data) else {
            return Ok(());
        };
        let icc_len = icc.len() as u64;
        if icc_len > limit {
            return Err(CompressError::firewall_violation(format!(
                "ICC profile ({icc_len} bytes) exceeds limit of {limit} bytes"
            )));
        }
        Ok(())
    }
}
