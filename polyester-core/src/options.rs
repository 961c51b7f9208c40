use serde::{Deserialize, Deserializer, Serialize};

use crate::Cid;
use crate::model::{ConflictResolution, PublicAccess};

pub const DEFAULT_ENTRY_BLOCK_SIZE: u32 = 16;
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 128;

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("entryBlockSize must be positive")]
    ZeroBlockSize,
    #[error("complexity {0} exceeds the 512 signature bits")]
    ComplexityTooHigh(u32),
    #[error("empty clock window [{lower}, {upper})")]
    EmptyClockWindow { lower: u64, upper: u64 },
    #[error("invalid options document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Local configuration of one collection.
///
/// When `address` is set the collection is opened and the manifest fields
/// (`public_access`, `entry_block_size`, `conflict_resolution`,
/// `complexity`) come from the stored manifest instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectionOptions {
    pub address: Option<Cid>,
    pub public_access: PublicAccess,
    pub entry_block_size: u32,
    /// Own entries added before the log is compacted. Zero, or any negative
    /// number in JSON, disables compaction.
    #[serde(deserialize_with = "zero_if_negative")]
    pub compact_threshold: u64,
    pub conflict_resolution: ConflictResolution,
    pub complexity: u32,
    pub lower_clock: u64,
    /// Exclusive upper bound of indexed clocks; `None` is unbounded. JSON
    /// documents may also write `-1`.
    #[serde(deserialize_with = "unbounded_if_negative")]
    pub upper_clock: Option<u64>,
}

fn zero_if_negative<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = i64::deserialize(deserializer)?;
    Ok(value.max(0) as u64)
}

fn unbounded_if_negative<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<i64>::deserialize(deserializer)?;
    Ok(value.filter(|v| *v >= 0).map(|v| v as u64))
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            address: None,
            public_access: PublicAccess::default(),
            entry_block_size: DEFAULT_ENTRY_BLOCK_SIZE,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            conflict_resolution: ConflictResolution::default(),
            complexity: 0,
            lower_clock: 0,
            upper_clock: None,
        }
    }
}

impl CollectionOptions {
    /// Parses options from a JSON document; absent fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, OptionsError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.entry_block_size == 0 {
            return Err(OptionsError::ZeroBlockSize);
        }
        if self.complexity > 512 {
            return Err(OptionsError::ComplexityTooHigh(self.complexity));
        }
        if let Some(upper) = self.upper_clock {
            if upper <= self.lower_clock {
                return Err(OptionsError::EmptyClockWindow {
                    lower: self.lower_clock,
                    upper,
                });
            }
        }
        Ok(())
    }

    pub fn address(mut self, address: Cid) -> Self {
        self.address = Some(address);
        self
    }

    pub fn public_access(mut self, access: PublicAccess) -> Self {
        self.public_access = access;
        self
    }

    pub fn entry_block_size(mut self, size: u32) -> Self {
        self.entry_block_size = size;
        self
    }

    pub fn compact_threshold(mut self, threshold: u64) -> Self {
        self.compact_threshold = threshold;
        self
    }

    pub fn conflict_resolution(mut self, policy: ConflictResolution) -> Self {
        self.conflict_resolution = policy;
        self
    }

    pub fn complexity(mut self, complexity: u32) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn clock_range(mut self, lower: u64, upper: Option<u64>) -> Self {
        self.lower_clock = lower;
        self.upper_clock = upper;
        self
    }
}
