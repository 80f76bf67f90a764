//! Target memory hierarchy and device limits.
//!
//! This crate answers the questions the optimizer asks about the machine it
//! is compiling for:
//!
//! - which memory scopes exist ([`MemScope`]),
//! - how large each on-chip buffer is ([`MemoryInfo`], queried by scope),
//! - how many threads and blocks a GPU launch may use ([`GpuInfo`]).
//!
//! # Memory Table
//!
//! | Tag | unit bits | max SIMD bits | capacity bits |
//! |-----|-----------|---------------|---------------|
//! | `local.L1` | 4096 | 4096 | L1 buffer bytes × 8 |
//! | `local.UB` | 256 | 256 | unified buffer bytes × 8 |
//! | `local.L0A/B/C` | 4096 | 4096 | L0 buffer bytes × 8 |
//! | `local.REG` | 16 | 64 | 64 × 3200 |
//! | `local_aicpu` | 16 | 64 | 16 Mi |
//! | `L1_tmp` | 4096 | 4096 | 1 Gi |
//!
//! GPU shared memory comes from `AKG_SHARED_MEM` (bytes) bounded by the
//! device maximum; register memory is fixed per device.
//!
//! # Process-wide Instance
//!
//! [`global`] reads the environment once and caches the result for the
//! lifetime of the process. Tests build their own [`TargetInfo`] through
//! [`TargetInfo::from_env`] with an injected lookup.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

/// Errors raised while reading target configuration.
#[derive(Debug, Error)]
pub enum TargetError {
    /// The device type has no memory table.
    #[error("invalid query for memory on {0}")]
    UnknownDevice(String),

    /// Configured shared memory exceeds the device maximum.
    #[error("invalid config for memory on {device}: max {max} vs {requested}")]
    SharedMemOverMax {
        /// Device type.
        device: String,
        /// Device maximum in bytes.
        max: u64,
        /// Requested bytes.
        requested: u64,
    },

    /// An environment value is not a valid integer.
    #[error("invalid value `{value}` for {key}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending text.
        value: String,
    },
}

/// Result alias for target queries.
pub type TargetResult<T> = Result<T, TargetError>;

/// Environment variable selecting the GPU device type.
pub const DEVICE_TYPE_ENV: &str = "AKG_DEVICE_TYPE";
/// Environment variable overriding GPU shared memory per block, in bytes.
pub const SHARED_MEM_ENV: &str = "AKG_SHARED_MEM";
/// Device type assumed when none is configured.
pub const DEFAULT_DEVICE: &str = "v100";

// ============================================================================
// Memory scopes
// ============================================================================

/// A tier of the target memory hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemScope {
    /// Off-chip global memory.
    Global,
    /// AI-core L1 buffer.
    L1,
    /// Matrix unit left-operand buffer.
    L0A,
    /// Matrix unit right-operand buffer.
    L0B,
    /// Matrix unit accumulator buffer.
    L0C,
    /// AI-core unified (vector) buffer.
    Unified,
    /// GPU shared memory.
    Shared,
    /// GPU thread-local memory.
    Local,
    /// AI-core scalar registers.
    Reg,
    /// AI-CPU local memory.
    AiCpu,
    /// Temporary L1 staging area.
    L1Tmp,
}

impl MemScope {
    /// Every scope, outermost first.
    pub const ALL: [Self; 11] = [
        Self::Global,
        Self::L1,
        Self::L0A,
        Self::L0B,
        Self::L0C,
        Self::Unified,
        Self::Shared,
        Self::Local,
        Self::Reg,
        Self::AiCpu,
        Self::L1Tmp,
    ];

    /// The tag used in memory-table queries.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::L1 => "local.L1",
            Self::L0A => "local.L0A",
            Self::L0B => "local.L0B",
            Self::L0C => "local.L0C",
            Self::Unified => "local.UB",
            Self::Shared => "shared",
            Self::Local => "local",
            Self::Reg => "local.REG",
            Self::AiCpu => "local_aicpu",
            Self::L1Tmp => "L1_tmp",
        }
    }

    /// Short buffer-kind name used in promoted tensor names and logs.
    #[must_use]
    pub const fn mem_type(self) -> &'static str {
        match self {
            Self::Global => "GM",
            Self::L1 | Self::L1Tmp => "C1",
            Self::L0A => "C0A",
            Self::L0B => "C0B",
            Self::L0C => "C0C",
            Self::Unified => "BUF",
            Self::Shared => "SHARED",
            Self::Local | Self::Reg | Self::AiCpu => "LOCAL",
        }
    }

    /// Suffix appended to a tensor name when it is promoted to this scope.
    #[must_use]
    pub const fn buffer_suffix(self) -> &'static str {
        match self {
            Self::Global => "",
            Self::L1 => "_local_L1",
            Self::L0A => "_local_L0A",
            Self::L0B => "_local_L0B",
            Self::L0C => "_local_L0C",
            Self::Unified => "_local_UB",
            Self::Shared => "_shared",
            Self::Local => "_local",
            Self::Reg => "_local_REG",
            Self::AiCpu => "_local_aicpu",
            Self::L1Tmp => "_L1_tmp",
        }
    }

    /// Parses a memory-table tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.tag() == tag)
    }

    /// Returns true for scopes that live on the GPU.
    #[must_use]
    pub const fn is_gpu(self) -> bool {
        matches!(self, Self::Shared | Self::Local)
    }
}

impl fmt::Display for MemScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Size and granularity of one scope, in bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Allocation unit.
    pub unit_bits: u64,
    /// Widest single vector access.
    pub max_simd_bits: u64,
    /// Capacity.
    pub max_num_bits: u64,
}

/// AI-core on-chip buffer sizes, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreBuffers {
    /// L1 buffer.
    pub l1: u64,
    /// Unified buffer.
    pub unified: u64,
    /// L0A buffer.
    pub l0a: u64,
    /// L0B buffer.
    pub l0b: u64,
    /// L0C buffer.
    pub l0c: u64,
}

impl Default for CoreBuffers {
    fn default() -> Self {
        Self {
            l1: 1024 * 1024,
            unified: 256 * 1024,
            l0a: 64 * 1024,
            l0b: 64 * 1024,
            l0c: 256 * 1024,
        }
    }
}

// ============================================================================
// GPU
// ============================================================================

/// Launch limits and per-block memory of a GPU device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    /// Device type name.
    pub device: String,
    /// Maximum threads per block.
    pub max_threads: i64,
    /// Maximum blocks per grid dimension.
    pub max_blocks: i64,
    /// Warp size.
    pub warp_size: i64,
    /// Maximum thread-grid dimensions.
    pub max_thread_dims: usize,
    /// Maximum block-grid dimensions.
    pub max_block_dims: usize,
    /// Shared memory per block in effect, bytes.
    pub shared_bytes: u64,
    /// Register memory per block, bytes.
    pub reg_bytes: u64,
}

struct DeviceTable {
    shared_default: u64,
    shared_max: u64,
    reg_bytes: u64,
}

fn device_table(device: &str) -> Option<DeviceTable> {
    match device {
        "v100" => Some(DeviceTable {
            shared_default: 48 * 1024,
            shared_max: 96 * 1024,
            reg_bytes: 64 * 1024,
        }),
        _ => None,
    }
}

impl GpuInfo {
    /// Limits for `device` with `shared` bytes requested (0 means default).
    ///
    /// # Errors
    ///
    /// Fails for unknown devices or when `shared` exceeds the maximum.
    pub fn for_device(device: &str, shared: u64) -> TargetResult<Self> {
        let table =
            device_table(device).ok_or_else(|| TargetError::UnknownDevice(device.to_string()))?;
        if shared > table.shared_max {
            return Err(TargetError::SharedMemOverMax {
                device: device.to_string(),
                max: table.shared_max,
                requested: shared,
            });
        }
        Ok(Self {
            device: device.to_string(),
            max_threads: 1024,
            max_blocks: 65535,
            warp_size: 32,
            max_thread_dims: 3,
            max_block_dims: 3,
            shared_bytes: if shared == 0 {
                table.shared_default
            } else {
                shared
            },
            reg_bytes: table.reg_bytes,
        })
    }
}

// ============================================================================
// Target info
// ============================================================================

/// Everything the optimizer knows about the target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    /// AI-core buffers.
    pub buffers: CoreBuffers,
    /// GPU limits.
    pub gpu: GpuInfo,
    /// Number of AI cores available for multicore mapping.
    pub core_num: i64,
}

impl TargetInfo {
    /// Reads target settings through `lookup` (normally `std::env::var`).
    ///
    /// # Errors
    ///
    /// Fails for unknown device types, malformed integers and shared
    /// memory beyond the device maximum.
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> TargetResult<Self> {
        let device = lookup(DEVICE_TYPE_ENV)
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_DEVICE.to_string());
        let shared = match lookup(SHARED_MEM_ENV).filter(|v| !v.is_empty()) {
            Some(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|_| TargetError::InvalidValue {
                    key: SHARED_MEM_ENV.to_string(),
                    value: text.clone(),
                })?,
            None => 0,
        };
        let gpu = GpuInfo::for_device(&device, shared)?;
        debug!(device = %gpu.device, shared = gpu.shared_bytes, "target info loaded");
        Ok(Self {
            buffers: CoreBuffers::default(),
            gpu,
            core_num: 1,
        })
    }

    /// Memory table entry for `scope`. Global memory has none.
    #[must_use]
    pub fn memory_info(&self, scope: MemScope) -> Option<MemoryInfo> {
        const CUBE_BITS: u64 = 2 * 16 * 16 * 8;
        let b = &self.buffers;
        let entry = |unit, simd, bits| MemoryInfo {
            unit_bits: unit,
            max_simd_bits: simd,
            max_num_bits: bits,
        };
        Some(match scope {
            MemScope::Global => return None,
            MemScope::L1 => entry(CUBE_BITS, CUBE_BITS, b.l1 * 8),
            MemScope::Unified => entry(256, 256, b.unified * 8),
            MemScope::L0A => entry(CUBE_BITS, CUBE_BITS, b.l0a * 8),
            MemScope::L0B => entry(CUBE_BITS, CUBE_BITS, b.l0b * 8),
            MemScope::L0C => entry(CUBE_BITS, CUBE_BITS, b.l0c * 8),
            MemScope::Reg => entry(16, 64, 64 * 3200),
            MemScope::AiCpu => entry(16, 64, 16 * 1024 * 1024),
            MemScope::L1Tmp => entry(CUBE_BITS, CUBE_BITS, 1024 * 1024 * 1024),
            MemScope::Shared => entry(8, 8, self.gpu.shared_bytes * 8),
            MemScope::Local => entry(8, 8, self.gpu.reg_bytes * 8),
        })
    }

    /// Capacity of `scope` in bytes, if bounded.
    #[must_use]
    pub fn capacity_bytes(&self, scope: MemScope) -> Option<u64> {
        self.memory_info(scope).map(|m| m.max_num_bits / 8)
    }
}

impl Default for TargetInfo {
    fn default() -> Self {
        Self {
            buffers: CoreBuffers::default(),
            gpu: GpuInfo {
                device: DEFAULT_DEVICE.to_string(),
                max_threads: 1024,
                max_blocks: 65535,
                warp_size: 32,
                max_thread_dims: 3,
                max_block_dims: 3,
                shared_bytes: 48 * 1024,
                reg_bytes: 64 * 1024,
            },
            core_num: 1,
        }
    }
}

static TARGET: OnceLock<TargetInfo> = OnceLock::new();

/// The process-wide target info, read from the environment on first use.
///
/// # Errors
///
/// Returns the configuration error from the first read; nothing is cached
/// in that case.
pub fn global() -> TargetResult<&'static TargetInfo> {
    if let Some(info) = TARGET.get() {
        return Ok(info);
    }
    let info = TargetInfo::from_env(|key| std::env::var(key).ok())?;
    Ok(TARGET.get_or_init(|| info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_device() {
        let info = TargetInfo::from_env(env(&[])).unwrap();
        assert_eq!(info.gpu.device, "v100");
        assert_eq!(info.gpu.shared_bytes, 48 * 1024);
        assert_eq!(info.capacity_bytes(MemScope::Local), Some(64 * 1024));
    }

    #[test]
    fn test_shared_mem_override() {
        let info = TargetInfo::from_env(env(&[(SHARED_MEM_ENV, "65536")])).unwrap();
        assert_eq!(info.gpu.shared_bytes, 65536);
        let zero = TargetInfo::from_env(env(&[(SHARED_MEM_ENV, "0")])).unwrap();
        assert_eq!(zero.gpu.shared_bytes, 48 * 1024);
    }

    #[test]
    fn test_shared_mem_over_max() {
        let err = TargetInfo::from_env(env(&[(SHARED_MEM_ENV, "100000")])).unwrap_err();
        assert!(matches!(
            err,
            TargetError::SharedMemOverMax { max: 98304, requested: 100_000, .. }
        ));
    }

    #[test]
    fn test_unknown_device() {
        let err = TargetInfo::from_env(env(&[(DEVICE_TYPE_ENV, "a100")])).unwrap_err();
        assert!(matches!(err, TargetError::UnknownDevice(d) if d == "a100"));
        let err = TargetInfo::from_env(env(&[(SHARED_MEM_ENV, "lots")])).unwrap_err();
        assert!(matches!(err, TargetError::InvalidValue { .. }));
    }

    #[test]
    fn test_memory_table() {
        let info = TargetInfo::default();
        let l1 = info.memory_info(MemScope::L1).unwrap();
        assert_eq!(l1.unit_bits, 4096);
        assert_eq!(l1.max_num_bits, 1024 * 1024 * 8);
        let ub = info.memory_info(MemScope::Unified).unwrap();
        assert_eq!((ub.unit_bits, ub.max_simd_bits), (256, 256));
        let reg = info.memory_info(MemScope::Reg).unwrap();
        assert_eq!((reg.unit_bits, reg.max_simd_bits, reg.max_num_bits), (16, 64, 204_800));
        assert_eq!(
            info.memory_info(MemScope::AiCpu).unwrap().max_num_bits,
            16 * 1024 * 1024
        );
        assert!(info.memory_info(MemScope::Global).is_none());
    }

    #[test]
    fn test_scope_tags_round_trip() {
        for scope in MemScope::ALL {
            assert_eq!(MemScope::from_tag(scope.tag()), Some(scope));
        }
        assert_eq!(MemScope::Unified.mem_type(), "BUF");
    }
}
