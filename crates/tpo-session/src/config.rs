//! User configuration.
//!
//! Options reach the optimizer as string attributes attached to the kernel
//! (`--set key=value` on the command line). [`UserConfig::from_attrs`]
//! folds them into a typed record; later passes read it and the GPU mapping
//! pass writes the chosen block and thread configuration back.

use crate::{SessionError, SessionResult};
use camino::Utf8PathBuf;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

// ============================================================================
// Dump levels
// ============================================================================

/// How much the stage logger records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DumpLevel {
    /// Nothing is recorded.
    #[default]
    Off = 0,
    /// Analysis results and final decisions.
    General = 1,
    /// Every candidate the tiling search evaluates.
    Candidate = 2,
    /// Tuning and retry details.
    Tuning = 3,
}

impl DumpLevel {
    /// Converts a numeric level, saturating above [`DumpLevel::Tuning`].
    #[must_use]
    pub const fn from_int(level: i64) -> Self {
        match level {
            i64::MIN..=0 => Self::Off,
            1 => Self::General,
            2 => Self::Candidate,
            _ => Self::Tuning,
        }
    }
}

// ============================================================================
// Mapping configuration
// ============================================================================

const DIM_NAMES: [&str; 3] = ["x", "y", "z"];

/// An ordered list of named hardware dimensions with their sizes.
///
/// Used for both GPU blocks and GPU threads. Entry `i` is named after the
/// `i`-th of `x`, `y`, `z`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingCfg {
    dims: Vec<(String, i64)>,
}

impl MappingCfg {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from sizes, innermost dimension first.
    ///
    /// # Errors
    ///
    /// Fails when a size is not positive or there are more than three.
    pub fn from_sizes(sizes: impl IntoIterator<Item = i64>) -> SessionResult<Self> {
        let mut cfg = Self::new();
        for size in sizes {
            cfg.push(size)?;
        }
        Ok(cfg)
    }

    /// Appends the next dimension.
    ///
    /// # Errors
    ///
    /// Fails when `size` is not positive or all three dimensions are used.
    pub fn push(&mut self, size: i64) -> SessionResult<()> {
        let Some(name) = DIM_NAMES.get(self.dims.len()) else {
            return Err(SessionError::InvalidValue {
                key: "mapping".to_string(),
                value: format!("{self} {size}"),
            });
        };
        if size <= 0 {
            return Err(SessionError::InvalidValue {
                key: format!("mapping.{name}"),
                value: size.to_string(),
            });
        }
        self.dims.push(((*name).to_string(), size));
        Ok(())
    }

    /// Number of dimensions in use.
    #[must_use]
    pub fn bound(&self) -> usize {
        self.dims.len()
    }

    /// Returns true if no dimension is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// Size of dimension `i`.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<i64> {
        self.dims.get(i).map(|(_, size)| *size)
    }

    /// Named entries in order.
    #[must_use]
    pub fn entries(&self) -> &[(String, i64)] {
        &self.dims
    }

    /// Sizes in order.
    pub fn sizes(&self) -> impl Iterator<Item = i64> + '_ {
        self.dims.iter().map(|(_, size)| *size)
    }

    /// Product of all sizes; 1 when empty.
    #[must_use]
    pub fn product(&self) -> i64 {
        self.sizes().product()
    }
}

impl FromStr for MappingCfg {
    type Err = SessionError;

    fn from_str(s: &str) -> SessionResult<Self> {
        let mut cfg = Self::new();
        for word in s.split_whitespace() {
            let size = word.parse::<i64>().map_err(|_| SessionError::InvalidValue {
                key: "mapping".to_string(),
                value: s.to_string(),
            })?;
            cfg.push(size)?;
        }
        Ok(cfg)
    }
}

impl fmt::Display for MappingCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, size) in self.sizes().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{size}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Convolution attributes
// ============================================================================

/// Convolution metadata from the `pragma_conv_*` attributes.
///
/// Integer fields left at zero were not provided.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvAttrs {
    /// Name of the feature-map tensor.
    pub feature_name: String,
    /// Feature-map height.
    pub feature_h: i64,
    /// Feature-map width.
    pub feature_w: i64,
    /// Feature-map channels.
    pub feature_c: i64,
    /// Padding above the feature map.
    pub pad_top: i64,
    /// Padding left of the feature map.
    pub pad_left: i64,
    /// Vertical stride.
    pub stride_h: i64,
    /// Horizontal stride.
    pub stride_w: i64,
    /// Vertical dilation.
    pub dilation_h: i64,
    /// Horizontal dilation.
    pub dilation_w: i64,
    /// Kernel height.
    pub kernel_h: i64,
    /// Kernel width.
    pub kernel_w: i64,
    /// Requested input tile height.
    pub tile_h: i64,
    /// Requested input tile width.
    pub tile_w: i64,
    /// The convolution computes a filter gradient.
    pub backprop_filter: bool,
    /// The input is loaded with the special DMA path.
    pub special_dma: bool,
}

impl Default for ConvAttrs {
    fn default() -> Self {
        Self {
            feature_name: String::new(),
            feature_h: 0,
            feature_w: 0,
            feature_c: 0,
            pad_top: 0,
            pad_left: 0,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            kernel_h: 0,
            kernel_w: 0,
            tile_h: 0,
            tile_w: 0,
            backprop_filter: false,
            special_dma: false,
        }
    }
}

impl ConvAttrs {
    /// Returns true once a kernel size is known.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.kernel_h > 0 && self.kernel_w > 0
    }

    fn set(&mut self, field: &str, value: &str) -> SessionResult<bool> {
        let slot = match field {
            "feature_name" => {
                self.feature_name = value.to_string();
                return Ok(true);
            }
            "backprop_filter" => {
                self.backprop_filter = parse_bool(field, value)?;
                return Ok(true);
            }
            "special_dma" => {
                self.special_dma = parse_bool(field, value)?;
                return Ok(true);
            }
            "feature_h" => &mut self.feature_h,
            "feature_w" => &mut self.feature_w,
            "feature_c" => &mut self.feature_c,
            "pad_top" => &mut self.pad_top,
            "pad_left" => &mut self.pad_left,
            "stride_h" => &mut self.stride_h,
            "stride_w" => &mut self.stride_w,
            "dilation_h" => &mut self.dilation_h,
            "dilation_w" => &mut self.dilation_w,
            "kernel_h" => &mut self.kernel_h,
            "kernel_w" => &mut self.kernel_w,
            "tile_h" => &mut self.tile_h,
            "tile_w" => &mut self.tile_w,
            _ => return Ok(false),
        };
        *slot = parse_int(field, value)?;
        Ok(true)
    }
}

// ============================================================================
// User configuration
// ============================================================================

/// Prefix of convolution attribute keys.
pub const CONV_PREFIX: &str = "pragma_conv_";

/// Every option the optimizer reads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// GPU block configuration, set by the user or by mapping.
    pub block_cfg: Option<MappingCfg>,
    /// GPU thread configuration, set by the user or by mapping.
    pub thread_cfg: Option<MappingCfg>,
    /// Tensors promoted to shared memory regardless of access pattern.
    pub local_tensors: Vec<String>,
    /// Band depth for shared-memory promotion; -1 derives it from the band.
    pub shared_depth: i64,
    /// Unroll the shared-memory copy loops.
    pub unroll_shared: bool,
    /// Largest loop the code generator may unroll.
    pub max_unroll_loop: i64,
    /// Use the reduction library for reduce templates.
    pub enable_akg_reduce_lib: bool,
    /// Convolution metadata.
    pub conv: ConvAttrs,
    /// Tensors bound to external buffers.
    pub binds: FxHashSet<String>,
    /// Directory receiving `tiling.log`.
    pub dump_dir: Option<Utf8PathBuf>,
    /// Stage logger verbosity.
    pub dump_level: DumpLevel,
    /// Cores available for multicore mapping.
    pub core_num: i64,
    /// Custom tiling directives.
    pub custom_tiling: Vec<String>,
    /// Run the GPU pipeline.
    pub is_gpu: bool,
    /// The kernel is a matrix multiplication specialised for the matrix unit.
    pub spec_gemm: bool,
    /// Promote eligible tensors to GPU shared memory.
    pub use_shared_memory: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            block_cfg: None,
            thread_cfg: None,
            local_tensors: Vec::new(),
            shared_depth: -1,
            unroll_shared: false,
            max_unroll_loop: 1,
            enable_akg_reduce_lib: false,
            conv: ConvAttrs::default(),
            binds: FxHashSet::default(),
            dump_dir: None,
            dump_level: DumpLevel::Off,
            core_num: 1,
            custom_tiling: Vec::new(),
            is_gpu: false,
            spec_gemm: false,
            use_shared_memory: true,
        }
    }
}

impl UserConfig {
    /// Builds a configuration from string attributes, in order.
    ///
    /// Later keys overwrite earlier ones; `custom_tiling` accumulates.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidValue`] for malformed integers,
    /// booleans or mapping sizes.
    pub fn from_attrs<K, V>(attrs: impl IntoIterator<Item = (K, V)>) -> SessionResult<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in attrs {
            config.set(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Applies one attribute.
    ///
    /// # Errors
    ///
    /// See [`UserConfig::from_attrs`].
    pub fn set(&mut self, key: &str, value: &str) -> SessionResult<()> {
        let value = value.trim();
        match key {
            "bind_block" => self.block_cfg = Some(parse_mapping(key, value)?),
            "bind_thread" => self.thread_cfg = Some(parse_mapping(key, value)?),
            "local_tensors" => {
                self.local_tensors = value.split_whitespace().map(str::to_string).collect();
            }
            "shared_depth" => self.shared_depth = parse_int(key, value)?,
            "unroll_shared" => self.unroll_shared = parse_bool(key, value)?,
            "max_unroll_loop" => self.max_unroll_loop = parse_int(key, value)?,
            "enable_akg_reduce_lib" => self.enable_akg_reduce_lib = parse_bool(key, value)?,
            "binds" => {
                self.binds = value.split_whitespace().map(str::to_string).collect();
            }
            "dump_dir" => self.dump_dir = Some(Utf8PathBuf::from(value)),
            "dump_level" => self.dump_level = DumpLevel::from_int(parse_int(key, value)?),
            "core_num" => {
                let n = parse_int(key, value)?;
                if n <= 0 {
                    return Err(invalid(key, value));
                }
                self.core_num = n;
            }
            "custom_tiling" => self.custom_tiling.extend(
                value
                    .split(';')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string),
            ),
            "process" => self.is_gpu = value == "cuda",
            "is_gpu" => self.is_gpu = parse_bool(key, value)?,
            "spec_gemm" => self.spec_gemm = parse_bool(key, value)?,
            "use_shared_memory" => self.use_shared_memory = parse_bool(key, value)?,
            _ => {
                let handled = match key.strip_prefix(CONV_PREFIX) {
                    Some(field) => self.conv.set(field, value)?,
                    None => false,
                };
                if !handled {
                    debug!(key, value, "ignoring unknown attribute");
                }
            }
        }
        Ok(())
    }

    /// Returns true if `tensor` is bound to an external buffer.
    #[must_use]
    pub fn is_bound(&self, tensor: &str) -> bool {
        self.binds.contains(tensor)
    }
}

fn invalid(key: &str, value: &str) -> SessionError {
    SessionError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_int(key: &str, value: &str) -> SessionResult<i64> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> SessionResult<bool> {
    match value {
        "true" | "True" | "1" => Ok(true),
        "false" | "False" | "0" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_mapping(key: &str, value: &str) -> SessionResult<MappingCfg> {
    value.parse().map_err(|_| invalid(key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_roundtrip() {
        let cfg: MappingCfg = "32 8".parse().unwrap();
        assert_eq!(cfg.bound(), 2);
        assert_eq!(cfg.entries()[0], ("x".to_string(), 32));
        assert_eq!(cfg.entries()[1], ("y".to_string(), 8));
        assert_eq!(cfg.product(), 256);
        assert_eq!(cfg.to_string(), "32 8");
        assert_eq!(MappingCfg::new().product(), 1);
    }

    #[test]
    fn test_mapping_rejects_bad_sizes() {
        assert!("0".parse::<MappingCfg>().is_err());
        assert!("4 -1".parse::<MappingCfg>().is_err());
        assert!("4 x".parse::<MappingCfg>().is_err());
        assert!("1 2 3 4".parse::<MappingCfg>().is_err());
        assert!(MappingCfg::from_sizes([1, 2, 3]).is_ok());
    }

    #[test]
    fn test_defaults() {
        let cfg = UserConfig::default();
        assert_eq!(cfg.shared_depth, -1);
        assert_eq!(cfg.max_unroll_loop, 1);
        assert_eq!(cfg.core_num, 1);
        assert_eq!(cfg.dump_level, DumpLevel::Off);
        assert!(cfg.use_shared_memory);
        assert!(!cfg.conv.is_set());
    }

    #[test]
    fn test_from_attrs() {
        let cfg = UserConfig::from_attrs([
            ("bind_thread", "32 4"),
            ("local_tensors", "a  b"),
            ("shared_depth", "2"),
            ("enable_akg_reduce_lib", "true"),
            ("pragma_conv_kernel_h", "3"),
            ("pragma_conv_kernel_w", "3"),
            ("pragma_conv_feature_name", "input"),
            ("pragma_conv_backprop_filter", "1"),
            ("binds", "out"),
            ("custom_tiling", "MOD:0:16; MIN:1:4"),
            ("process", "cuda"),
            ("something_else", "whatever"),
        ])
        .unwrap();
        assert_eq!(cfg.thread_cfg.as_ref().map(MappingCfg::product), Some(128));
        assert_eq!(cfg.local_tensors, vec!["a", "b"]);
        assert_eq!(cfg.shared_depth, 2);
        assert!(cfg.enable_akg_reduce_lib);
        assert!(cfg.conv.is_set());
        assert_eq!(cfg.conv.feature_name, "input");
        assert!(cfg.conv.backprop_filter);
        assert_eq!(cfg.conv.stride_h, 1);
        assert!(cfg.is_bound("out"));
        assert_eq!(cfg.custom_tiling, vec!["MOD:0:16", "MIN:1:4"]);
        assert!(cfg.is_gpu);
    }

    #[test]
    fn test_invalid_values() {
        let err = UserConfig::from_attrs([("shared_depth", "deep")]).unwrap_err();
        assert!(matches!(err, SessionError::InvalidValue { ref key, .. } if key == "shared_depth"));
        assert!(UserConfig::from_attrs([("bind_block", "0 1")]).is_err());
        assert!(UserConfig::from_attrs([("core_num", "0")]).is_err());
        assert!(UserConfig::from_attrs([("unroll_shared", "maybe")]).is_err());
        assert!(UserConfig::from_attrs([("pragma_conv_stride_h", "two")]).is_err());
    }

    #[test]
    fn test_dump_level_from_int() {
        assert_eq!(DumpLevel::from_int(-3), DumpLevel::Off);
        assert_eq!(DumpLevel::from_int(1), DumpLevel::General);
        assert_eq!(DumpLevel::from_int(2), DumpLevel::Candidate);
        assert_eq!(DumpLevel::from_int(9), DumpLevel::Tuning);
    }
}
