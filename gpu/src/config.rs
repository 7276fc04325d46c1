//! Kernel build configuration: output dimensions and execution mode.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::error::{KernelError, Result};

/// Output size used when `dimensions` is not configured.
pub const DEFAULT_DIMENSIONS: [u32; 1] = [1024];

/// Maximum number of output axes (x, y, z).
pub const MAX_AXES: usize = 3;

/// Where a kernel is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    /// Try the GPU, fall back to the CPU executor on any GPU failure.
    #[default]
    Auto,
    /// GPU only; compile and execution failures are surfaced.
    Gpu,
    /// CPU executor only; the GPU path is never touched.
    Cpu,
}

impl ExecutionMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
        }
    }

    pub fn allows_fallback(self) -> bool {
        self != Self::Gpu
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExecutionMode {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "gpu" => Ok(Self::Gpu),
            "cpu" => Ok(Self::Cpu),
            other => Err(KernelError::config(format!(
                "unknown mode '{other}' (expected auto, gpu or cpu)"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for ExecutionMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Options recognised by `Gpu::compile`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Thread dimensions `[x, y, z]`; `None` means `[1024]`.
    pub dimensions: Option<Vec<u32>>,
    pub mode: ExecutionMode,
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dimensions(mut self, dims: impl Into<Vec<u32>>) -> Self {
        self.dimensions = Some(dims.into());
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parse a `[kernel]`-less TOML document such as
    /// `dimensions = [4, 2]` / `mode = "GPU"`.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| KernelError::config(e.to_string()))
    }

    /// Validated dimensions with the default applied.
    pub fn resolved_dimensions(&self) -> Result<Dimensions> {
        match &self.dimensions {
            Some(dims) => Dimensions::new(dims),
            None => Dimensions::new(&DEFAULT_DIMENSIONS),
        }
    }
}

/// Validated output dimensions, 1 to 3 positive axes ordered `[x, y, z]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dimensions(Vec<u32>);

impl Dimensions {
    pub fn new(dims: &[u32]) -> Result<Self> {
        if dims.is_empty() || dims.len() > MAX_AXES {
            return Err(KernelError::invalid(format!(
                "dimensions must have 1 to {MAX_AXES} axes, got {}",
                dims.len()
            )));
        }
        if let Some(pos) = dims.iter().position(|&d| d == 0) {
            return Err(KernelError::invalid(format!(
                "dimension {pos} is zero; all axes must be positive"
            )));
        }
        let total = dims.iter().try_fold(1u32, |acc, &d| acc.checked_mul(d));
        if total.is_none() {
            return Err(KernelError::invalid("dimension product overflows u32"));
        }
        Ok(Self(dims.to_vec()))
    }

    pub fn axes(&self) -> &[u32] {
        &self.0
    }

    /// Sizes padded to three axes: `(x, y, z)`.
    pub fn xyz(&self) -> [u32; 3] {
        let mut out = [1u32; 3];
        out[..self.0.len()].copy_from_slice(&self.0);
        out
    }

    pub fn total(&self) -> usize {
        self.0.iter().map(|&d| d as usize).product()
    }

    /// Row-major array shape of the output (`[z][y][x]`, outermost first).
    pub fn output_shape(&self) -> Vec<usize> {
        self.0.iter().rev().map(|&d| d as usize).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing_is_case_insensitive() {
        assert_eq!("GPU".parse::<ExecutionMode>().unwrap(), ExecutionMode::Gpu);
        assert_eq!("Cpu".parse::<ExecutionMode>().unwrap(), ExecutionMode::Cpu);
        assert_eq!("auto".parse::<ExecutionMode>().unwrap(), ExecutionMode::Auto);
        assert!("fpga".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_default_dimensions() {
        let dims = KernelConfig::new().resolved_dimensions().unwrap();
        assert_eq!(dims.axes(), &[1024]);
        assert_eq!(dims.total(), 1024);
    }

    #[test]
    fn test_invalid_dimensions() {
        assert!(Dimensions::new(&[]).is_err());
        assert!(Dimensions::new(&[1, 2, 3, 4]).is_err());
        assert!(matches!(
            Dimensions::new(&[4, 0]),
            Err(KernelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_output_shape_is_reversed() {
        let dims = Dimensions::new(&[4, 2]).unwrap();
        assert_eq!(dims.output_shape(), vec![2, 4]);
        assert_eq!(dims.xyz(), [4, 2, 1]);
    }

    #[test]
    fn test_from_toml() {
        let config = KernelConfig::from_toml_str("dimensions = [8, 8]\nmode = \"CPU\"\n").unwrap();
        assert_eq!(config.dimensions, Some(vec![8, 8]));
        assert_eq!(config.mode, ExecutionMode::Cpu);

        let err = KernelConfig::from_toml_str("mode = \"tpu\"").unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }
}
