use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: &str = "1.0";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unsupported schema_version '{0}'. Supported versions: '1.0'")]
    UnsupportedSchema(String),
    #[error("Input 'firmware' path cannot be empty when a hello_world_host case is listed")]
    MissingFirmware,
    #[error("Limit 'timeout_ms' must be greater than zero")]
    ZeroTimeout,
    #[error("Test script lists no cases")]
    NoCases,
    #[error("Invalid 'min_free_heap' value '{value}': {reason}")]
    InvalidSize { value: String, reason: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TestInputs {
    #[serde(default)]
    pub firmware: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestLimits {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for TestLimits {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HelloWorldCase {
    #[serde(default)]
    pub greeting: Option<String>,
    /// e.g. "100 kB"
    #[serde(default)]
    pub min_free_heap: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HelloWorldHostCase {
    #[serde(default)]
    pub greeting: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HelloWorldEntry {
    pub hello_world: HelloWorldCase,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HelloWorldHostEntry {
    pub hello_world_host: HelloWorldHostCase,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum TestCase {
    HelloWorld(HelloWorldEntry),
    HelloWorldHost(HelloWorldHostEntry),
}

impl TestCase {
    pub fn name(&self) -> &'static str {
        match self {
            TestCase::HelloWorld(_) => "hello_world",
            TestCase::HelloWorldHost(_) => "hello_world_host",
        }
    }

    pub fn greeting(&self) -> Option<&str> {
        match self {
            TestCase::HelloWorld(c) => c.hello_world.greeting.as_deref(),
            TestCase::HelloWorldHost(c) => c.hello_world_host.greeting.as_deref(),
        }
    }

    /// Heap threshold in bytes, if one is configured.
    pub fn min_free_heap_bytes(&self) -> Result<Option<u64>, ConfigError> {
        match self {
            TestCase::HelloWorld(HelloWorldEntry {
                hello_world:
                    HelloWorldCase {
                        min_free_heap: Some(size),
                        ..
                    },
            }) => parse_size(size)
                .map(Some)
                .map_err(|e| ConfigError::InvalidSize {
                    value: size.clone(),
                    reason: e.to_string(),
                }),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestScript {
    pub schema_version: String,
    #[serde(default)]
    pub inputs: TestInputs,
    #[serde(default)]
    pub limits: TestLimits,
    pub cases: Vec<TestCase>,
}

impl TestScript {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open test script at {:?}", path.as_ref()))?;
        let script: Self =
            serde_yaml::from_reader(f).context("Failed to parse Test Script YAML")?;
        script.validate()?;
        Ok(script)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedSchema(self.schema_version.clone()));
        }

        if self.cases.is_empty() {
            return Err(ConfigError::NoCases);
        }

        let needs_firmware = self
            .cases
            .iter()
            .any(|c| matches!(c, TestCase::HelloWorldHost(_)));
        if needs_firmware && self.inputs.firmware.trim().is_empty() {
            return Err(ConfigError::MissingFirmware);
        }

        if self.limits.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        for case in &self.cases {
            case.min_free_heap_bytes()?;
        }

        Ok(())
    }

    /// Firmware path, resolved against the directory holding the script.
    pub fn firmware_path(&self, script_path: &Path) -> Option<PathBuf> {
        let firmware = self.inputs.firmware.trim();
        if firmware.is_empty() {
            return None;
        }
        let firmware = Path::new(firmware);
        if firmware.is_absolute() {
            return Some(firmware.to_path_buf());
        }
        let base = script_path.parent().unwrap_or_else(|| Path::new("."));
        Some(base.join(firmware))
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    if let Ok(bytes) = size_str.trim().parse::<u64>() {
        return Ok(bytes);
    }
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}
