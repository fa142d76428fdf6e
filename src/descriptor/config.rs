//! Descriptor document types
//!
//! These mirror the on-disk YAML. Short and long syntaxes are kept apart here
//! and normalized later by [`crate::descriptor::model`].

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Deployment descriptor file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescriptorFile {
    /// Descriptor format version (informational)
    #[serde(default)]
    pub version: Option<String>,
    /// Project name
    #[serde(default)]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Top-level volumes; `pgdata:` with no body is allowed
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<VolumeConfig>>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default)]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default)]
    pub build: Option<BuildConfig>,
    /// Environment variables
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    /// Port mappings
    #[serde(default)]
    pub ports: Option<Vec<PortConfig>>,
    /// Volume mounts
    #[serde(default)]
    pub volumes: Option<Vec<VolumeMountConfig>>,
    /// Restart policy
    #[serde(default)]
    pub restart: Option<String>,
    /// Service dependencies
    #[serde(default)]
    pub depends_on: Option<DependsOnConfig>,
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Simple context path
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

/// Full build configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfigFull {
    /// Build context
    #[serde(default)]
    pub context: Option<String>,
    /// Build file path, relative to the context
    #[serde(default, alias = "file")]
    pub dockerfile: Option<String>,
}

/// A YAML scalar that should be read as a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(b) => write!(f, "{}", b),
            ScalarValue::Int(i) => write!(f, "{}", i),
            ScalarValue::Float(x) => write!(f, "{}", x),
            ScalarValue::Str(s) => f.write_str(s),
        }
    }
}

/// Environment configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value, values kept as written (`3.10` stays `3.10`)
    Map(BTreeMap<String, Option<String>>),
}

// Plain scalars must reach `String` unbuffered to keep their source text
impl<'de> Deserialize<'de> for EnvironmentConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EnvironmentVisitor;

        impl<'de> Visitor<'de> for EnvironmentVisitor {
            type Value = EnvironmentConfig;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of KEY=value strings or a map")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element::<String>()? {
                    items.push(item);
                }
                Ok(EnvironmentConfig::Array(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut values = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<String, Option<String>>()? {
                    if values.insert(key.clone(), value).is_some() {
                        return Err(de::Error::custom(format!(
                            "duplicate environment variable '{}'",
                            key
                        )));
                    }
                }
                Ok(EnvironmentConfig::Map(values))
            }
        }

        deserializer.deserialize_any(EnvironmentVisitor)
    }
}

impl EnvironmentConfig {
    /// Flatten into key/value pairs. A bare `KEY` or `KEY:` with no value
    /// yields an empty string.
    pub fn entries(&self) -> Vec<(String, String)> {
        match self {
            EnvironmentConfig::Array(arr) => arr
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
            EnvironmentConfig::Map(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), value.clone().unwrap_or_default()))
                .collect(),
        }
    }
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Bare container port: `- 80`
    Number(u16),
    /// Short syntax: "8080:80"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    #[serde(default)]
    pub published: Option<ScalarValue>,
    /// Host IP to bind to
    #[serde(default)]
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMountConfig {
    /// Short syntax: "source:target:mode"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (volume, bind)
    #[serde(rename = "type", default)]
    pub mount_type: Option<String>,
    /// Source path or volume name
    #[serde(default)]
    pub source: Option<String>,
    /// Target path in container
    pub target: String,
    /// Read only
    #[serde(default)]
    pub read_only: Option<bool>,
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to `{condition: ...}`, in declaration order
    Map(serde_yaml::Mapping),
}

impl DependsOnConfig {
    /// Referenced service names in declaration order
    pub fn names(&self) -> Vec<String> {
        match self {
            DependsOnConfig::Array(arr) => arr.clone(),
            DependsOnConfig::Map(map) => map
                .keys()
                .map(|key| match key {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    _ => String::new(),
                })
                .collect(),
        }
    }
}

/// Top-level volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Driver
    #[serde(default)]
    pub driver: Option<String>,
    /// External volume
    #[serde(default)]
    pub external: Option<ExternalConfig>,
    /// Name override
    #[serde(default)]
    pub name: Option<String>,
}

/// External resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    /// Boolean
    Bool(bool),
    /// With name
    Named { name: String },
}

impl ExternalConfig {
    pub fn is_external(&self) -> bool {
        match self {
            ExternalConfig::Bool(b) => *b,
            ExternalConfig::Named { .. } => true,
        }
    }
}
