//! Configuration input model
//!
//! The configuration is a tree of partitions, each with a set of classes:
//!
//! ```yaml
//! options:
//!   l2:
//!     optional: true
//! partitions:
//!   exclusive:
//!     l3Allocation: 60%
//!     mbAllocation: [100%]
//!     classes:
//!       guaranteed:
//!         l3Allocation: 100%
//!   shared:
//!     l3Allocation:
//!       all: 40%
//!       1: "0-7"
//!     classes:
//!       besteffort:
//!         mbAllocation:
//!           all: [50%, 1000MBps]
//! ```
//!
//! Allocation values are kept as untyped [`RawValue`] trees here and lowered
//! into typed schemas by the resolver.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};

use crate::common::CacheLevel;
use crate::error::{RdtError, Result};

/// Untyped allocation value as written in the configuration
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<RawValue>),
    Map(BTreeMap<String, RawValue>),
}

impl RawValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn into_key(self) -> std::result::Result<String, String> {
        match self {
            Self::Str(s) => Ok(s),
            Self::Int(i) => Ok(i.to_string()),
            other => Err(format!("invalid map key {other}")),
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

struct RawValueVisitor;

impl<'de> Visitor<'de> for RawValueVisitor {
    type Value = RawValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a string, number, list or map")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<RawValue, E> {
        Ok(RawValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<RawValue, E> {
        Ok(RawValue::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<RawValue, E> {
        i64::try_from(v)
            .map(RawValue::Int)
            .map_err(|_| E::custom(format!("integer {v} out of range")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<RawValue, E> {
        Ok(RawValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<RawValue, E> {
        Ok(RawValue::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<RawValue, E> {
        Ok(RawValue::Str(v))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<RawValue, E> {
        Ok(RawValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<RawValue, E> {
        Ok(RawValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<RawValue, D::Error> {
        RawValue::deserialize(d)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<RawValue, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element::<RawValue>()? {
            items.push(item);
        }
        Ok(RawValue::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<RawValue, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((key, value)) = map.next_entry::<RawValue, RawValue>()? {
            let key = key.into_key().map_err(de::Error::custom)?;
            entries.insert(key, value);
        }
        Ok(RawValue::Map(entries))
    }
}

impl<'de> Deserialize<'de> for RawValue {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        d.deserialize_any(RawValueVisitor)
    }
}

/// Settings of one resource type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceOptions {
    /// Silently ignore the resource if the system does not support it
    pub optional: bool,
}

/// Settings common to all partitions and classes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    pub l2: ResourceOptions,
    pub l3: ResourceOptions,
    pub mb: ResourceOptions,
}

impl Options {
    pub fn cat(&self, lvl: CacheLevel) -> ResourceOptions {
        match lvl {
            CacheLevel::L2 => self.l2,
            CacheLevel::L3 => self.l3,
        }
    }
}

/// Kubernetes specific settings of a class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct KubernetesOptions {
    /// Refuse to assign containers to the class via container annotations
    pub deny_container_annotation: bool,
    /// Refuse to assign containers to the class via pod annotations
    pub deny_pod_annotation: bool,
}

/// Requested allocations of one class
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassSpec {
    #[serde(
        rename = "l2Allocation",
        alias = "l2Schema",
        alias = "l2schema",
        alias = "l2allocation"
    )]
    pub l2_allocation: Option<RawValue>,

    #[serde(
        rename = "l3Allocation",
        alias = "l3Schema",
        alias = "l3schema",
        alias = "l3allocation"
    )]
    pub l3_allocation: Option<RawValue>,

    #[serde(
        rename = "mbAllocation",
        alias = "mbSchema",
        alias = "mbschema",
        alias = "mballocation"
    )]
    pub mb_allocation: Option<RawValue>,

    pub kubernetes: KubernetesOptions,
}

impl ClassSpec {
    pub fn cat_allocation(&self, lvl: CacheLevel) -> Option<&RawValue> {
        match lvl {
            CacheLevel::L2 => self.l2_allocation.as_ref(),
            CacheLevel::L3 => self.l3_allocation.as_ref(),
        }
    }
}

/// Requested allocations of one partition and its classes
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartitionSpec {
    #[serde(rename = "l2Allocation", alias = "l2allocation")]
    pub l2_allocation: Option<RawValue>,

    #[serde(rename = "l3Allocation", alias = "l3allocation")]
    pub l3_allocation: Option<RawValue>,

    #[serde(rename = "mbAllocation", alias = "mballocation")]
    pub mb_allocation: Option<RawValue>,

    /// Classes of the partition. A class without any settings is `None`.
    pub classes: BTreeMap<String, Option<ClassSpec>>,
}

impl PartitionSpec {
    pub fn cat_allocation(&self, lvl: CacheLevel) -> Option<&RawValue> {
        match lvl {
            CacheLevel::L2 => self.l2_allocation.as_ref(),
            CacheLevel::L3 => self.l3_allocation.as_ref(),
        }
    }
}

/// Raw RDT configuration
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub options: Options,
    pub partitions: BTreeMap<String, PartitionSpec>,
}

impl Config {
    /// Parse a configuration from YAML. Unknown fields are rejected.
    pub fn from_yaml_str(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }

    /// Read and parse a YAML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| RdtError::io("read", path, e))?;
        Self::from_yaml_str(&data).map_err(|e| e.context(format!("failed to parse {}", path.display())))
    }

    /// Iterate over all classes as (partition, class, spec) tuples
    pub fn classes(&self) -> impl Iterator<Item = (&str, &str, Option<&ClassSpec>)> {
        self.partitions.iter().flat_map(|(pname, partition)| {
            partition
                .classes
                .iter()
                .map(move |(cname, class)| (pname.as_str(), cname.as_str(), class.as_ref()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let data = r#"
options:
  l2:
    optional: true
partitions:
  exclusive:
    l3Allocation: 60%
    mbAllocation: [100%]
    classes:
      guaranteed:
        l3schema: 100%
        kubernetes:
          denyPodAnnotation: true
      empty:
  shared:
    l3Allocation:
      all: 40%
      0-1: "0xff"
      2: "0-3"
    classes:
      besteffort:
        mbSchema:
          all: [50%, 1000MBps]
"#;
        let conf = Config::from_yaml_str(data).unwrap();

        assert!(conf.options.l2.optional);
        assert!(!conf.options.cat(CacheLevel::L3).optional);
        assert_eq!(conf.partitions.len(), 2);

        let exclusive = &conf.partitions["exclusive"];
        assert_eq!(
            exclusive.l3_allocation,
            Some(RawValue::Str("60%".to_string()))
        );
        assert_eq!(
            exclusive.mb_allocation,
            Some(RawValue::List(vec![RawValue::Str("100%".to_string())]))
        );
        assert_eq!(exclusive.l2_allocation, None);

        let guaranteed = exclusive.classes["guaranteed"].as_ref().unwrap();
        assert_eq!(
            guaranteed.cat_allocation(CacheLevel::L3),
            Some(&RawValue::Str("100%".to_string()))
        );
        assert!(guaranteed.kubernetes.deny_pod_annotation);
        assert!(!guaranteed.kubernetes.deny_container_annotation);
        assert!(exclusive.classes["empty"].is_none());

        let RawValue::Map(shared) = conf.partitions["shared"].l3_allocation.as_ref().unwrap() else {
            panic!("expected a map");
        };
        // Integer keys become strings
        assert_eq!(shared["2"], RawValue::Str("0-3".to_string()));
        assert_eq!(shared["0-1"], RawValue::Str("0xff".to_string()));

        let names: Vec<_> = conf.classes().map(|(p, c, _)| (p, c)).collect();
        assert_eq!(
            names,
            [
                ("exclusive", "empty"),
                ("exclusive", "guaranteed"),
                ("shared", "besteffort")
            ]
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let data = "partitions:\n  p:\n    l4Allocation: 10%\n";
        assert!(Config::from_yaml_str(data).is_err());

        let data = "options:\n  l3:\n    optinal: true\n";
        assert!(Config::from_yaml_str(data).is_err());
    }

    #[test]
    fn test_empty_config() {
        assert_eq!(Config::from_yaml_str("").unwrap(), Config::default());
        assert_eq!(Config::from_yaml_str("  \n").unwrap(), Config::default());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rdt.yaml");
        std::fs::write(&path, "partitions:\n  p:\n    l3Allocation: 100%\n").unwrap();

        let conf = Config::from_file(&path).unwrap();
        assert!(conf.partitions.contains_key("p"));

        assert!(Config::from_file(&dir.path().join("missing.yaml")).is_err());
    }
}
