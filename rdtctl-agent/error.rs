use std::fmt;
use std::io;
use std::path::Path;

use rdtctl_raw::{Bitmask, BitmaskError};
use thiserror::Error;

use crate::common::CacheLevel;
use crate::resolver::CatSchemaType;

/// Coarse classification of [`RdtError`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The configuration is malformed or violates an invariant
    ConfigInvalid,
    /// Allocation requests conflict with each other
    Resolution,
    /// The configuration requires a feature the hardware lacks
    CapabilityUnsupported,
    /// A resctrl filesystem operation failed
    Filesystem,
    /// Refused to remove a non-empty group
    Refusal,
    /// Internal inconsistency
    Internal,
    /// An aggregate of errors of different kinds
    Mixed,
}

#[derive(Error, Debug)]
pub enum RdtError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("{0}")]
    BitmaskError(#[from] BitmaskError),

    #[error("invalid cache bitmask {value:?}: {reason}")]
    InvalidBitmask { value: String, reason: String },

    #[error("invalid percentage {0:?}")]
    InvalidPercentage(String),

    #[error("invalid basemask {base}: {reason}")]
    InvalidBaseMask { base: Bitmask, reason: String },

    #[error("bitmask {shifted} ({value} << {shift}) does not fit basemask {base}")]
    DoesNotFitBase {
        value: Bitmask,
        shift: u32,
        shifted: Bitmask,
        base: Bitmask,
    },

    #[error("BUG: not enough bits available for cache bitmask ({request} applied on basemask {base})")]
    InsufficientBits { request: String, base: Bitmask },

    #[error("partition {partition:?} missing {level} {schema_type} allocation request for cache id {id}")]
    InconsistentCdpRequest {
        partition: String,
        level: CacheLevel,
        schema_type: CatSchemaType,
        id: u64,
    },

    #[error("error resolving {level} allocation for cache id {id}: mixing relative and absolute allocations between partitions not supported")]
    MixedAllocationKind { level: CacheLevel, id: u64 },

    #[error("overlapping {level} partition allocation requests for cache id {id} (partition {partition:?})")]
    OverlappingPartitions {
        level: CacheLevel,
        id: u64,
        partition: String,
    },

    #[error("accumulated {level} {schema_type} partition allocation requests for cache id {id} exceeds 100% ({total}%)")]
    AllocationExceeds100Percent {
        level: CacheLevel,
        schema_type: CatSchemaType,
        id: u64,
        total: u64,
    },

    #[error("unable to resolve {level} allocation for cache id {id}, not enough exclusive bits available")]
    NotEnoughBits { level: CacheLevel, id: u64 },

    #[error("partition {partition:?} missing {level} allocation for cache id {id}")]
    MissingCacheIdAllocation {
        partition: String,
        level: CacheLevel,
        id: u64,
    },

    #[error("partition {partition:?} missing MB allocation for cache id {id}")]
    MissingMbCacheIdAllocation { partition: String, id: u64 },

    #[error("percentage ranges in partition allocation not supported (partition {0:?})")]
    PartitionRangeUnsupported(String),

    #[error("{resource} allocation missing from partition {partition:?} but class {class:?} specifies {resource} schema")]
    MissingPartitionAllocation {
        resource: String,
        partition: String,
        class: String,
    },

    #[error("class names must be unique, {0:?} defined multiple times")]
    DuplicateClass(String),

    #[error("class {class:?} refers to unknown partition {partition:?}")]
    UnknownPartition { class: String, partition: String },

    #[error("invalid class name {0:?}")]
    InvalidClassName(String),

    #[error("unknown RDT class {0:?}")]
    UnknownClass(String),

    #[error("RDT class {class:?} not allowed from {origin}")]
    AnnotationDenied { class: String, origin: String },

    #[error("missing '{unit}' value from MB allocation; required because {mode} memory bandwidth allocation is enabled in the system")]
    MissingRequiredUnit {
        unit: &'static str,
        mode: &'static str,
    },

    #[error("{resource} allocation specified in configuration but not supported by system")]
    UnsupportedButRequired { resource: String },

    #[error("refusing to remove non-empty resctrl group {0:?}")]
    RefusingToRemove(String),

    #[error("{op} {path}: {message}")]
    Io {
        op: &'static str,
        path: String,
        message: String,
        #[source]
        source: io::Error,
    },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),

    #[error("RDT not initialized")]
    NotInitialized,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<RdtError>,
    },

    #[error("{0}")]
    Multi(MultiError),
}

pub type Result<T> = std::result::Result<T, RdtError>;

impl RdtError {
    /// Filesystem error for an operation on a resctrl path
    pub fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.display().to_string(),
            message: source.to_string(),
            source,
        }
    }

    /// Filesystem error whose message is replaced by the kernel reported
    /// command status, if any
    pub fn io_with_status(
        op: &'static str,
        path: &Path,
        source: io::Error,
        status: Option<String>,
    ) -> Self {
        let message = status.unwrap_or_else(|| source.to_string());
        Self::Io {
            op,
            path: path.display().to_string(),
            message,
            source,
        }
    }

    /// Wrap the error with a context description
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigError(_)
            | Self::YamlError(_)
            | Self::BitmaskError(_)
            | Self::InvalidBitmask { .. }
            | Self::InvalidPercentage(_)
            | Self::MissingPartitionAllocation { .. }
            | Self::DuplicateClass(_)
            | Self::UnknownPartition { .. }
            | Self::InvalidClassName(_)
            | Self::UnknownClass(_)
            | Self::AnnotationDenied { .. }
            | Self::MissingRequiredUnit { .. } => ErrorKind::ConfigInvalid,

            Self::InvalidBaseMask { .. }
            | Self::DoesNotFitBase { .. }
            | Self::InconsistentCdpRequest { .. }
            | Self::MixedAllocationKind { .. }
            | Self::OverlappingPartitions { .. }
            | Self::AllocationExceeds100Percent { .. }
            | Self::NotEnoughBits { .. }
            | Self::MissingCacheIdAllocation { .. }
            | Self::MissingMbCacheIdAllocation { .. }
            | Self::PartitionRangeUnsupported(_) => ErrorKind::Resolution,

            Self::UnsupportedButRequired { .. } => ErrorKind::CapabilityUnsupported,

            Self::RefusingToRemove(_) => ErrorKind::Refusal,

            Self::Io { .. } | Self::ParseError(_) => ErrorKind::Filesystem,

            Self::InsufficientBits { .. } | Self::NotInitialized | Self::PrometheusError(_) => {
                ErrorKind::Internal
            }

            Self::Context { source, .. } => source.kind(),

            Self::Multi(multi) => multi.kind(),
        }
    }

    /// The innermost error below any context wrappers
    pub fn root_cause(&self) -> &RdtError {
        match self {
            Self::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Attach context to the error of a `Result`
pub(crate) trait ResultExt<T> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.context(f()))
    }
}

/// Accumulator for errors of independent operations
///
/// An empty `MultiError` means success.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<RdtError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: RdtError) {
        match err {
            RdtError::Multi(multi) => self.errors.extend(multi.errors),
            other => self.errors.push(other),
        }
    }

    /// Record the error of `result`, if any, and return its value
    pub fn check<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[RdtError] {
        &self.errors
    }

    /// Kind shared by all errors, `Mixed` if they differ
    pub fn kind(&self) -> ErrorKind {
        let mut kinds = self.errors.iter().map(RdtError::kind);
        match kinds.next() {
            Some(first) if kinds.all(|k| k == first) => first,
            Some(_) => ErrorKind::Mixed,
            None => ErrorKind::Internal,
        }
    }

    /// `Ok(())` if empty, the single error if there is one, otherwise the
    /// whole aggregate
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(RdtError::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for err in &self.errors {
            write!(f, "{sep}{err}")?;
            sep = "; ";
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_error_empty_is_success() {
        assert!(MultiError::new().into_result().is_ok());
    }

    #[test]
    fn test_multi_error_single_is_unwrapped() {
        let mut errs = MultiError::new();
        errs.push(RdtError::RefusingToRemove("grp".to_string()));

        let err = errs.into_result().unwrap_err();
        assert!(matches!(err, RdtError::RefusingToRemove(_)));
        assert_eq!(err.kind(), ErrorKind::Refusal);
    }

    #[test]
    fn test_multi_error_renders_all_messages() {
        let mut errs = MultiError::new();
        errs.push(RdtError::DuplicateClass("a".to_string()));
        errs.push(RdtError::RefusingToRemove("b".to_string()));
        assert_eq!(errs.len(), 2);
        assert_eq!(errs.kind(), ErrorKind::Mixed);

        let msg = errs.into_result().unwrap_err().to_string();
        assert!(msg.contains("\"a\" defined multiple times"));
        assert!(msg.contains("non-empty resctrl group \"b\""));
    }

    #[test]
    fn test_multi_error_flattens_nested() {
        let mut inner = MultiError::new();
        inner.push(RdtError::NotInitialized);
        inner.push(RdtError::NotInitialized);

        let mut outer = MultiError::new();
        outer.push(RdtError::Multi(inner));
        assert_eq!(outer.len(), 2);
        assert_eq!(outer.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_context_is_transparent_to_kind() {
        let err = RdtError::UnsupportedButRequired {
            resource: "L2".to_string(),
        }
        .context("class \"a\"");
        assert_eq!(err.kind(), ErrorKind::CapabilityUnsupported);
        assert_eq!(
            err.to_string(),
            "class \"a\": L2 allocation specified in configuration but not supported by system"
        );
        assert!(matches!(
            err.root_cause(),
            RdtError::UnsupportedButRequired { .. }
        ));
    }

    #[test]
    fn test_io_error_with_status() {
        let src = io::Error::from(io::ErrorKind::InvalidInput);
        let err = RdtError::io_with_status(
            "write",
            Path::new("grp/schemata"),
            src,
            Some("Bitmask not contiguous".to_string()),
        );
        assert_eq!(err.kind(), ErrorKind::Filesystem);
        assert_eq!(err.to_string(), "write grp/schemata: Bitmask not contiguous");
    }
}
