//! Lowering of raw allocation values into typed per cache-ID requests
//!
//! Shorthands: a bare value means `{all: value}` and a bare string as a
//! cache allocation means `{unified: value}`. Cache-ID keys accept integer
//! lists such as `0,1` or `2-3`.

use std::collections::BTreeMap;

use rdtctl_raw::parse_int_list;

use crate::common::CacheLevel;
use crate::config::RawValue;
use crate::error::{RdtError, Result};

use super::alloc::CacheAllocation;
use super::schema::{CatAllocation, CatSchemaType};

/// Cache allocation requests of one level, per cache ID
pub type CatRequest = BTreeMap<u64, CatAllocation<CacheAllocation>>;

/// Memory bandwidth requests (percentages or MBps), per cache ID
pub type MbRequest = BTreeMap<u64, u64>;

const MB_SUFFIX_PCT: &str = "%";
const MB_SUFFIX_MBPS: &str = "MBps";

/// Assign a raw value to each cache ID
///
/// Returns `None` if nothing was requested. Without an `all` key only the
/// listed cache IDs are present in the result. Keys naming cache IDs the
/// system does not have are ignored.
pub(crate) fn preparse<'a>(
    raw: Option<&'a RawValue>,
    ids: &[u64],
) -> Result<Option<BTreeMap<u64, &'a RawValue>>> {
    let raw = match raw {
        None | Some(RawValue::Null) => return Ok(None),
        Some(raw) => raw,
    };

    let mut values = BTreeMap::new();
    match raw {
        RawValue::Str(_) | RawValue::List(_) => {
            for &id in ids {
                values.insert(id, raw);
            }
        }
        RawValue::Map(map) => {
            if let Some(all) = map.get("all") {
                for &id in ids {
                    values.insert(id, all);
                }
            }
            for (key, value) in map {
                if key == "all" {
                    continue;
                }
                for id in parse_int_list(key)? {
                    if ids.contains(&id) {
                        values.insert(id, value);
                    }
                }
            }
        }
        other => {
            return Err(RdtError::ConfigError(format!(
                "invalid structure of allocation schema {other}"
            )))
        }
    }

    Ok(Some(values))
}

/// Parse a cache allocation value of a partition or a class
pub(crate) fn parse_cat_request(
    raw: Option<&RawValue>,
    level: CacheLevel,
    ids: &[u64],
    min_bits: u64,
) -> Result<Option<CatRequest>> {
    if let Some(RawValue::List(_)) = raw {
        return Err(RdtError::ConfigError(format!(
            "invalid structure of {level} schema, a list is not accepted"
        )));
    }

    let Some(values) = preparse(raw, ids)? else {
        return Ok(None);
    };

    let mut request = CatRequest::new();
    for (id, value) in values {
        request.insert(id, parse_cat_allocation(value, level, min_bits)?);
    }
    Ok(Some(request))
}

fn parse_cat_allocation(
    raw: &RawValue,
    level: CacheLevel,
    min_bits: u64,
) -> Result<CatAllocation<CacheAllocation>> {
    let mut alloc = CatAllocation::default();

    match raw {
        RawValue::Str(s) => {
            alloc.unified = Some(CacheAllocation::parse(s, level, min_bits)?);
        }
        RawValue::Map(map) => {
            for (key, value) in map {
                let typ = CatSchemaType::all()
                    .into_iter()
                    .find(|t| t.name() == key.to_lowercase())
                    .ok_or_else(|| {
                        RdtError::ConfigError(format!(
                            "unknown schema type {key:?} in {level} schema"
                        ))
                    })?;
                let s = value.as_str().ok_or_else(|| {
                    RdtError::ConfigError(format!("not a string value {value}"))
                })?;
                alloc.set(typ, CacheAllocation::parse(s, level, min_bits)?);
            }
        }
        other => {
            return Err(RdtError::ConfigError(format!(
                "invalid structure of {level} schema {other}"
            )))
        }
    }

    if alloc.unified.is_none() {
        return Err(RdtError::ConfigError(format!(
            "'unified' not specified in {level} schema {raw}"
        )));
    }
    match (alloc.code.is_some(), alloc.data.is_some()) {
        (true, false) => Err(RdtError::ConfigError(format!(
            "'code' specified but missing 'data' from {level} schema {raw}"
        ))),
        (false, true) => Err(RdtError::ConfigError(format!(
            "'data' specified but missing 'code' from {level} schema {raw}"
        ))),
        _ => Ok(alloc),
    }
}

/// Parse a memory bandwidth allocation value of a partition or a class
///
/// Only values in the unit of the active allocation mode are honored.
pub(crate) fn parse_mb_request(
    raw: Option<&RawValue>,
    ids: &[u64],
    mbps_enabled: bool,
) -> Result<Option<MbRequest>> {
    let Some(values) = preparse(raw, ids)? else {
        return Ok(None);
    };

    let mut request = MbRequest::new();
    for (id, value) in values {
        let items = match value {
            RawValue::List(items) => items.as_slice(),
            single @ RawValue::Str(_) => std::slice::from_ref(single),
            other => {
                return Err(RdtError::ConfigError(format!(
                    "invalid structure of MB schema {other}"
                )))
            }
        };
        request.insert(id, parse_mb_allocation(items, mbps_enabled)?);
    }
    Ok(Some(request))
}

fn parse_mb_allocation(items: &[RawValue], mbps_enabled: bool) -> Result<u64> {
    for item in items {
        let Some(s) = item.as_str() else {
            tracing::warn!("Ignoring non-string MB allocation {}", item);
            continue;
        };
        let s = s.trim();

        if let Some(pct) = s.strip_suffix(MB_SUFFIX_PCT) {
            if mbps_enabled {
                tracing::warn!("Ignoring MB allocation {:?}, MBps mode is enabled", s);
                continue;
            }
            return match pct.parse::<u64>() {
                Ok(value) if value <= 100 => Ok(value),
                _ => Err(RdtError::InvalidPercentage(s.to_string())),
            };
        } else if let Some(mbps) = s.strip_suffix(MB_SUFFIX_MBPS) {
            if !mbps_enabled {
                tracing::warn!(
                    "Ignoring MB allocation {:?}, percentage mode is enabled",
                    s
                );
                continue;
            }
            return mbps
                .parse::<u32>()
                .map(u64::from)
                .map_err(|e| RdtError::ConfigError(format!("invalid MBps value {s:?}: {e}")));
        } else {
            tracing::warn!("Unrecognized MB allocation unit in {:?}", s);
        }
    }

    if mbps_enabled {
        Err(RdtError::MissingRequiredUnit {
            unit: MB_SUFFIX_MBPS,
            mode: "MBps based ('mba_MBps')",
        })
    } else {
        Err(RdtError::MissingRequiredUnit {
            unit: MB_SUFFIX_PCT,
            mode: "percentage based",
        })
    }
}
