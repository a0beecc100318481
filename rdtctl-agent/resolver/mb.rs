//! Memory bandwidth allocation resolution
//!
//! Unlike cache bits, memory bandwidth is not split between partitions:
//! every partition may request up to the full bandwidth.

use crate::common::MbInfo;

use super::normalize::MbRequest;
use super::schema::MbSchema;

/// Resolve the memory bandwidth granted to a partition
pub(crate) fn resolve_partition(request: &MbRequest, info: &MbInfo) -> MbSchema {
    let alloc = request
        .iter()
        .map(|(&id, &value)| {
            let value = if info.mbps_enabled {
                value
            } else {
                value.max(info.min_bandwidth)
            };
            (id, value)
        })
        .collect();
    MbSchema { alloc }
}

/// Resolve the memory bandwidth of a class relative to its partition
///
/// Percentages scale the partition grant. MBps values are capped by it.
/// Cache IDs the class does not request get the partition grant.
pub(crate) fn resolve_class(request: Option<&MbRequest>, grant: &MbSchema, info: &MbInfo) -> MbSchema {
    let alloc = grant
        .alloc
        .iter()
        .map(|(&id, &base)| {
            let requested = request.and_then(|r| r.get(&id)).copied();
            let value = if info.mbps_enabled {
                requested.unwrap_or(u64::from(u32::MAX)).min(base)
            } else {
                (requested.unwrap_or(100) * base / 100).max(info.min_bandwidth)
            };
            (id, value)
        })
        .collect();
    MbSchema { alloc }
}
