//! Cache allocation resolution for partitions and classes

use std::collections::BTreeMap;
use std::fmt::Write;

use rdtctl_raw::Bitmask;

use crate::common::{CacheLevel, CatInfoAll};
use crate::error::{RdtError, Result, ResultExt};

use super::alloc::CacheAllocation;
use super::normalize::CatRequest;
use super::schema::{CatAllocation, CatSchema, CatSchemaType};

/// Splits the cache of one level between partitions
///
/// Partitions are exclusive: for every cache ID and schema type the granted
/// bitmasks of different partitions never overlap.
pub(crate) struct CacheResolver<'a> {
    level: CacheLevel,
    ids: &'a [u64],
    min_bits: u64,
    bits_total: u64,
    /// Requests of all partitions in name order, `None` if not requested
    requests: Vec<(&'a str, Option<&'a CatRequest>)>,
    grants: BTreeMap<&'a str, CatSchema>,
}

impl<'a> CacheResolver<'a> {
    pub fn new(
        level: CacheLevel,
        info: &'a CatInfoAll,
        requests: Vec<(&'a str, Option<&'a CatRequest>)>,
    ) -> Self {
        let grants = requests
            .iter()
            .filter(|(_, req)| req.is_some())
            .map(|(name, _)| (*name, CatSchema::new(level)))
            .collect();

        Self {
            level,
            ids: &info.cache_ids,
            min_bits: info.min_cbm_bits(),
            bits_total: info.num_bits(),
            requests,
            grants,
        }
    }

    /// Resolve the granted bitmasks of all partitions requesting the level
    pub fn resolve(mut self) -> Result<BTreeMap<String, CatSchema>> {
        for (name, req) in &self.requests {
            let Some(req) = req else { continue };
            if let Some(&id) = self.ids.iter().find(|&&id| !req.contains_key(&id)) {
                return Err(RdtError::MissingCacheIdAllocation {
                    partition: name.to_string(),
                    level: self.level,
                    id,
                });
            }
        }

        for &id in self.ids {
            for typ in CatSchemaType::all() {
                tracing::debug!(
                    "Resolving {} {} partition allocations for cache id {}",
                    self.level,
                    typ,
                    id
                );
                self.resolve_type(id, typ)?;
            }
        }

        if !self.grants.is_empty() {
            self.log_summary();
        }

        Ok(self
            .grants
            .into_iter()
            .map(|(name, grant)| (name.to_string(), grant))
            .collect())
    }

    fn request(&self, name: &str, id: u64, typ: CatSchemaType) -> Option<CacheAllocation> {
        self.requests
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, req)| *req)
            .and_then(|req| req.get(&id))
            .and_then(|alloc| alloc.get(typ))
    }

    fn resolve_type(&mut self, id: u64, typ: CatSchemaType) -> Result<()> {
        let slot: Vec<(&'a str, Option<CacheAllocation>)> = self
            .requests
            .iter()
            .map(|(name, _)| (*name, self.request(name, id, typ)))
            .collect();

        // All or none of the partitions must request this type
        if slot.iter().any(|(_, a)| a.is_some()) {
            if let Some((name, _)) = slot.iter().find(|(_, a)| a.is_none()) {
                return Err(RdtError::InconsistentCdpRequest {
                    partition: name.to_string(),
                    level: self.level,
                    schema_type: typ,
                    id,
                });
            }
        }

        let requests: Vec<(&'a str, CacheAllocation)> = slot
            .into_iter()
            .filter_map(|(name, a)| a.map(|a| (name, a)))
            .collect();

        match requests.first() {
            None => Ok(()),
            Some((_, first)) if first.is_absolute() => self.resolve_absolute(id, typ, &requests),
            Some(_) => self.resolve_relative(id, typ, &requests),
        }
    }

    fn resolve_absolute(
        &mut self,
        id: u64,
        typ: CatSchemaType,
        requests: &[(&'a str, CacheAllocation)],
    ) -> Result<()> {
        let mut mask = Bitmask::new(0);
        for &(name, req) in requests {
            let CacheAllocation::Absolute(value) = req else {
                return Err(RdtError::MixedAllocationKind {
                    level: self.level,
                    id,
                });
            };
            if value.overlaps(mask) {
                return Err(RdtError::OverlappingPartitions {
                    level: self.level,
                    id,
                    partition: name.to_string(),
                });
            }
            mask |= value;
            self.grant(name, id, typ, value);
        }
        Ok(())
    }

    fn resolve_relative(
        &mut self,
        id: u64,
        typ: CatSchemaType,
        requests: &[(&'a str, CacheAllocation)],
    ) -> Result<()> {
        let mut pct_total = 0u64;
        let mut reqs: Vec<(&'a str, u64)> = Vec::with_capacity(requests.len());
        for &(name, req) in requests {
            match req {
                CacheAllocation::Percentage(pct) => {
                    pct_total += pct;
                    reqs.push((name, pct));
                }
                CacheAllocation::Absolute(_) => {
                    return Err(RdtError::MixedAllocationKind {
                        level: self.level,
                        id,
                    })
                }
                CacheAllocation::PercentageRange { .. } => {
                    return Err(RdtError::PartitionRangeUnsupported(name.to_string()))
                }
            }
        }

        if pct_total > 100 {
            return Err(RdtError::AllocationExceeds100Percent {
                level: self.level,
                schema_type: typ,
                id,
                total: pct_total,
            });
        } else if pct_total < 100 {
            tracing::info!(
                "Requested total {} {} partition allocation for cache id {} <100% ({}%)",
                self.level,
                typ,
                id,
                pct_total
            );
        }

        // Smallest requests first so that rounding up to the minimum number
        // of bits does not starve the last ones. Ties stay in name order.
        reqs.sort_by_key(|(_, pct)| *pct);

        let bits_total = pct_total * self.bits_total / 100;
        let mut bits_available = bits_total;
        let mut lsb = 0u64;
        for (i, &(name, pct)) in reqs.iter().enumerate() {
            if bits_available == 0 || bits_available < self.min_bits {
                return Err(RdtError::NotEnoughBits {
                    level: self.level,
                    id,
                });
            }
            let pct_available = (bits_available * pct_total / bits_total).max(1);

            // Integer arithmetic rounds down, avoiding over-allocation
            let mut num_bits = (pct * bits_available / pct_available).max(self.min_bits);
            if num_bits > bits_available || i == reqs.len() - 1 {
                num_bits = bits_available;
            }

            self.grant(name, id, typ, Bitmask::from_range(lsb as u32, num_bits as u32));
            lsb += num_bits;
            bits_available -= num_bits;
        }

        Ok(())
    }

    fn grant(&mut self, name: &str, id: u64, typ: CatSchemaType, mask: Bitmask) {
        if let Some(grant) = self.grants.get_mut(name) {
            grant.alloc.entry(id).or_default().set(typ, mask);
        }
    }

    fn log_summary(&self) {
        let mut summary = String::new();
        for (name, req) in &self.requests {
            let (Some(req), Some(grant)) = (req, self.grants.get(name)) else {
                continue;
            };
            let _ = write!(summary, "\n    {name}");
            for id in self.ids {
                let _ = write!(summary, "\n      {id:2}: ");
                for typ in CatSchemaType::all() {
                    let requested = req.get(id).and_then(|a| a.get(typ));
                    let granted = grant.alloc.get(id).and_then(|a| a.get(typ));
                    let _ = match (requested, granted) {
                        (Some(CacheAllocation::Percentage(pct)), Some(mask)) => {
                            let actual =
                                f64::from(mask.count_ones()) * 100.0 / self.bits_total as f64;
                            write!(summary, "{typ} {actual:5.1}% ({pct}%)  ")
                        }
                        (Some(req), _) => write!(summary, "{typ} <absolute {req}>  "),
                        (None, _) => write!(summary, "{typ} <not specified>  "),
                    };
                }
            }
        }
        tracing::info!(
            "Actual (and requested) {} allocations per partition and cache id:{}",
            self.level,
            summary
        );
    }
}

/// Resolve the cache allocation of a class relative to its partition
///
/// Cache IDs or schema types the class does not request get the full
/// partition grant.
pub(crate) fn resolve_class(
    request: Option<&CatRequest>,
    grant: &CatSchema,
    min_bits: u64,
) -> Result<CatSchema> {
    let mut schema = CatSchema::new(grant.level);

    for (&id, partition_alloc) in &grant.alloc {
        let class_alloc = request.and_then(|r| r.get(&id));
        let mut resolved = CatAllocation::default();

        for typ in CatSchemaType::all() {
            let Some(base) = partition_alloc.get_effective(typ) else {
                continue;
            };
            let mask = match class_alloc.and_then(|a| a.get_effective(typ)) {
                Some(req) => req.overlay(base, min_bits).with_context(|| {
                    format!("{} {} allocation for cache id {}", grant.level, typ, id)
                })?,
                None => base,
            };
            resolved.set(typ, mask);
        }
        schema.alloc.insert(id, resolved);
    }

    Ok(schema)
}
