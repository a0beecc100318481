//! Resolution of a raw [`Config`] into per-class schemata
//!
//! Resolution is done in one pass and either produces a complete
//! [`ResolvedConfig`] or fails without side effects:
//!
//! 1. check that every declared resource is supported (or optional)
//! 2. check class names and class/partition consistency
//! 3. split the cache of each level between partitions, grant partition MB
//! 4. resolve every class relative to its partition

pub mod alloc;
mod cat;
mod mb;
mod normalize;
pub mod schema;

use std::collections::{BTreeMap, BTreeSet};

use crate::common::{CacheLevel, ResctrlInfo};
use crate::config::{ClassSpec, Config, KubernetesOptions, Options, PartitionSpec};
use crate::error::{RdtError, Result, ResultExt};

pub use alloc::CacheAllocation;
pub use normalize::{CatRequest, MbRequest};
pub use schema::{CatAllocation, CatSchema, CatSchemaType, MbSchema};

/// Name of the class mapped to the resctrl root group
pub const ROOT_CLASS_NAME: &str = "system/default";

/// Alternative name of the root class
pub const ROOT_CLASS_ALIAS: &str = "";

const MB_RESOURCE: &str = "MB";

/// True if `name` refers to the root class
pub fn is_root_class(name: &str) -> bool {
    name == ROOT_CLASS_NAME || name == ROOT_CLASS_ALIAS
}

/// Canonical name of a class, resolving the root class alias
pub fn unalias_class_name(name: &str) -> &str {
    if is_root_class(name) {
        ROOT_CLASS_NAME
    } else {
        name
    }
}

/// True if `name` can be used as a class name
///
/// Apart from the root class, names must be valid single path components.
pub fn is_qualified_class_name(name: &str) -> bool {
    if is_root_class(name) {
        return true;
    }
    name.len() < 4096 && name != "." && name != ".." && !name.contains(['/', '\n'])
}

/// Allocations granted to a partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionConfig {
    pub cat: BTreeMap<CacheLevel, CatSchema>,
    pub mb: Option<MbSchema>,
}

/// Fully resolved allocations of a class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassConfig {
    pub partition: String,
    pub cat: BTreeMap<CacheLevel, CatSchema>,
    pub mb: Option<MbSchema>,
    pub kubernetes: KubernetesOptions,
}

impl ClassConfig {
    /// Render the contents of the class' `schemata` file
    ///
    /// Cache levels come first, L2 before L3, followed by memory bandwidth.
    /// Returns an empty string if nothing is allocated.
    pub fn schemata(&self, info: &ResctrlInfo) -> String {
        let mut schemata = String::new();

        for lvl in CacheLevel::all() {
            let Some(schema) = self.cat.get(&lvl) else {
                continue;
            };
            let cat = info.cat(lvl);
            if cat.unified.supported() {
                schemata += &schema.to_schemata_line(CatSchemaType::Unified);
            } else if cat.cdp_enabled() {
                schemata += &schema.to_schemata_line(CatSchemaType::Code);
                schemata += &schema.to_schemata_line(CatSchemaType::Data);
            }
        }

        if let Some(mb) = &self.mb {
            if info.mb.supported() {
                schemata += &mb.to_schemata_line();
            }
        }

        schemata
    }
}

/// Configuration with all allocation requests resolved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub options: Options,
    pub partitions: BTreeMap<String, PartitionConfig>,
    /// Classes by canonical name
    pub classes: BTreeMap<String, ClassConfig>,
}

/// Resolve a configuration against the capabilities of the system
pub fn resolve(conf: &Config, info: &ResctrlInfo) -> Result<ResolvedConfig> {
    let active = check_support(conf, info)?;
    check_classes(conf)?;

    let mut partitions: BTreeMap<String, PartitionConfig> = conf
        .partitions
        .keys()
        .map(|name| (name.clone(), PartitionConfig::default()))
        .collect();

    for &lvl in &active.cat {
        let cat_info = info.cat(lvl);

        let mut parsed = Vec::with_capacity(conf.partitions.len());
        for (name, partition) in &conf.partitions {
            let req = normalize::parse_cat_request(
                partition.cat_allocation(lvl),
                lvl,
                &cat_info.cache_ids,
                cat_info.min_cbm_bits(),
            )
            .with_context(|| format!("failed to parse {lvl} allocation of partition {name:?}"))?;
            parsed.push((name.as_str(), req));
        }

        let requests = parsed.iter().map(|(name, req)| (*name, req.as_ref())).collect();
        for (name, grant) in cat::CacheResolver::new(lvl, cat_info, requests).resolve()? {
            if let Some(partition) = partitions.get_mut(&name) {
                partition.cat.insert(lvl, grant);
            }
        }
    }

    if active.mb {
        for (name, partition) in &conf.partitions {
            let req = normalize::parse_mb_request(
                partition.mb_allocation.as_ref(),
                &info.mb.cache_ids,
                info.mb.mbps_enabled,
            )
            .with_context(|| format!("failed to parse MB allocation of partition {name:?}"))?;

            if let (Some(req), Some(partition)) = (req, partitions.get_mut(name)) {
                if let Some(&id) = info.mb.cache_ids.iter().find(|&&id| !req.contains_key(&id)) {
                    return Err(RdtError::MissingMbCacheIdAllocation {
                        partition: name.clone(),
                        id,
                    });
                }
                partition.mb = Some(mb::resolve_partition(&req, &info.mb));
            }
        }
    }

    let mut classes = BTreeMap::new();
    for (pname, cname, spec) in conf.classes() {
        let partition = partitions.get(pname).ok_or_else(|| RdtError::UnknownPartition {
            class: cname.to_string(),
            partition: pname.to_string(),
        })?;
        let class = resolve_class(pname, partition, spec, info)
            .with_context(|| format!("failed to resolve class {cname:?}"))?;
        classes.insert(unalias_class_name(cname).to_string(), class);
    }

    let resolved = ResolvedConfig {
        options: conf.options,
        partitions,
        classes,
    };
    tracing::debug!("Resolved RDT configuration: {:?}", resolved);

    Ok(resolved)
}

/// Resources to resolve after dropping unsupported optional ones
struct ActiveResources {
    cat: Vec<CacheLevel>,
    mb: bool,
}

fn check_support(conf: &Config, info: &ResctrlInfo) -> Result<ActiveResources> {
    let mut active = ActiveResources {
        cat: Vec::new(),
        mb: false,
    };

    for lvl in CacheLevel::all() {
        let declared = declaring_entity(
            conf,
            |p| p.cat_allocation(lvl).is_some(),
            |c| c.cat_allocation(lvl).is_some(),
        );
        if info.cat(lvl).supported() {
            active.cat.push(lvl);
        } else if let Some(entity) = declared {
            unsupported(lvl.name(), conf.options.cat(lvl).optional, entity)?;
        }
    }

    let declared = declaring_entity(
        conf,
        |p| p.mb_allocation.is_some(),
        |c| c.mb_allocation.is_some(),
    );
    if info.mb.supported() {
        active.mb = true;
    } else if let Some(entity) = declared {
        unsupported(MB_RESOURCE, conf.options.mb.optional, entity)?;
    }

    Ok(active)
}

/// Where a resource is first declared
enum Entity<'a> {
    Partition,
    Class(&'a str),
}

fn declaring_entity<'a>(
    conf: &'a Config,
    partition: impl Fn(&PartitionSpec) -> bool,
    class: impl Fn(&ClassSpec) -> bool,
) -> Option<Entity<'a>> {
    if conf.partitions.values().any(partition) {
        return Some(Entity::Partition);
    }
    conf.classes()
        .find(|(_, _, spec)| spec.is_some_and(&class))
        .map(|(_, cname, _)| Entity::Class(cname))
}

fn unsupported(resource: &str, optional: bool, entity: Entity) -> Result<()> {
    if optional {
        tracing::info!(
            "{} allocation not supported by the system, ignoring optional configuration",
            resource
        );
        return Ok(());
    }

    let err = RdtError::UnsupportedButRequired {
        resource: resource.to_string(),
    };
    Err(match entity {
        Entity::Partition => err,
        Entity::Class(name) => err.context(format!("class {name:?}")),
    })
}

fn check_classes(conf: &Config) -> Result<()> {
    let mut names = BTreeSet::new();

    for (pname, cname, spec) in conf.classes() {
        if !is_qualified_class_name(cname) {
            return Err(RdtError::InvalidClassName(cname.to_string()));
        }
        if !names.insert(unalias_class_name(cname)) {
            return Err(RdtError::DuplicateClass(unalias_class_name(cname).to_string()));
        }

        let (Some(spec), Some(partition)) = (spec, conf.partitions.get(pname)) else {
            continue;
        };
        let missing = |resource: &str| RdtError::MissingPartitionAllocation {
            resource: resource.to_string(),
            partition: pname.to_string(),
            class: cname.to_string(),
        };
        for lvl in CacheLevel::all() {
            if spec.cat_allocation(lvl).is_some() && partition.cat_allocation(lvl).is_none() {
                return Err(missing(lvl.name()));
            }
        }
        if spec.mb_allocation.is_some() && partition.mb_allocation.is_none() {
            return Err(missing(MB_RESOURCE));
        }
    }

    Ok(())
}

fn resolve_class(
    pname: &str,
    partition: &PartitionConfig,
    spec: Option<&ClassSpec>,
    info: &ResctrlInfo,
) -> Result<ClassConfig> {
    let mut cat = BTreeMap::new();
    for (&lvl, grant) in &partition.cat {
        let cat_info = info.cat(lvl);
        let request = normalize::parse_cat_request(
            spec.and_then(|s| s.cat_allocation(lvl)),
            lvl,
            &cat_info.cache_ids,
            cat_info.min_cbm_bits(),
        )?;
        let schema = cat::resolve_class(request.as_ref(), grant, cat_info.min_cbm_bits())?;
        cat.insert(lvl, schema);
    }

    let mb = match &partition.mb {
        Some(grant) => {
            let request = normalize::parse_mb_request(
                spec.and_then(|s| s.mb_allocation.as_ref()),
                &info.mb.cache_ids,
                info.mb.mbps_enabled,
            )?;
            Some(mb::resolve_class(request.as_ref(), grant, &info.mb))
        }
        None => None,
    };

    Ok(ClassConfig {
        partition: pname.to_string(),
        cat,
        mb,
        kubernetes: spec.map(|s| s.kubernetes).unwrap_or_default(),
    })
}
