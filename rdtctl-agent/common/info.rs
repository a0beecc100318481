//! Capability discovery from the resctrl `info` directory

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use rdtctl_raw::{Bitmask, LocalFs, ResctrlFs};

use crate::error::{RdtError, Result};
use crate::named_enum;

/// Default location of the mount table
pub const MOUNTS_PATH: &str = "/proc/mounts";

/// Mount option enabling MBps based memory bandwidth allocation
pub const MBPS_MOUNT_OPTION: &str = "mba_MBps";

named_enum! {
    /// Cache level supporting cache allocation
    pub enum CacheLevel {
        L2 => "L2",
        L3 => "L3",
    }
}

/// Cache allocation facts of one schema type (unified, code or data)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatInfo {
    pub cbm_mask: Bitmask,
    pub min_cbm_bits: u64,
    pub shareable_bits: Bitmask,
}

impl CatInfo {
    const EMPTY: CatInfo = CatInfo {
        cbm_mask: Bitmask::new(0),
        min_cbm_bits: 0,
        shareable_bits: Bitmask::new(0),
    };

    pub fn new(cbm_mask: Bitmask, min_cbm_bits: u64) -> Self {
        Self {
            cbm_mask,
            min_cbm_bits,
            shareable_bits: Bitmask::new(0),
        }
    }

    /// True if allocation of this type is supported and enabled
    pub fn supported(&self) -> bool {
        !self.cbm_mask.is_empty()
    }
}

/// Cache allocation facts of one cache level
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatInfoAll {
    pub cache_ids: Vec<u64>,
    pub unified: CatInfo,
    pub code: CatInfo,
    pub data: CatInfo,
}

/// Returned for levels the system does not have
static NO_CAT: CatInfoAll = CatInfoAll {
    cache_ids: Vec::new(),
    unified: CatInfo::EMPTY,
    code: CatInfo::EMPTY,
    data: CatInfo::EMPTY,
};

impl CatInfoAll {
    /// Level with plain (non-CDP) cache allocation
    pub fn unified(cache_ids: Vec<u64>, cbm_mask: Bitmask, min_cbm_bits: u64) -> Self {
        Self {
            cache_ids,
            unified: CatInfo::new(cbm_mask, min_cbm_bits),
            ..Default::default()
        }
    }

    /// Level with code and data prioritization enabled
    pub fn cdp(cache_ids: Vec<u64>, cbm_mask: Bitmask, min_cbm_bits: u64) -> Self {
        Self {
            cache_ids,
            code: CatInfo::new(cbm_mask, min_cbm_bits),
            data: CatInfo::new(cbm_mask, min_cbm_bits),
            ..Default::default()
        }
    }

    fn effective(&self) -> &CatInfo {
        if self.code.supported() {
            &self.code
        } else if self.data.supported() {
            &self.data
        } else {
            &self.unified
        }
    }

    /// True if any kind of allocation is supported on this level
    pub fn supported(&self) -> bool {
        self.effective().supported()
    }

    /// True if the level is split into code and data allocations
    pub fn cdp_enabled(&self) -> bool {
        self.code.supported() || self.data.supported()
    }

    /// Full capacity bitmask. An unknown mask is treated as all ones.
    pub fn cbm_mask(&self) -> Bitmask {
        let mask = self.effective().cbm_mask;
        if mask.is_empty() {
            Bitmask::FULL
        } else {
            mask
        }
    }

    pub fn min_cbm_bits(&self) -> u64 {
        self.effective().min_cbm_bits
    }

    /// Number of allocatable bits, counted from bit 0
    pub fn num_bits(&self) -> u64 {
        self.cbm_mask().lsb_zero() as u64
    }
}

/// L3 cache monitoring facts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct L3MonInfo {
    pub num_rmids: u64,
    pub mon_features: Vec<String>,
}

impl L3MonInfo {
    pub fn supported(&self) -> bool {
        self.num_rmids != 0 && !self.mon_features.is_empty()
    }
}

/// Memory bandwidth allocation facts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MbInfo {
    pub cache_ids: Vec<u64>,
    pub bandwidth_gran: u64,
    pub delay_linear: u64,
    pub min_bandwidth: u64,
    pub mbps_enabled: bool,
}

impl MbInfo {
    /// Percentage based allocation
    pub fn percentage(cache_ids: Vec<u64>, min_bandwidth: u64) -> Self {
        Self {
            cache_ids,
            bandwidth_gran: 10,
            delay_linear: 1,
            min_bandwidth,
            mbps_enabled: false,
        }
    }

    /// MBps based allocation (the `mba_MBps` mount option)
    pub fn mbps(cache_ids: Vec<u64>, min_bandwidth: u64) -> Self {
        Self {
            mbps_enabled: true,
            ..Self::percentage(cache_ids, min_bandwidth)
        }
    }

    pub fn supported(&self) -> bool {
        self.min_bandwidth != 0
    }
}

/// Read-only description of the RDT capabilities of the system
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResctrlInfo {
    pub resctrl_path: PathBuf,
    pub mount_options: BTreeSet<String>,
    pub num_closids: u64,
    pub cat: BTreeMap<CacheLevel, CatInfoAll>,
    pub l3mon: L3MonInfo,
    pub mb: MbInfo,
}

impl ResctrlInfo {
    /// Empty descriptor for a resctrl filesystem mounted at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            resctrl_path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cat(mut self, lvl: CacheLevel, cat: CatInfoAll) -> Self {
        self.cat.insert(lvl, cat);
        self
    }

    pub fn with_mb(mut self, mb: MbInfo) -> Self {
        self.mb = mb;
        self
    }

    pub fn with_l3mon(mut self, l3mon: L3MonInfo) -> Self {
        self.l3mon = l3mon;
        self
    }

    /// Cache allocation facts of a level
    pub fn cat(&self, lvl: CacheLevel) -> &CatInfoAll {
        self.cat.get(&lvl).unwrap_or(&NO_CAT)
    }

    /// Detect the resctrl mount point from a mount table and read its
    /// capabilities
    pub fn discover(mounts_path: &Path) -> Result<Self> {
        let mounts = std::fs::read_to_string(mounts_path)
            .map_err(|e| RdtError::io("read", mounts_path, e))?;

        let (path, options) = parse_resctrl_mount(&mounts).ok_or_else(|| {
            RdtError::ParseError(format!(
                "resctrl not found in {}",
                mounts_path.display()
            ))
        })?;
        tracing::info!("Detected resctrl filesystem at {}", path.display());

        let fs = LocalFs::new(&path);
        Self::from_fs(&fs, options)
    }

    /// Read capabilities from a mounted resctrl filesystem
    pub fn from_fs(fs: &dyn ResctrlFs, mount_options: BTreeSet<String>) -> Result<Self> {
        let mut info = Self::new(fs.root());

        let info_dir = Path::new("info");
        if !fs.is_dir(info_dir) {
            return Err(RdtError::ParseError(format!(
                "RDT info directory {} not found",
                fs.path(info_dir).display()
            )));
        }

        for lvl in CacheLevel::all() {
            let mut cat = CatInfoAll::default();
            for (suffix, target) in [
                ("", &mut cat.unified),
                ("CODE", &mut cat.code),
                ("DATA", &mut cat.data),
            ] {
                let subpath = info_dir.join(format!("{}{}", lvl.name(), suffix));
                if fs.is_dir(&subpath) {
                    let (cat_info, num_closids) = read_cat_info(fs, &subpath)?;
                    *target = cat_info;
                    info.num_closids = num_closids;
                }
            }

            if cat.supported() {
                cat.cache_ids = read_cache_ids(fs, lvl.name())?;
                tracing::debug!("{} cache allocation supported, cache ids {:?}", lvl, cat.cache_ids);
            }
            info.cat.insert(lvl, cat);
        }

        let subpath = info_dir.join("L3_MON");
        if fs.is_dir(&subpath) {
            info.l3mon = L3MonInfo {
                num_rmids: read_u64(fs, &subpath.join("num_rmids"))?,
                mon_features: {
                    let mut features: Vec<String> = read_trimmed(fs, &subpath.join("mon_features"))?
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect();
                    features.sort();
                    features
                },
            };
        }

        let subpath = info_dir.join("MB");
        if fs.is_dir(&subpath) {
            info.mb = MbInfo {
                cache_ids: read_cache_ids(fs, "MB")?,
                bandwidth_gran: read_u64(fs, &subpath.join("bandwidth_gran"))?,
                delay_linear: read_u64(fs, &subpath.join("delay_linear"))?,
                min_bandwidth: read_u64(fs, &subpath.join("min_bandwidth"))?,
                // MBps mode is not visible in the info directory
                mbps_enabled: mount_options.contains(MBPS_MOUNT_OPTION),
            };
            info.num_closids = read_u64(fs, &subpath.join("num_closids"))?;
        }

        info.mount_options = mount_options;
        Ok(info)
    }
}

/// Find the resctrl mount point and its options from mount table contents
pub fn parse_resctrl_mount(mounts: &str) -> Option<(PathBuf, BTreeSet<String>)> {
    mounts.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() > 3 && fields[2] == "resctrl" {
            let options = fields[3].split(',').map(str::to_string).collect();
            Some((PathBuf::from(fields[1]), options))
        } else {
            None
        }
    })
}

fn read_cat_info(fs: &dyn ResctrlFs, dir: &Path) -> Result<(CatInfo, u64)> {
    let info = CatInfo {
        cbm_mask: read_bitmask(fs, &dir.join("cbm_mask"))?,
        min_cbm_bits: read_u64(fs, &dir.join("min_cbm_bits"))?,
        shareable_bits: read_bitmask(fs, &dir.join("shareable_bits"))?,
    };
    let num_closids = read_u64(fs, &dir.join("num_closids"))?;
    Ok((info, num_closids))
}

/// Parse the cache ids of a resource from the root schemata
fn read_cache_ids(fs: &dyn ResctrlFs, prefix: &str) -> Result<Vec<u64>> {
    let data = read_trimmed(fs, Path::new("schemata"))?;
    parse_cache_ids(&data, prefix)
}

fn parse_cache_ids(schemata: &str, prefix: &str) -> Result<Vec<u64>> {
    for line in schemata.lines() {
        let trimmed = line.trim();
        let Some((resource, schema)) = trimmed.split_once(':') else {
            continue;
        };
        if !resource.trim().starts_with(prefix) {
            continue;
        }

        let mut ids = Vec::new();
        for definition in schema.split(';') {
            let (id, _) = definition.split_once('=').ok_or_else(|| {
                RdtError::ParseError(format!("looks like an invalid schema {trimmed:?}"))
            })?;
            let id = id.trim().parse::<u64>().map_err(|e| {
                RdtError::ParseError(format!("failed to parse cache id in {trimmed:?}: {e}"))
            })?;
            ids.push(id);
        }
        return Ok(ids);
    }

    Err(RdtError::ParseError(format!(
        "no {prefix} resources in root schemata"
    )))
}

fn read_trimmed(fs: &dyn ResctrlFs, rel: &Path) -> Result<String> {
    fs.read_to_string(rel)
        .map(|s| s.trim().to_string())
        .map_err(|e| RdtError::io("read", &fs.path(rel), e))
}

fn read_u64(fs: &dyn ResctrlFs, rel: &Path) -> Result<u64> {
    let data = read_trimmed(fs, rel)?;
    data.parse().map_err(|e| {
        RdtError::ParseError(format!("invalid value {data:?} in {}: {e}", rel.display()))
    })
}

fn read_bitmask(fs: &dyn ResctrlFs, rel: &Path) -> Result<Bitmask> {
    let data = read_trimmed(fs, rel)?;
    Bitmask::from_hex_str(&data).map_err(|e| {
        RdtError::ParseError(format!("invalid bitmask in {}: {e}", rel.display()))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    /// Populate `root` with a resctrl tree: four L3 cache ids with a 20 bit
    /// mask, L3 monitoring and percentage based MBA
    pub(crate) fn create_mock_resctrl(root: &Path, cdp: bool) {
        let write = |rel: &str, data: &str| {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        };

        let cat_dirs: &[&str] = if cdp { &["L3CODE", "L3DATA"] } else { &["L3"] };
        for dir in cat_dirs {
            write(&format!("info/{dir}/cbm_mask"), "fffff\n");
            write(&format!("info/{dir}/min_cbm_bits"), "1\n");
            write(&format!("info/{dir}/shareable_bits"), "0\n");
            write(&format!("info/{dir}/num_closids"), "16\n");
        }
        write("info/L3_MON/num_rmids", "176\n");
        write(
            "info/L3_MON/mon_features",
            "mbm_total_bytes\nllc_occupancy\nmbm_local_bytes\n",
        );
        write("info/MB/bandwidth_gran", "10\n");
        write("info/MB/delay_linear", "1\n");
        write("info/MB/min_bandwidth", "10\n");
        write("info/MB/num_closids", "8\n");
        write("info/last_cmd_status", "ok\n");

        let l3 = if cdp {
            "L3CODE:0=fffff;1=fffff;2=fffff;3=fffff\nL3DATA:0=fffff;1=fffff;2=fffff;3=fffff\n"
        } else {
            "L3:0=fffff;1=fffff;2=fffff;3=fffff\n"
        };
        write("schemata", &format!("{l3}MB:0=100;1=100;2=100;3=100\n"));
        write("tasks", "1\n2\n");
        fs::create_dir_all(root.join("mon_groups")).unwrap();
    }

    #[test]
    fn test_parse_resctrl_mount() {
        let mounts = "sysfs /sys sysfs rw,nosuid 0 0\n\
                      resctrl /sys/fs/resctrl resctrl rw,relatime,mba_MBps 0 0\n";
        let (path, opts) = parse_resctrl_mount(mounts).unwrap();
        assert_eq!(path, PathBuf::from("/sys/fs/resctrl"));
        assert!(opts.contains(MBPS_MOUNT_OPTION));
        assert!(opts.contains("relatime"));

        assert!(parse_resctrl_mount("proc /proc proc rw 0 0\n").is_none());
    }

    #[test]
    fn test_parse_cache_ids() {
        let schemata = "    L3:0=fffff;1=fffff\n    MB:0=100;1=100;2=100\n";
        assert_eq!(parse_cache_ids(schemata, "L3").unwrap(), vec![0, 1]);
        assert_eq!(parse_cache_ids(schemata, "MB").unwrap(), vec![0, 1, 2]);
        assert!(parse_cache_ids(schemata, "L2").is_err());
        assert!(parse_cache_ids("L3:0fffff\n", "L3").is_err());
    }

    #[test]
    fn test_discover_from_fs() {
        let dir = tempfile::tempdir().unwrap();
        create_mock_resctrl(dir.path(), false);

        let fs = LocalFs::new(dir.path());
        let info = ResctrlInfo::from_fs(&fs, BTreeSet::new()).unwrap();

        let l3 = info.cat(CacheLevel::L3);
        assert!(l3.supported());
        assert!(!l3.cdp_enabled());
        assert_eq!(l3.cache_ids, vec![0, 1, 2, 3]);
        assert_eq!(l3.cbm_mask(), Bitmask::new(0xfffff));
        assert_eq!(l3.num_bits(), 20);
        assert_eq!(l3.min_cbm_bits(), 1);
        assert!(!info.cat(CacheLevel::L2).supported());

        assert!(info.l3mon.supported());
        assert_eq!(
            info.l3mon.mon_features,
            ["llc_occupancy", "mbm_local_bytes", "mbm_total_bytes"]
        );

        assert!(info.mb.supported());
        assert!(!info.mb.mbps_enabled);
        assert_eq!(info.mb.min_bandwidth, 10);
        assert_eq!(info.mb.cache_ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_discover_cdp_and_mbps() {
        let dir = tempfile::tempdir().unwrap();
        create_mock_resctrl(dir.path(), true);

        let fs = LocalFs::new(dir.path());
        let opts = BTreeSet::from([MBPS_MOUNT_OPTION.to_string()]);
        let info = ResctrlInfo::from_fs(&fs, opts).unwrap();

        let l3 = info.cat(CacheLevel::L3);
        assert!(l3.cdp_enabled());
        assert!(!l3.unified.supported());
        assert_eq!(l3.cache_ids, vec![0, 1, 2, 3]);
        assert!(info.mb.mbps_enabled);
    }

    #[test]
    fn test_discover_via_mount_table() {
        let dir = tempfile::tempdir().unwrap();
        let resctrl = dir.path().join("resctrl");
        create_mock_resctrl(&resctrl, false);

        let mounts = dir.path().join("mounts");
        fs::write(
            &mounts,
            format!("resctrl {} resctrl rw 0 0\n", resctrl.display()),
        )
        .unwrap();

        let info = ResctrlInfo::discover(&mounts).unwrap();
        assert_eq!(info.resctrl_path, resctrl);
        assert!(info.cat(CacheLevel::L3).supported());
    }

    #[test]
    fn test_missing_info_dir() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path());
        assert!(ResctrlInfo::from_fs(&fs, BTreeSet::new()).is_err());
    }

    #[test]
    fn test_missing_level() {
        let info = ResctrlInfo::new("/sys/fs/resctrl")
            .with_cat(CacheLevel::L3, CatInfoAll::unified(vec![0], Bitmask::new(0xff), 1));
        let l2 = info.cat(CacheLevel::L2);
        assert!(!l2.supported());
        assert!(l2.cache_ids.is_empty());
        assert!(std::ptr::eq(l2, ResctrlInfo::new("/x").cat(CacheLevel::L2)));
        assert!(info.cat(CacheLevel::L3).supported());
    }

    #[test]
    fn test_unknown_cbm_mask_is_full() {
        assert_eq!(CatInfoAll::default().cbm_mask(), Bitmask::FULL);
        assert_eq!(CatInfoAll::default().num_bits(), 64);
    }
}
