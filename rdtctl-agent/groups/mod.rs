//! Resctrl control and monitoring groups and their reconciliation

mod control;
mod ctrl;
mod plan;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use rdtctl_raw::{last_cmd_status, ResctrlFs};

use crate::error::{RdtError, Result};

pub use control::RdtControl;
pub use ctrl::{CtrlGroup, MonGroup};
pub use plan::{plan_reconcile, GroupAction};

/// Directory holding the monitoring groups of a control group
pub const MON_GROUPS_DIR: &str = "mon_groups";

const TASKS_FILE: &str = "tasks";
const SCHEMATA_FILE: &str = "schemata";
const MON_DATA_DIR: &str = "mon_data";
const MON_L3_PREFIX: &str = "mon_L3_";

/// Monitoring counters of a group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonData {
    /// L3 counters per cache id, by feature name
    pub l3: BTreeMap<u64, BTreeMap<String, u64>>,
}

/// Operations common to control and monitoring groups
pub trait ResctrlGroup {
    /// Name of the group without any prefix
    fn name(&self) -> &str;

    fn fs(&self) -> &dyn ResctrlFs;

    /// Path of a file of the group, relative to the resctrl root
    fn relpath(&self, elem: &str) -> PathBuf;

    /// Process ids assigned to the group
    fn pids(&self) -> Result<Vec<String>> {
        let path = self.relpath(TASKS_FILE);
        let data = self
            .fs()
            .read_to_string(&path)
            .map_err(|e| RdtError::io("read", &self.fs().path(&path), e))?;

        Ok(data
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Assign processes to the group
    ///
    /// Every pid is written separately. Processes that have already exited
    /// are skipped.
    fn add_pids(&self, pids: &[String]) -> Result<()> {
        let path = self.relpath(TASKS_FILE);
        for pid in pids {
            match self.fs().append(&path, format!("{pid}\n").as_bytes()) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(Errno::ESRCH as i32) => {
                    tracing::debug!("No task {} found, not assigning to {}", pid, self.name());
                }
                Err(e) => {
                    return Err(RdtError::io_with_status(
                        "write",
                        &self.fs().path(&path),
                        e,
                        last_cmd_status(self.fs()),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Read the monitoring counters of the group
    ///
    /// Unreadable counters are logged and left out.
    fn mon_data(&self) -> MonData {
        let dir = self.relpath(MON_DATA_DIR);
        let names = match self.fs().read_dir_names(&dir) {
            Ok(names) => names,
            Err(e) => {
                tracing::error!("Failed to read monitoring data of {}: {}", self.name(), e);
                return MonData::default();
            }
        };

        let mut data = MonData::default();
        for name in names {
            let Some(id) = name
                .strip_prefix(MON_L3_PREFIX)
                .and_then(|id| id.parse::<u64>().ok())
            else {
                tracing::error!("Unrecognized monitoring data directory {:?}", name);
                continue;
            };
            data.l3.insert(id, read_counters(self.fs(), &dir.join(&name)));
        }
        data
    }
}

fn read_counters(fs: &dyn ResctrlFs, dir: &Path) -> BTreeMap<String, u64> {
    let mut counters = BTreeMap::new();
    let names = match fs.read_dir_names(dir) {
        Ok(names) => names,
        Err(e) => {
            tracing::error!("Failed to read {}: {}", fs.path(dir).display(), e);
            return counters;
        }
    };

    for name in names {
        let path = dir.join(&name);
        let value = fs
            .read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|s| s.trim().parse::<u64>().map_err(|e| e.to_string()));
        match value {
            Ok(value) => {
                counters.insert(name, value);
            }
            Err(e) => tracing::error!("Failed to read counter {}: {}", fs.path(&path).display(), e),
        }
    }
    counters
}

/// Create a group directory, succeeding if it already exists
fn create_group_dir(fs: &dyn ResctrlFs, rel: &Path) -> Result<()> {
    match fs.create_dir(rel) {
        Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => {
            Err(RdtError::io("create", &fs.path(rel), e))
        }
        _ => Ok(()),
    }
}
