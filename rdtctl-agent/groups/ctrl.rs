use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rdtctl_raw::{last_cmd_status, ResctrlFs};

use super::{create_group_dir, ResctrlGroup, MON_GROUPS_DIR, SCHEMATA_FILE, TASKS_FILE};
use crate::error::{MultiError, RdtError, Result};
use crate::resolver::is_root_class;

/// A resctrl control group, the on-disk representation of a class
///
/// The root class maps to the resctrl root directory, every other class to
/// a `<prefix><name>` directory below it.
#[derive(Debug)]
pub struct CtrlGroup {
    fs: Arc<dyn ResctrlFs>,
    /// Prefix of the group directory
    prefix: String,
    /// Prefix of the monitoring group directories
    mon_prefix: String,
    name: String,
    mon_groups: BTreeMap<String, MonGroup>,
}

impl CtrlGroup {
    fn new(fs: Arc<dyn ResctrlFs>, prefix: &str, mon_prefix: &str, name: &str) -> Self {
        Self {
            fs,
            prefix: prefix.to_string(),
            mon_prefix: mon_prefix.to_string(),
            name: name.to_string(),
            mon_groups: BTreeMap::new(),
        }
    }

    /// Track an existing control group and its monitoring groups
    pub(crate) fn load(
        fs: Arc<dyn ResctrlFs>,
        prefix: &str,
        mon_prefix: &str,
        name: &str,
    ) -> Result<Self> {
        let mut group = Self::new(fs, prefix, mon_prefix, name);
        group.load_mon_groups()?;
        Ok(group)
    }

    /// Create the control group directory, unless it already exists
    pub(crate) fn create(
        fs: Arc<dyn ResctrlFs>,
        prefix: &str,
        mon_prefix: &str,
        name: &str,
    ) -> Result<Self> {
        let group = Self::new(fs, prefix, mon_prefix, name);
        if !is_root_class(name) {
            tracing::debug!("Creating resctrl group {}", group.dir_name());
            create_group_dir(group.fs.as_ref(), &group.relpath(""))?;
        }
        Self::load(group.fs, prefix, mon_prefix, name)
    }

    /// A group used only for inspecting an untracked directory
    pub(crate) fn untracked(fs: Arc<dyn ResctrlFs>, prefix: &str, name: &str) -> Self {
        Self::new(fs, prefix, prefix, name)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn dir_name(&self) -> String {
        format!("{}{}", self.prefix, self.name)
    }

    fn load_mon_groups(&mut self) -> Result<()> {
        let dir = self.relpath(MON_GROUPS_DIR);
        if !self.fs.is_dir(&dir) {
            return Ok(());
        }

        let names = self
            .fs
            .read_dir_names(&dir)
            .map_err(|e| RdtError::io("read", &self.fs.path(&dir), e))?;
        for dir_name in names {
            let Some(name) = dir_name.strip_prefix(self.mon_prefix.as_str()) else {
                continue;
            };
            if !self.fs.is_dir(&dir.join(&dir_name)) {
                continue;
            }
            let mg = MonGroup::new(self, name, BTreeMap::new());
            self.mon_groups.insert(name.to_string(), mg);
        }
        Ok(())
    }

    /// Replace the schemata of the group
    ///
    /// An empty schemata leaves the current one in place.
    pub(crate) fn configure(&self, schemata: &str) -> Result<()> {
        if schemata.is_empty() {
            tracing::debug!("Empty schemata for class {:?}, not writing", self.name);
            return Ok(());
        }

        let path = self.relpath(SCHEMATA_FILE);
        tracing::debug!("Writing schemata of class {:?}:\n{}", self.name, schemata);
        self.fs.write(&path, schemata.as_bytes()).map_err(|e| {
            RdtError::io_with_status("write", &self.fs.path(&path), e, last_cmd_status(self.fs.as_ref()))
        })
    }

    /// Remove the monitoring groups without any processes
    pub(crate) fn prune_mon_groups(&mut self) -> Result<()> {
        let mut errs = MultiError::new();
        let mut pruned = Vec::new();

        for (name, mg) in &self.mon_groups {
            let Some(pids) = errs.check(mg.pids()) else {
                continue;
            };
            if pids.is_empty() {
                tracing::debug!("Pruning empty monitoring group {:?} of class {:?}", name, self.name);
                let path = mg.relpath("");
                if let Err(e) = self.fs.remove_group(&path) {
                    errs.push(RdtError::io("remove", &self.fs.path(&path), e));
                    continue;
                }
                pruned.push(name.clone());
            }
        }

        for name in pruned {
            self.mon_groups.remove(&name);
        }
        errs.into_result()
    }

    /// Create a monitoring group, or return the existing one of the same name
    pub fn create_mon_group(
        &mut self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<&MonGroup> {
        let mg = MonGroup::new(self, name, annotations);
        match self.mon_groups.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(&*entry.into_mut()),
            Entry::Vacant(entry) => {
                create_group_dir(self.fs.as_ref(), &mg.relpath(""))?;
                Ok(&*entry.insert(mg))
            }
        }
    }

    /// Remove a monitoring group. Unknown groups are ignored.
    pub fn delete_mon_group(&mut self, name: &str) -> Result<()> {
        let Some(mg) = self.mon_groups.get(name) else {
            tracing::warn!("Monitoring group {:?} of class {:?} not found", name, self.name);
            return Ok(());
        };

        let path = mg.relpath("");
        self.fs
            .remove_group(&path)
            .map_err(|e| RdtError::io("remove", &self.fs.path(&path), e))?;
        self.mon_groups.remove(name);
        Ok(())
    }

    /// Remove all monitoring groups of the class
    pub fn delete_mon_groups(&mut self) -> Result<()> {
        let names: Vec<String> = self.mon_groups.keys().cloned().collect();
        let mut errs = MultiError::new();
        for name in names {
            errs.check(self.delete_mon_group(&name));
        }
        errs.into_result()
    }

    pub fn get_mon_group(&self, name: &str) -> Option<&MonGroup> {
        self.mon_groups.get(name)
    }

    /// Monitoring groups sorted by name
    pub fn mon_groups(&self) -> impl Iterator<Item = &MonGroup> {
        self.mon_groups.values()
    }
}

impl ResctrlGroup for CtrlGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn fs(&self) -> &dyn ResctrlFs {
        self.fs.as_ref()
    }

    fn relpath(&self, elem: &str) -> PathBuf {
        if is_root_class(&self.name) {
            PathBuf::from(elem)
        } else {
            Path::new(&self.dir_name()).join(elem)
        }
    }
}

/// A resctrl monitoring group below a control group
#[derive(Debug)]
pub struct MonGroup {
    fs: Arc<dyn ResctrlFs>,
    /// Directory of the group, relative to the resctrl root
    dir: PathBuf,
    name: String,
    parent: String,
    annotations: BTreeMap<String, String>,
}

impl MonGroup {
    fn new(parent: &CtrlGroup, name: &str, annotations: BTreeMap<String, String>) -> Self {
        let dir = parent
            .relpath(MON_GROUPS_DIR)
            .join(format!("{}{}", parent.mon_prefix, name));
        Self {
            fs: Arc::clone(&parent.fs),
            dir,
            name: name.to_string(),
            parent: parent.name.clone(),
            annotations,
        }
    }

    /// Name of the control group the monitoring group belongs to
    pub fn parent(&self) -> &str {
        &self.parent
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }
}

impl ResctrlGroup for MonGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn fs(&self) -> &dyn ResctrlFs {
        self.fs.as_ref()
    }

    fn relpath(&self, elem: &str) -> PathBuf {
        self.dir.join(elem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::tests::{write_mon_data, FaultyFs};
    use crate::resolver::ROOT_CLASS_NAME;
    use rdtctl_raw::LAST_CMD_STATUS;

    fn setup() -> (tempfile::TempDir, Arc<FaultyFs>) {
        let dir = tempfile::tempdir().unwrap();
        crate::common::info::tests::create_mock_resctrl(dir.path(), false);
        let fs = FaultyFs::new(dir.path());
        (dir, fs)
    }

    #[test]
    fn test_relpath() {
        let (_dir, fs) = setup();
        let root = CtrlGroup::untracked(fs.clone(), "rdt-", ROOT_CLASS_NAME);
        assert_eq!(root.relpath(TASKS_FILE), PathBuf::from("tasks"));

        let mut group = CtrlGroup::create(fs, "rdt-", "mon-", "gold").unwrap();
        assert_eq!(group.relpath(TASKS_FILE), PathBuf::from("rdt-gold/tasks"));

        let mg = group.create_mon_group("pod", BTreeMap::new()).unwrap();
        assert_eq!(
            mg.relpath(TASKS_FILE),
            PathBuf::from("rdt-gold/mon_groups/mon-pod/tasks")
        );
        assert_eq!(mg.parent(), "gold");
    }

    #[test]
    fn test_create_is_idempotent() {
        let (dir, fs) = setup();
        CtrlGroup::create(fs.clone(), "rdt-", "rdt-", "gold").unwrap();
        std::fs::write(dir.path().join("rdt-gold/tasks"), "42\n").unwrap();

        let group = CtrlGroup::create(fs, "rdt-", "rdt-", "gold").unwrap();
        assert_eq!(group.pids().unwrap(), ["42"]);
    }

    #[test]
    fn test_configure() {
        let (dir, fs) = setup();
        let group = CtrlGroup::create(fs.clone(), "", "", "gold").unwrap();

        group.configure("L3:0=ff\n").unwrap();
        let schemata = std::fs::read_to_string(dir.path().join("gold/schemata")).unwrap();
        assert_eq!(schemata, "L3:0=ff\n");

        // Nothing to write keeps the current schemata
        group.configure("").unwrap();
        let schemata = std::fs::read_to_string(dir.path().join("gold/schemata")).unwrap();
        assert_eq!(schemata, "L3:0=ff\n");

        fs.failing_writes.lock().insert(
            SCHEMATA_FILE.to_string(),
            "Bitmask not contiguous".to_string(),
        );
        let err = group.configure("L3:0=f0f\n").unwrap_err();
        assert!(err.to_string().ends_with(": Bitmask not contiguous"));
        let status = std::fs::read_to_string(dir.path().join(LAST_CMD_STATUS)).unwrap();
        assert_eq!(status.trim(), "Bitmask not contiguous");
    }

    #[test]
    fn test_mon_groups() {
        let (dir, fs) = setup();
        let mut group = CtrlGroup::create(fs.clone(), "rdt-", "rdt-", "gold").unwrap();

        let annotations = BTreeMap::from([("pod".to_string(), "nginx".to_string())]);
        group.create_mon_group("m1", annotations.clone()).unwrap();
        // Existing groups are returned as is
        let mg = group.create_mon_group("m1", BTreeMap::new()).unwrap();
        assert_eq!(mg.annotations(), &annotations);
        group.create_mon_group("m2", BTreeMap::new()).unwrap();
        assert!(dir.path().join("rdt-gold/mon_groups/rdt-m2").is_dir());

        let names: Vec<&str> = group.mon_groups().map(|mg| mg.name()).collect();
        assert_eq!(names, ["m1", "m2"]);

        write_mon_data(dir.path(), "rdt-gold/mon_groups/rdt-m2", 100);
        let data = group.get_mon_group("m2").unwrap().mon_data();
        assert_eq!(data.l3[&2]["llc_occupancy"], 121);

        group.delete_mon_group("m1").unwrap();
        group.delete_mon_group("unknown").unwrap();
        assert!(group.get_mon_group("m1").is_none());
        assert!(!dir.path().join("rdt-gold/mon_groups/rdt-m1").exists());

        group.delete_mon_groups().unwrap();
        assert_eq!(group.mon_groups().count(), 0);
    }

    #[test]
    fn test_create_existing_mon_group() {
        let (dir, fs) = setup();
        let mut group = CtrlGroup::create(fs.clone(), "rdt-", "rdt-", "gold").unwrap();

        let annotations = BTreeMap::from([("pod".to_string(), "nginx".to_string())]);
        group.create_mon_group("m1", annotations.clone()).unwrap();
        std::fs::write(dir.path().join("rdt-gold/mon_groups/rdt-m1/tasks"), "42\n").unwrap();

        let other = BTreeMap::from([("pod".to_string(), "redis".to_string())]);
        let mg = group.create_mon_group("m1", other).unwrap();
        assert_eq!(mg.annotations(), &annotations);
        assert_eq!(mg.relpath(""), Path::new("rdt-gold/mon_groups/rdt-m1"));
        // The directory of the existing group is left untouched
        assert_eq!(mg.pids().unwrap(), ["42"]);
        assert_eq!(group.mon_groups().count(), 1);
    }

    #[test]
    fn test_load_mon_groups() {
        let (dir, fs) = setup();
        for name in ["mon-a", "mon-b", "other-c"] {
            std::fs::create_dir_all(dir.path().join("mon_groups").join(name)).unwrap();
        }
        std::fs::write(dir.path().join("mon_groups/mon-file"), "").unwrap();

        let root = CtrlGroup::load(fs, "", "mon-", ROOT_CLASS_NAME).unwrap();
        let names: Vec<&str> = root.mon_groups().map(|mg| mg.name()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(
            root.get_mon_group("a").unwrap().relpath(""),
            PathBuf::from("mon_groups/mon-a/")
        );
    }

    #[test]
    fn test_prune_mon_groups() {
        let (dir, fs) = setup();
        let mut group = CtrlGroup::create(fs, "rdt-", "rdt-", "gold").unwrap();
        group.create_mon_group("busy", BTreeMap::new()).unwrap();
        group.create_mon_group("idle", BTreeMap::new()).unwrap();
        std::fs::write(dir.path().join("rdt-gold/mon_groups/rdt-busy/tasks"), "7\n").unwrap();

        group.prune_mon_groups().unwrap();
        let names: Vec<&str> = group.mon_groups().map(|mg| mg.name()).collect();
        assert_eq!(names, ["busy"]);
        assert!(!dir.path().join("rdt-gold/mon_groups/rdt-idle").exists());
    }
}
