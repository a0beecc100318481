use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use rdtctl_raw::{LocalFs, ResctrlFs};

use super::ctrl::CtrlGroup;
use super::plan::{plan_reconcile, GroupAction};
use super::{ResctrlGroup, MON_DATA_DIR, MON_GROUPS_DIR, TASKS_FILE};
use crate::common::ResctrlInfo;
use crate::config::Config;
use crate::error::{MultiError, RdtError, Result};
use crate::resolver::{self, unalias_class_name, ResolvedConfig, ROOT_CLASS_NAME};

/// Directories of the resctrl root that are never control groups
const RESERVED_DIRS: &[&str] = &["info", MON_DATA_DIR, MON_GROUPS_DIR];

/// Handle to the RDT state of the system
///
/// Tracks the control groups of one prefix and the last applied
/// configuration. Callers serialize access, e.g. behind a mutex.
#[derive(Debug)]
pub struct RdtControl {
    info: Arc<ResctrlInfo>,
    fs: Arc<dyn ResctrlFs>,
    prefix: String,
    conf: Option<ResolvedConfig>,
    raw_conf: Option<Config>,
    classes: BTreeMap<String, CtrlGroup>,
}

impl RdtControl {
    /// Start tracking the existing groups with `prefix`
    pub fn initialize(info: ResctrlInfo, fs: Arc<dyn ResctrlFs>, prefix: &str) -> Result<Self> {
        let mut control = Self {
            info: Arc::new(info),
            fs,
            prefix: prefix.to_string(),
            conf: None,
            raw_conf: None,
            classes: BTreeMap::new(),
        };
        control.discover_classes(prefix)?;
        Ok(control)
    }

    /// Detect the resctrl filesystem from a mount table and initialize
    pub fn discover(mounts_path: &Path, prefix: &str) -> Result<Self> {
        let info = ResctrlInfo::discover(mounts_path)?;
        let fs = Arc::new(LocalFs::new(&info.resctrl_path));
        Self::initialize(info, fs, prefix)
    }

    pub fn info(&self) -> &ResctrlInfo {
        &self.info
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The last successfully applied configuration
    pub fn config(&self) -> Option<&ResolvedConfig> {
        self.conf.as_ref()
    }

    pub fn raw_config(&self) -> Option<&Config> {
        self.raw_conf.as_ref()
    }

    /// Resolve and apply a configuration
    ///
    /// Groups with the active prefix that are not configured are removed.
    /// Groups with processes are only removed if `force` is set.
    pub fn set_config(&mut self, conf: &Config, force: bool) -> Result<()> {
        tracing::info!("Configuring resctrl filesystem");
        let resolved = resolver::resolve(conf, &self.info)?;

        self.reconcile(&resolved, force)?;

        self.conf = Some(resolved);
        self.raw_conf = Some(conf.clone());
        tracing::info!("Configuration of resctrl filesystem finished");
        Ok(())
    }

    /// Parse and apply a YAML configuration
    pub fn set_config_from_str(&mut self, data: &str, force: bool) -> Result<()> {
        let conf = Config::from_yaml_str(data)?;
        self.set_config(&conf, force)
    }

    /// Read and apply a YAML configuration file
    pub fn set_config_from_file(&mut self, path: &Path, force: bool) -> Result<()> {
        let conf = Config::from_file(path)?;
        self.set_config(&conf, force)
    }

    fn reconcile(&mut self, conf: &ResolvedConfig, force: bool) -> Result<()> {
        let on_disk = self.classes_from_fs(&self.prefix)?;
        let tracked: BTreeMap<String, String> = self
            .classes
            .iter()
            .map(|(name, group)| (name.clone(), group.prefix().to_string()))
            .collect();
        let desired: BTreeSet<String> = conf.classes.keys().cloned().collect();

        let mut errs = MultiError::new();
        for action in plan_reconcile(&on_disk, &tracked, &desired, &self.prefix) {
            match action {
                // Removals fail fast, before anything is created or written
                GroupAction::Remove(name) => self.remove_stale(&name, force)?,
                GroupAction::Untrack(name) => {
                    tracing::debug!("No longer tracking class {:?}", name);
                    self.classes.remove(&name);
                }
                GroupAction::TrackRoot => {
                    tracing::warn!("Root class not tracked, adding it back");
                    if let Some(group) = errs.check(self.load_group(ROOT_CLASS_NAME)) {
                        self.classes.insert(ROOT_CLASS_NAME.to_string(), group);
                    }
                }
                GroupAction::Create(name) => {
                    let group = CtrlGroup::create(Arc::clone(&self.fs), &self.prefix, &self.prefix, &name);
                    if let Some(group) = errs.check(group) {
                        self.classes.insert(name, group);
                    }
                }
                GroupAction::Configure(name) => {
                    let (Some(group), Some(class)) = (self.classes.get(&name), conf.classes.get(&name))
                    else {
                        continue;
                    };
                    errs.check(group.configure(&class.schemata(&self.info)));
                }
            }
        }

        for group in self.classes.values_mut() {
            errs.check(group.prune_mon_groups());
        }

        errs.into_result()
    }

    fn remove_stale(&mut self, name: &str, force: bool) -> Result<()> {
        let group = CtrlGroup::untracked(Arc::clone(&self.fs), &self.prefix, name);
        let pids = group.pids()?;
        if !pids.is_empty() {
            if !force {
                return Err(RdtError::RefusingToRemove(format!("{}{}", self.prefix, name)));
            }
            tracing::warn!(
                "Removing class {:?} with {} processes assigned",
                name,
                pids.len()
            );
        }

        tracing::debug!("Removing stale class {:?}", name);
        let path = group.relpath("");
        self.fs
            .remove_group(&path)
            .map_err(|e| RdtError::io("remove", &self.fs.path(&path), e))?;
        self.classes.remove(name);
        Ok(())
    }

    fn load_group(&self, name: &str) -> Result<CtrlGroup> {
        CtrlGroup::load(Arc::clone(&self.fs), &self.prefix, &self.prefix, name)
    }

    /// Names of the classes with `prefix` on disk, always including the
    /// root class
    fn classes_from_fs(&self, prefix: &str) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::from([ROOT_CLASS_NAME.to_string()]);

        let entries = self
            .fs
            .read_dir_names(Path::new(""))
            .map_err(|e| RdtError::io("read", self.fs.root(), e))?;
        for entry in entries {
            if RESERVED_DIRS.contains(&entry.as_str()) {
                continue;
            }
            let Some(name) = entry.strip_prefix(prefix) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let dir = Path::new(&entry);
            if self.fs.is_dir(dir) && self.fs.is_file(&dir.join(TASKS_FILE)) {
                names.insert(name.to_string());
            }
        }
        Ok(names)
    }

    /// Track the on-disk groups with `prefix`
    ///
    /// Tracked groups that no longer exist are dropped. Empty monitoring
    /// groups are pruned.
    pub fn discover_classes(&mut self, prefix: &str) -> Result<()> {
        tracing::info!("Discovering classes with prefix {:?}", prefix);
        let on_disk = self.classes_from_fs(prefix)?;

        self.classes.retain(|name, _| on_disk.contains(name));

        let mut errs = MultiError::new();
        for name in on_disk {
            if self.classes.contains_key(&name) {
                continue;
            }
            let group = CtrlGroup::load(Arc::clone(&self.fs), prefix, &self.prefix, &name);
            if let Some(group) = errs.check(group) {
                self.classes.insert(name, group);
            }
        }

        for group in self.classes.values_mut() {
            errs.check(group.prune_mon_groups());
        }
        errs.into_result()
    }

    /// Tracked class by name, accepting the root class alias
    pub fn get_class(&self, name: &str) -> Option<&CtrlGroup> {
        self.classes.get(unalias_class_name(name))
    }

    pub fn get_class_mut(&mut self, name: &str) -> Option<&mut CtrlGroup> {
        self.classes.get_mut(unalias_class_name(name))
    }

    /// Tracked classes sorted by name
    pub fn classes(&self) -> impl Iterator<Item = &CtrlGroup> {
        self.classes.values()
    }

    /// True if L3 monitoring is available
    pub fn mon_supported(&self) -> bool {
        self.info.l3mon.supported()
    }

    /// Names of the available L3 monitoring features
    pub fn mon_features(&self) -> &[String] {
        &self.info.l3mon.mon_features
    }
}
