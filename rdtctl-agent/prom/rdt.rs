use parking_lot::Mutex;
use prometheus::{GaugeVec, Opts, Registry};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::groups::{MonData, RdtControl, ResctrlGroup};

const LABELS: &[&str] = &["rdt_class", "rdt_mon_group", "cache_id"];

/// Exports the L3 monitoring counters of all tracked groups
///
/// Every monitoring feature of the system gets one gauge vector named
/// `rdt_<feature>`. Control group level data has an empty mon group label.
pub struct RdtMetricExporter {
    registry: Arc<Registry>,
    control: Arc<Mutex<RdtControl>>,
    gauges: Arc<BTreeMap<String, GaugeVec>>,
}

impl RdtMetricExporter {
    pub fn new(control: Arc<Mutex<RdtControl>>) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let features = control.lock().mon_features().to_vec();
        if features.is_empty() {
            tracing::warn!("No RDT monitoring features available, nothing to export");
        }

        let mut gauges = BTreeMap::new();
        for feature in features {
            let opts = Opts::new(
                format!("rdt_{feature}"),
                format!("RDT {feature} measurement"),
            );
            let gauge = GaugeVec::new(opts, LABELS)?;
            registry.register(Box::new(gauge.clone()))?;
            gauges.insert(feature, gauge);
        }

        Ok(Self {
            registry,
            control,
            gauges: Arc::new(gauges),
        })
    }

    fn update(control: &Mutex<RdtControl>, gauges: &BTreeMap<String, GaugeVec>) {
        // Groups come and go between refreshes
        for gauge in gauges.values() {
            gauge.reset();
        }

        let control = control.lock();
        for class in control.classes() {
            set_gauges(gauges, class.name(), "", &class.mon_data());
            for mg in class.mon_groups() {
                set_gauges(gauges, class.name(), mg.name(), &mg.mon_data());
            }
        }
    }

    async fn collect_loop(
        control: Arc<Mutex<RdtControl>>,
        gauges: Arc<BTreeMap<String, GaugeVec>>,
        period: Duration,
        cancel_token: CancellationToken,
    ) {
        tracing::info!("Starting RDT export loop, interval {:?}", period);

        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => Self::update(&control, &gauges),
                _ = cancel_token.cancelled() => break,
            }
        }

        tracing::info!("RDT export loop stopped");
    }

    /// Refresh the gauges every `period` until `cancel_token` is cancelled
    pub fn start(&self, period: Duration, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Self::collect_loop(
            Arc::clone(&self.control),
            Arc::clone(&self.gauges),
            period,
            cancel_token,
        ))
    }

    /// Collect metrics once
    pub fn collect(&self) {
        Self::update(&self.control, &self.gauges);
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }
}

fn set_gauges(gauges: &BTreeMap<String, GaugeVec>, class: &str, mon_group: &str, data: &MonData) {
    for (id, counters) in &data.l3 {
        let cache_id = id.to_string();
        for (feature, &value) in counters {
            match gauges.get(feature) {
                Some(gauge) => gauge
                    .with_label_values(&[class, mon_group, cache_id.as_str()])
                    .set(value as f64),
                None => tracing::debug!("Ignoring unknown monitoring feature {}", feature),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ResctrlInfo;
    use crate::groups::tests::write_mon_data;
    use crate::resolver::ROOT_CLASS_NAME;
    use rdtctl_raw::LocalFs;
    use std::collections::BTreeSet;

    fn exporter(dir: &tempfile::TempDir) -> RdtMetricExporter {
        crate::common::info::tests::create_mock_resctrl(dir.path(), false);
        write_mon_data(dir.path(), "", 0);
        std::fs::create_dir_all(dir.path().join("class-1/mon_groups/pod")).unwrap();
        std::fs::write(dir.path().join("class-1/tasks"), "").unwrap();
        write_mon_data(dir.path(), "class-1", 100);
        write_mon_data(dir.path(), "class-1/mon_groups/pod", 200);
        std::fs::write(dir.path().join("class-1/mon_groups/pod/tasks"), "42\n").unwrap();

        let fs = Arc::new(LocalFs::new(dir.path()));
        let info = ResctrlInfo::from_fs(fs.as_ref(), BTreeSet::new()).unwrap();
        let control = RdtControl::initialize(info, fs, "").unwrap();
        RdtMetricExporter::new(Arc::new(Mutex::new(control))).unwrap()
    }

    fn value(exporter: &RdtMetricExporter, feature: &str, labels: &[&str]) -> f64 {
        exporter.gauges[feature].with_label_values(labels).get()
    }

    #[test]
    fn test_register_features() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(&dir);

        assert_eq!(
            exporter.gauges.keys().collect::<Vec<_>>(),
            ["llc_occupancy", "mbm_local_bytes", "mbm_total_bytes"]
        );
        // Gauge vectors without samples are not gathered
        assert!(exporter.registry().gather().is_empty());
    }

    #[test]
    fn test_collect() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(&dir);
        exporter.collect();

        assert_eq!(
            value(&exporter, "llc_occupancy", &[ROOT_CLASS_NAME, "", "0"]),
            1.0
        );
        assert_eq!(
            value(&exporter, "mbm_total_bytes", &["class-1", "", "2"]),
            123.0
        );
        assert_eq!(
            value(&exporter, "mbm_local_bytes", &["class-1", "pod", "3"]),
            232.0
        );

        let families = exporter.registry().gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name()).collect();
        assert_eq!(
            names,
            ["rdt_llc_occupancy", "rdt_mbm_local_bytes", "rdt_mbm_total_bytes"]
        );
        // Root and class-1 groups plus the pod mon group, 4 cache ids each
        assert_eq!(families[0].get_metric().len(), 12);
    }

    #[test]
    fn test_collect_drops_removed_groups() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(&dir);
        exporter.collect();

        exporter
            .control
            .lock()
            .get_class_mut("class-1")
            .unwrap()
            .delete_mon_group("pod")
            .unwrap();
        exporter.collect();

        let families = exporter.registry().gather();
        assert_eq!(families[0].get_metric().len(), 8);
    }

    #[tokio::test]
    async fn test_start_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(&dir);
        let cancel_token = CancellationToken::new();

        let handle = exporter.start(Duration::from_millis(10), cancel_token.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_token.cancel();
        handle.await.unwrap();

        assert_eq!(
            value(&exporter, "llc_occupancy", &["class-1", "", "1"]),
            111.0
        );
    }
}
