/*!
Test harness for the harvest engine

Wires a [`MockFleet`] to the real collector, parser and report builder
inside a temporary directory, so a whole harvest → parse → report cycle
runs without a cluster.
*/

use crate::fixtures::{capture_name, CaptureBuilder, TimingLogBuilder};
use crate::fleet_stub::{MockFleet, MockStacks};
use anyhow::Result;
use cirrus_harvester::collector::{Collector, HarvestSummary};
use cirrus_harvester::config::HarvestConfig;
use cirrus_harvester::parser::{ParsedTelemetry, Parser};
use cirrus_harvester::report::{self, ReportBuilder, ReportDocument};
use cirrus_harvester::topology::ClusterTopology;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Remote directory the fleet keeps captures in
pub const REMOTE_DIR: &str = "/var/log/collectl";

pub struct TestHarness {
    dir: TempDir,
    pub fleet: MockFleet,
    pub config: HarvestConfig,
    pub topology: ClusterTopology,
}

impl TestHarness {
    /// Harness over an empty cluster
    pub fn new() -> Result<Self> {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("cirrus_harvester=debug,cirrus_devkit=debug"))
            .with_test_writer()
            .try_init()
            .ok();

        let dir = tempfile::tempdir()?;
        let mut config = HarvestConfig::default();
        config.harvest.cache_dir = dir.path().join("cache");
        config.cluster.inventory = dir.path().join("bcbio.yaml");
        let topology = ClusterTopology::from_yaml(&format!(
            "name: bcbio\nknown_hosts_file: {}\n",
            dir.path().join("known_hosts").display()
        ))?;

        Ok(Self {
            dir,
            fleet: MockFleet::new(),
            config,
            topology,
        })
    }

    /// Replace the inventory with `(name, address)` nodes, the first one
    /// being the frontend
    pub fn with_nodes(mut self, nodes: &[(&str, &str)]) -> Result<Self> {
        let mut yaml = format!(
            "name: bcbio\nknown_hosts_file: {}\nnodes:\n",
            self.dir.path().join("known_hosts").display()
        );
        for (i, (name, address)) in nodes.iter().enumerate() {
            let role = if i == 0 { "frontend" } else { "compute" };
            let _ = writeln!(
                yaml,
                "  - {{ name: {name}, role: {role}, preferred_ip: \"{address}\", image_user: ubuntu, user_key_private: /keys/{name} }}"
            );
        }
        self.topology = ClusterTopology::from_yaml(&yaml)?;
        Ok(self)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.harvest.cache_dir
    }

    /// Put `capture` on `address`, named after its host and `opened_at`,
    /// stamped with the time of its newest sample
    pub fn place_capture(&self, address: &str, capture: &CaptureBuilder, opened_at: i64) -> Result<String> {
        let name = capture_name(capture.host(), opened_at);
        let modified = capture.last_sample().unwrap_or(opened_at);
        self.fleet
            .put_file(address, &format!("{REMOTE_DIR}/{name}"), capture.gzip()?, modified);
        Ok(name)
    }

    pub async fn harvest(&self) -> Result<HarvestSummary> {
        let collector = Collector::new(&self.topology, &self.fleet, &self.config);
        Ok(collector.run().await?)
    }

    pub async fn harvest_with_stacks(&self, stacks: &MockStacks) -> Result<HarvestSummary> {
        let collector =
            Collector::new(&self.topology, &self.fleet, &self.config).with_stack_directory(stacks);
        Ok(collector.run().await?)
    }

    pub fn write_timing_log(&self, log: &TimingLogBuilder) -> Result<PathBuf> {
        log.write_to(&self.dir.path().join("bcbio-nextgen.log"))
    }

    pub fn parse(&self, timing_log: &Path) -> Result<ParsedTelemetry> {
        Ok(Parser::new(timing_log, self.cache_dir()).run()?)
    }

    pub fn telemetry_report(&self, parsed: &ParsedTelemetry) -> ReportDocument {
        let mut builder = ReportBuilder::new();
        report::add_telemetry(&mut builder, parsed);
        builder.digest()
    }

    /// File names in the cache, sorted
    pub fn cached_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.cache_dir())? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_harvester::provider;

    const T0: i64 = 1425304800;

    fn three_nodes() -> TestHarness {
        TestHarness::new()
            .unwrap()
            .with_nodes(&[
                ("frontend001", "10.0.0.1"),
                ("compute001", "10.0.0.2"),
                ("compute002", "10.0.0.3"),
            ])
            .unwrap()
    }

    fn window_log(harness: &TestHarness, start: i64, end: i64) -> PathBuf {
        harness
            .write_timing_log(
                &TimingLogBuilder::new()
                    .noise(start - 60, "frontend001", "System YAML configuration: /mnt/work/c.yaml")
                    .checkpoint(start, "frontend001", "organize samples")
                    .checkpoint(start + 60, "frontend001", "alignment")
                    .checkpoint(end, "frontend001", "variant calling"),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_rerun_transfers_nothing_new() {
        let harness = three_nodes();
        for (host, address) in [("frontend001", "10.0.0.1"), ("compute001", "10.0.0.2")] {
            let capture = CaptureBuilder::new(host).steady(T0, 60, 5, 40);
            harness.place_capture(address, &capture, T0).unwrap();
        }

        let first = harness.harvest().await.unwrap();
        assert_eq!(first.downloaded(), 2);
        assert_eq!(first.keys_loaded, 3);

        let second = harness.harvest().await.unwrap();
        assert_eq!(second.downloaded(), 0);
        assert_eq!(second.skipped(), 2);
        assert_eq!(harness.fleet.downloads().len(), 2);
        assert_eq!(harness.fleet.keys_released(), 2);
    }

    #[tokio::test]
    async fn test_only_changed_captures_are_fetched() {
        let harness = three_nodes();
        let growing = CaptureBuilder::new("compute001").steady(T0, 60, 3, 40);
        harness.place_capture("10.0.0.2", &growing, T0).unwrap();
        let settled = CaptureBuilder::new("compute002").steady(T0, 60, 3, 40);
        harness.place_capture("10.0.0.3", &settled, T0).unwrap();
        harness.harvest().await.unwrap();
        harness.fleet.clear_records();

        // collectl appended to the current capture
        let grown = growing.steady(T0 + 240, 60, 3, 60);
        harness.place_capture("10.0.0.2", &grown, T0).unwrap();

        let summary = harness.harvest().await.unwrap();
        assert_eq!(summary.downloaded(), 1);
        assert_eq!(summary.hosts["compute001"].downloaded, 1);
        assert_eq!(summary.hosts["compute002"].skipped, 1);
        assert_eq!(
            harness.fleet.downloads(),
            vec![(
                "10.0.0.2".to_string(),
                format!("{REMOTE_DIR}/compute001-20150302-140000.raw.gz")
            )]
        );
    }

    #[tokio::test]
    async fn test_unreachable_node_is_isolated_and_recovered_by_rerun() {
        let harness = three_nodes();
        for (host, address) in [
            ("frontend001", "10.0.0.1"),
            ("compute001", "10.0.0.2"),
            ("compute002", "10.0.0.3"),
        ] {
            let capture = CaptureBuilder::new(host).steady(T0, 60, 2, 10);
            harness.place_capture(address, &capture, T0).unwrap();
        }
        harness.fleet.set_unreachable("10.0.0.2");

        let summary = harness.harvest().await.unwrap();
        assert_eq!(summary.failed_hosts(), vec!["compute001"]);
        assert_eq!(summary.downloaded(), 2);
        assert_eq!(harness.fleet.closed_sessions(), 2);
        assert_eq!(
            harness.cached_files().unwrap(),
            vec![
                "compute002-20150302-140000.raw.gz".to_string(),
                "frontend001-20150302-140000.raw.gz".to_string(),
            ]
        );

        harness.fleet.set_reachable("10.0.0.2");
        let rerun = harness.harvest().await.unwrap();
        assert!(rerun.failed_hosts().is_empty());
        assert_eq!(rerun.downloaded(), 1);
        assert_eq!(rerun.skipped(), 2);
    }

    #[tokio::test]
    async fn test_shared_filesystem_servers_go_through_nat() {
        let harness = three_nodes();
        harness.fleet.set_df_output(Some(
            "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
             10.0.9.9@tcp:/scratch 103081248 61440 97768544 1% /scratch\n",
        ));
        let capture = CaptureBuilder::new("OSS00").steady(T0, 60, 2, 80);
        harness.place_capture("10.0.9.10", &capture, T0).unwrap();
        let stacks = MockStacks::new("10.0.9.9@tcp", "bcbiolustre")
            .with_instance("NATDevice", "54.0.0.9")
            .with_instance("MDS00", "10.0.9.9")
            .with_instance("OSS00", "10.0.9.10");

        let summary = harness.harvest_with_stacks(&stacks).await.unwrap();
        assert!(summary.shared_fs_skipped.is_none());
        assert_eq!(summary.hosts["OSS00"].downloaded, 1);
        assert!(summary.hosts.contains_key("MDS00"));
        assert!(!summary.hosts.contains_key("NATDevice"));

        let connections = harness.fleet.connections();
        assert!(connections.contains(&("10.0.9.10".to_string(), Some("54.0.0.9".to_string()))));
        assert!(connections.contains(&("10.0.0.1".to_string(), None)));
        assert_eq!(harness.fleet.commands()[0].0, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_missing_mount_skips_shared_filesystem_pass() {
        let harness = three_nodes();
        let stacks = MockStacks::new("10.0.9.9@tcp", "bcbiolustre");

        let summary = harness.harvest_with_stacks(&stacks).await.unwrap();
        assert!(summary.shared_fs_skipped.is_some());
        assert!(summary.failed_hosts().is_empty());
    }

    #[tokio::test]
    async fn test_rows_outside_pipeline_window_are_dropped() {
        let harness = three_nodes();
        // samples from T0-120 to T0+720, window is T0..T0+600
        let capture = CaptureBuilder::new("compute001").steady(T0 - 120, 60, 14, 50);
        harness.place_capture("10.0.0.2", &capture, T0 - 120).unwrap();
        harness.harvest().await.unwrap();

        let parsed = harness.parse(&window_log(&harness, T0, T0 + 600)).unwrap();
        let series = &parsed.series["compute001"];
        assert_eq!(series.len(), 11);
        assert!(series.rows.iter().all(|r| (T0..=T0 + 600).contains(&r.timestamp)));
        assert!(series.column("cpu_pct").all(|v| (v - 50.0).abs() < 1e-9));
        assert_eq!(parsed.window.start(), T0);
        assert_eq!(parsed.window.end(), T0 + 600);
    }

    #[tokio::test]
    async fn test_rotated_captures_join_into_one_host_series() {
        let harness = three_nodes();
        let morning = CaptureBuilder::new("compute001").cpus(4).steady(T0 - 120, 60, 6, 50);
        let afternoon = CaptureBuilder::new("compute001").cpus(8).steady(T0 + 300, 60, 5, 20);
        harness.place_capture("10.0.0.2", &morning, T0 - 120).unwrap();
        harness.place_capture("10.0.0.2", &afternoon, T0 + 300).unwrap();
        harness.harvest().await.unwrap();

        let parsed = harness.parse(&window_log(&harness, T0, T0 + 600)).unwrap();
        assert_eq!(parsed.series.len(), 1);

        let series = &parsed.series["compute001"];
        let stamps: Vec<i64> = series.rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(
            stamps,
            vec![T0, T0 + 60, T0 + 120, T0 + 180, T0 + 240, T0 + 360, T0 + 420, T0 + 480, T0 + 540, T0 + 600]
        );
        let cpu: Vec<f64> = series.column("cpu_pct").collect();
        assert!((cpu[0] - 50.0).abs() < 1e-9);
        assert!((cpu[9] - 20.0).abs() < 1e-9);
        assert_eq!(parsed.hardware["compute001"].cpus, Some(8));
    }

    #[tokio::test]
    async fn test_capture_being_written_is_parsed() {
        let harness = three_nodes();
        let live = CaptureBuilder::new("compute001").cpus(8).steady(T0, 60, 5, 30);
        let name = capture_name(live.host(), T0);
        harness.fleet.put_file(
            "10.0.0.2",
            &format!("{REMOTE_DIR}/{name}"),
            live.gzip_in_progress().unwrap(),
            T0 + 300,
        );
        harness.harvest().await.unwrap();

        let parsed = harness.parse(&window_log(&harness, T0, T0 + 600)).unwrap();
        assert_eq!(parsed.series["compute001"].len(), 5);
        assert_eq!(parsed.hardware["compute001"].cpus, Some(8));
    }

    #[tokio::test]
    async fn test_corrupt_and_idle_captures_are_skipped() {
        let harness = three_nodes();
        harness
            .fleet
            .put_file("10.0.0.1", &format!("{REMOTE_DIR}/frontend001-20150302-140000.raw.gz"), b"truncated".to_vec(), T0);
        let idle = CaptureBuilder::new("compute002").steady(T0 - 7200, 60, 5, 30);
        harness.place_capture("10.0.0.3", &idle, T0 - 7200).unwrap();
        let busy = CaptureBuilder::new("compute001").steady(T0, 60, 5, 30);
        harness.place_capture("10.0.0.2", &busy, T0).unwrap();
        harness.harvest().await.unwrap();

        let parsed = harness.parse(&window_log(&harness, T0, T0 + 600)).unwrap();
        assert_eq!(parsed.series.keys().collect::<Vec<_>>(), vec!["compute001"]);
        assert!(!parsed.hardware.contains_key("compute002"));
    }

    #[tokio::test]
    async fn test_telemetry_report_schema() {
        let harness = three_nodes();
        let capture = CaptureBuilder::new("compute001").memory_kb(32_000).steady(T0, 60, 10, 70);
        harness.place_capture("10.0.0.2", &capture, T0).unwrap();
        harness.harvest().await.unwrap();

        let parsed = harness.parse(&window_log(&harness, T0, T0 + 600)).unwrap();
        let doc = harness.telemetry_report(&parsed);

        let usage = doc.section("usage").unwrap();
        assert_eq!(
            usage.field_names(),
            vec!["host", "samples", "cpu_mean", "cpu_peak", "mem_peak_kb"]
        );
        assert_eq!(usage.items().len(), 1);
        assert_eq!(usage.items()[0][0], "compute001");
        assert_eq!(usage.items()[0][4], 16_000.0);
        assert_eq!(doc.section("timing").unwrap().items().len(), 3);
        assert!(doc.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_empty_enrichment_keeps_sections() {
        let harness = three_nodes();
        let azure = provider::get("azure", &harness.config).unwrap();

        let doc = azure.information(&harness.topology).await;
        let names: Vec<_> = doc.sections().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["cluster", "sg", "instance"]);

        assert!(doc.section("sg").unwrap().items().is_empty());
        let instance = doc.section("instance").unwrap();
        assert!(instance.items().is_empty());
        assert_eq!(
            instance.field_names(),
            vec!["name", "type", "state", "ip", "placement"]
        );
        assert_eq!(doc.warnings(), ["No security groups defined.".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_timing_log_fails_parse() {
        let harness = three_nodes();
        let err = harness.parse(Path::new("/nonexistent/bcbio-nextgen.log"));
        assert!(err.is_err());
    }
}
