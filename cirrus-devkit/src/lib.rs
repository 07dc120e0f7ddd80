/*!
# Cirrus DevKit - Stubs and fixtures for harvest development

Lets the harvest engine run end to end without a cluster:
- An in-memory fleet implementing the session `Connector`
- A stack directory stub for the shared filesystem pass
- Builders for gzip collectl captures and pipeline timing logs
- A harness wiring them to the collector, parser and report builder
*/

pub mod fixtures;
pub mod fleet_stub;
pub mod test_utils;

pub use fixtures::{capture_name, CaptureBuilder, TimingLogBuilder};
pub use fleet_stub::{MockFleet, MockStacks};
pub use test_utils::TestHarness;
