/*!
# upswake devkit - stubs and helpers for testing the orchestrator

- Fake NUT server speaking enough of the protocol for the real client
- Scripted telemetry and policy engines, recording UDP transport
- Rule directories and config builders backed by temp dirs
- A harness that drives the HTTP router without opening a socket
*/

pub mod nut_stub;
pub mod rule_helpers;
pub mod stubs;
pub mod test_utils;

pub use nut_stub::FakeNutServer;
pub use rule_helpers::{ConfigBuilder, RuleDir};
pub use stubs::{RecordingTransport, ScriptedPolicy, ScriptedTelemetry, StaticResolver};
pub use test_utils::TestHarness;
