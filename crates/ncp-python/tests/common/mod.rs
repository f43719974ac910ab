//! Shared setup for the bridge integration tests

use ncp_python::{BridgeConfig, Interpreter, ModuleHandle};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// The process-wide interpreter, with logging routed to the test writer
pub fn bridge() -> &'static Interpreter {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .compact()
        .try_init();

    let config = BridgeConfig {
        worker_threads: 4,
        traceback: true,
        ..BridgeConfig::default()
    };
    Interpreter::initialize(config).expect("interpreter starts")
}

pub fn fixture_path(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

/// Import a fixture module, reusing the handle other tests already hold
pub fn fixture_module(name: &str) -> ModuleHandle {
    bridge()
        .import_sync(&fixture_path(name), true)
        .expect("fixture imports")
}
