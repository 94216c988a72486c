//! Integration tests for graceful shutdown behavior.

use crysdaq::config::{Config, DeviceConfig, FieldMapping, LimitsConfig, ProtocolConfig};
use crysdaq::device::shared_pair;
use crysdaq::dispatcher::Dispatcher;
use crysdaq::measurement::{
    ActivityLog, BroadcastSink, CollectingLog, CollectingSink, LogActivity, MeasurementSink,
    RunClock,
};
use crysdaq::protocol::build_decoder;
use crysdaq::registry::PortRegistry;
use crysdaq::sampler::Sampler;
use crysdaq::transport::MockTransport;
use crysdaq::{Console, ConsoleError};
use std::sync::Arc;
use std::time::Duration;

/// Console configuration with two mock devices on separate ports.
fn test_config() -> Config {
    let toml_str = r#"
        [application]
        name = "crysdaq test"
        log_level = "info"

        [dispatcher]
        tick_interval = "20ms"
        shutdown_timeout = "1s"

        [[ports]]
        id = "line_a"
        kind = "mock"

        [[ports]]
        id = "line_b"
        kind = "mock"

        [[devices]]
        id = "furnace"
        port = "line_a"
        poll_interval_secs = 0.05

        [devices.protocol]
        type = "framed_ascii"
        fields = [{ index = 0, name = "T" }]

        [[devices]]
        id = "rotation"
        port = "line_b"
        poll_interval_secs = 0.05

        [devices.protocol]
        type = "framed_ascii"
        fields = [{ index = 0, name = "speed" }]

        [devices.recipe]
        setpoint = "speed_sp"
        feedback = "speed"
        steps = ["60 ; 2.0 ; s"]
    "#;
    toml::from_str(toml_str).expect("failed to parse test config")
}

fn build_console(config: Config) -> Console {
    let (sink, _rx) = BroadcastSink::new(64);
    Console::new(config, Arc::new(sink), Arc::new(LogActivity)).expect("failed to build console")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_completes_without_hanging() {
    let mut console = build_console(test_config());
    console.connect().await.unwrap();
    console.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = std::time::Instant::now();
    console.shutdown().await;
    let elapsed = start.elapsed();

    // Should finish well within the 1 s confirmation timeout plus margin.
    assert!(elapsed < Duration::from_secs(2), "shutdown took {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multiple_shutdown_calls_are_safe() {
    let mut console = build_console(test_config());
    console.connect().await.unwrap();
    console.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    console.shutdown().await;
    // Second shutdown is a no-op.
    console.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_before_start_works() {
    let mut console = build_console(test_config());
    console.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recipe_control_through_console() {
    let mut console = build_console(test_config());
    console.connect().await.unwrap();
    console.start();

    console.start_recipe("rotation").unwrap();
    assert!(console.recipe("rotation").unwrap().is_running());

    // A recipe start on a device without a recipe table is refused.
    assert!(console.start_recipe("furnace").is_err());

    // Switching control modes aborts the run.
    console.set_external_mode("rotation", true).unwrap();
    assert!(!console.recipe("rotation").unwrap().is_running());

    console.shutdown().await;
}

/// A device that answers one byte every 200 ms wedges its sampling cycle far
/// past the confirmation timeout; shutdown must abandon it instead of
/// hanging.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wedged_device_cannot_stall_shutdown() {
    let registry = Arc::new(PortRegistry::new());
    let mock = MockTransport::new()
        .with_reply("!", "*1#")
        .with_op_delay(Duration::from_millis(200));
    let port = registry.acquire("slow_line", || Box::new(mock));

    let config = DeviceConfig {
        id: "wedged".into(),
        port: "slow_line".into(),
        poll_interval_secs: 0.001,
        precision: 2,
        protocol: ProtocolConfig::FramedAscii {
            query: "!".into(),
            expected_fields: 1,
            fields: vec![FieldMapping {
                index: 0,
                name: "T".into(),
            }],
            retry_limit: 1,
        },
        limits: LimitsConfig::default(),
        rotation: None,
        recipe: None,
    };
    let (device, intent) = shared_pair(&config);
    let decoder = build_decoder(&config.id, &config.protocol, config.precision);

    let mut dispatcher = Dispatcher::new(
        Duration::from_millis(20),
        Duration::from_millis(300),
        Arc::clone(&registry),
    );
    dispatcher.spawn_sampler(Sampler::new(
        device,
        intent,
        port,
        decoder,
        Arc::new(CollectingSink::new()) as Arc<dyn MeasurementSink>,
        Arc::new(CollectingLog::new()) as Arc<dyn ActivityLog>,
        RunClock::new(),
        5,
    ));
    dispatcher.start();

    // Let the slow cycle begin.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = std::time::Instant::now();
    let result = dispatcher.shutdown().await;
    let elapsed = start.elapsed();

    assert!(
        matches!(result, Err(ConsoleError::ShutdownTimeout)),
        "expected a shutdown timeout, got {result:?}"
    );
    assert!(
        elapsed < Duration::from_millis(1500),
        "shutdown blocked for {elapsed:?}"
    );
    // The wedged port is latched failed so the abandoned cycle short-circuits.
    assert!(registry.ports().iter().all(|p| p.is_failed()));
}
