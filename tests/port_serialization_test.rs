//! Integration test: devices sharing one physical port never interleave I/O.

use crysdaq::config::{DeviceConfig, FieldMapping, LimitsConfig, ProtocolConfig};
use crysdaq::device::shared_pair;
use crysdaq::dispatcher::Dispatcher;
use crysdaq::measurement::{ActivityLog, CollectingLog, CollectingSink, MeasurementSink, RunClock};
use crysdaq::protocol::build_decoder;
use crysdaq::registry::PortRegistry;
use crysdaq::sampler::Sampler;
use crysdaq::transport::{MockTransport, PortEvent};
use std::sync::Arc;
use std::time::Duration;

fn framed_device(id: &str, query: &str) -> DeviceConfig {
    DeviceConfig {
        id: id.into(),
        port: "shared_line".into(),
        poll_interval_secs: 0.01,
        precision: 2,
        protocol: ProtocolConfig::FramedAscii {
            query: query.into(),
            expected_fields: 2,
            fields: vec![
                FieldMapping {
                    index: 0,
                    name: "a".into(),
                },
                FieldMapping {
                    index: 1,
                    name: "b".into(),
                },
            ],
            retry_limit: 3,
        },
        limits: LimitsConfig::default(),
        rotation: None,
        recipe: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn port_mates_never_interleave_io() {
    let registry = Arc::new(PortRegistry::new());

    // Both devices answer on the same line; the artificial per-op delay
    // widens any window in which interleaving could happen.
    let mock = MockTransport::new()
        .with_reply("!", "*1.0 2.0#")
        .with_reply("?", "*3.0 4.0#")
        .with_op_delay(Duration::from_millis(1));
    let events = mock.events();
    let port = registry.acquire("shared_line", || Box::new(mock));

    let sink: Arc<dyn MeasurementSink> = Arc::new(CollectingSink::new());
    let activity: Arc<dyn ActivityLog> = Arc::new(CollectingLog::new());
    let mut dispatcher = Dispatcher::new(
        Duration::from_millis(20),
        Duration::from_secs(2),
        Arc::clone(&registry),
    );

    for (id, query) in [("axis_a", "!"), ("axis_b", "?")] {
        let config = framed_device(id, query);
        let (device, intent) = shared_pair(&config);
        let decoder = build_decoder(&config.id, &config.protocol, config.precision);
        dispatcher.spawn_sampler(Sampler::new(
            device,
            intent,
            Arc::clone(&port),
            decoder,
            Arc::clone(&sink),
            Arc::clone(&activity),
            RunClock::new(),
            5,
        ));
    }

    dispatcher.start();
    tokio::time::sleep(Duration::from_millis(400)).await;
    dispatcher.shutdown().await.unwrap();

    // Each sampling cycle on the wire is one query write followed by a full
    // frame drain. Two queries without a drain in between would mean two
    // concurrent lock holders.
    let recorded = events.lock().unwrap();
    let mut frame_open = false;
    let mut queries = 0;
    for event in recorded.iter() {
        match event {
            PortEvent::Write(_) => {
                assert!(
                    !frame_open,
                    "query written before the previous frame was drained: interleaved I/O"
                );
                frame_open = true;
                queries += 1;
            }
            PortEvent::FrameDrained => {
                assert!(frame_open, "frame drained with no preceding query");
                frame_open = false;
            }
            _ => {}
        }
    }
    assert!(
        queries >= 4,
        "expected repeated cycles from both devices, saw {queries} queries"
    );
}
