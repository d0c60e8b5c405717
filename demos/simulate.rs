//! Runs a discovery against a simulated two-zone device.
//!
//! ```text
//! cargo run --example simulate -- [plan] [document path]
//! RUST_LOG=zone_discovery=debug cargo run --example simulate -- full
//! ```

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use zone_discovery::testing::{ColorResponse, MemoryPublisher, SimulatedDevice};
use zone_discovery::{
    dispatch_control, BusStatePublisher, ControlRequest, Coordinator, DiscoveryConfig, Rgb,
    YamlDocumentStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("zone_discovery=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let plan = args.next().unwrap_or_else(|| "quick".to_string());
    let document_path = args
        .next()
        .unwrap_or_else(|| "discovered_items.yaml".to_string());

    let mut config = DiscoveryConfig {
        document_path: document_path.into(),
        ..DiscoveryConfig::default()
    };
    // Simulated zones settle instantly
    config.probe.full_settle_ms = 50;
    config.probe.quick_settle_ms = 20;
    config.probe.verify_backoff_ms = 10;

    let device = SimulatedDevice::new()
        .with_zone("spa-1", 1, &["OFF", "ON", "PURPLE", "WHITE", "FULL_DYNAMIC_RGB"])
        .with_zone("spa-1", 2, &["OFF", "ON", "WHITE", "AMBER"])
        .with_color_response("spa-1", 1, ColorResponse::Clamp(253))
        .with_mode_color("WHITE", Rgb::new(255, 250, 245))
        .with_failing_reads("spa-1", 2, 2);

    let coordinator = Coordinator::new(Arc::new(device), Arc::new(YamlDocumentStore), config.clone());
    let bus = Arc::new(MemoryPublisher::new());
    let publisher = Arc::new(BusStatePublisher::new(bus.clone(), &config.base_topic));
    let topics = publisher.topics().clone();
    coordinator.register_publisher(publisher);

    // Start the run the way a message bus front end would
    let request = serde_json::to_vec(&serde_json::json!({ "action": "start", "mode": plan }))?;
    let outcome = dispatch_control(&coordinator, &request).await;
    println!("start: {}", serde_json::to_string(&outcome)?);
    if !outcome.success {
        return Ok(());
    }

    let mut updates = coordinator.subscribe_state();
    let mut last_detail = None;
    while coordinator.is_running() {
        match tokio::time::timeout(Duration::from_millis(500), updates.recv()).await {
            Ok(Ok(state)) => {
                if state.progress.detail != last_detail {
                    if let Some(detail) = &state.progress.detail {
                        println!("[{:>5.1}%] {}", state.progress.percentage, detail);
                    }
                    last_detail = state.progress.detail.clone();
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {}
        }
    }
    coordinator.flush().await;

    let status = coordinator.status();
    println!("status: {}", status.status.as_str());
    if let Some(error) = &status.error {
        println!("note: {}", error);
    }

    match coordinator.results() {
        Ok(results) => {
            for (device_id, device) in &results.devices {
                for zone in &device.zones {
                    println!(
                        "{}/{}: {} (unsupported: {})",
                        device_id,
                        zone.zone_id,
                        zone.detected_modes().join(", "),
                        zone.unsupported_modes.join(", ")
                    );
                }
            }
        }
        Err(e) => println!("results: {}", e),
    }

    if let Some(message) = bus.retained(&topics.result) {
        println!("retained on {}: {} bytes", message.destination, message.payload.len());
    }

    // Rejected: the run is already over
    let stop = serde_json::to_vec(&ControlRequest::stop())?;
    println!("stop: {}", serde_json::to_string(&dispatch_control(&coordinator, &stop).await)?);

    coordinator.shutdown().await;
    Ok(())
}
