use std::{sync::Arc, time::Duration};
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};
use bandlink::{
    BandEvent, BtleplugTransport, DeviceClass, MemoryStore, Result, Sample, SessionRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 Bandlink Monitor Example");

    let transport = match BtleplugTransport::new().await {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("❌ Bluetooth is not available: {}", e);
            return Err(e);
        }
    };
    let registry = SessionRegistry::new(transport, Arc::new(MemoryStore::default()));
    let mut events = registry.subscribe();

    for class in DeviceClass::ALL {
        info!("Searching for a {}...", class);
        match registry.connect_last_known(class).await {
            Ok(snapshot) => info!(
                "✅ Connected {} {}",
                class,
                snapshot.device_id.unwrap_or_default()
            ),
            Err(e) if e.is_user_visible() => warn!("❌ No {}: {}", class, e),
            Err(_) => info!("No {} selected", class),
        }
    }

    if let Ok(level) = registry
        .get_or_create(DeviceClass::Breathing)
        .await
        .read_battery()
        .await
    {
        info!("🔋 Breathing band battery: {}%", level);
    }

    info!("Press Ctrl+C to stop monitoring");

    let mut summary = interval(Duration::from_secs(10));
    let start_time = Instant::now();
    let mut heart_frames = 0u64;
    let mut breathing_frames = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = summary.tick() => {
                let elapsed = start_time.elapsed().as_secs();
                println!("\n📊 Status ({:02}:{:02})", elapsed / 60, elapsed % 60);
                for class in DeviceClass::ALL {
                    let snapshot = registry.snapshot(class).await;
                    println!("  {:16} {}", class.to_string(), snapshot.state);
                }
                println!("  Frames: {heart_frames} heart-rate, {breathing_frames} breathing");
            }
            event = events.recv() => match event {
                Ok(BandEvent::Sample(event)) => match event.sample {
                    Sample::HeartRate(sample) => {
                        heart_frames += 1;
                        println!("❤️  {} bpm", sample.bpm);
                    }
                    Sample::Breathing(sample) => {
                        breathing_frames += 1;
                        println!("🌬️  {:.2}", sample.rate);
                    }
                },
                Ok(BandEvent::StateChanged(change)) => info!(
                    "{}: {} -> {}",
                    change.class, change.old_state, change.new_state
                ),
                Ok(BandEvent::Error { class, error }) => warn!("⚠️  {}: {}", class, error),
                Err(e) => warn!("Event stream lagged: {}", e),
            },
        }
    }

    // Disconnect
    info!("🔌 Disconnecting...");
    registry.shutdown().await;
    info!("👋 Monitor finished");

    Ok(())
}
