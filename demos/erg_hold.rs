use std::{env, time::Duration};
use tokio::time::timeout;
use tracing::{error, info, warn};
use velox::{ConnectTarget, FtmsDevice, Result, Trainer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Usage: erg_hold [watts] [address|name|auto]
    let mut args = env::args().skip(1);
    let watts: i32 = args.next().and_then(|w| w.parse().ok()).unwrap_or(150);
    let target: ConnectTarget = args
        .next()
        .unwrap_or_default()
        .parse()
        .unwrap_or_default();

    info!("⚡ Velox ERG Hold Example");
    info!("Searching for {}...", target);

    let trainer = FtmsDevice::bluetooth().await?;
    for device in trainer.scan().await? {
        info!(
            "  {} rssi={} ftms={} manufacturer={}",
            device.label(),
            device.rssi,
            device.has_ftms,
            device.manufacturer.as_deref().unwrap_or("unknown")
        );
    }

    let label = match trainer.connect(&target).await {
        Ok(label) => label,
        Err(e) => {
            error!("❌ Failed to connect: {}", e);
            return Err(e);
        }
    };
    info!("✅ Connected to: {}", label);

    if !trainer.probe_erg_support().await {
        warn!("⚠️  Trainer did not accept request-control, ERG may not work");
    }

    let mut metrics = trainer.subscribe_metrics().await?;
    let applied = trainer.set_target_power(watts).await?;
    info!("🎯 Holding {} W (requested {} W)", applied, watts);

    // Watch telemetry for thirty seconds
    let watch = async {
        while let Some(sample) = metrics.recv().await {
            info!(
                "📊 power={:?} W cadence={:?} rpm speed={:?} km/h",
                sample.power_watts, sample.cadence_rpm, sample.speed_kmh
            );
        }
    };
    if timeout(Duration::from_secs(30), watch).await.is_ok() {
        warn!("Telemetry stream ended early");
    }

    trainer.disconnect().await?;
    info!("👋 Disconnected");
    Ok(())
}
