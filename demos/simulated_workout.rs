use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};
use velox::{
    ConnectTarget, Result, SimulatedTrainer, TargetMode, Trainer, WorkoutPlan, WorkoutRunner,
    WorkoutStep,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Velox Simulated Workout Example");

    let trainer = Arc::new(SimulatedTrainer::new());
    let label = trainer.connect(&ConnectTarget::Auto).await?;
    info!("✅ Connected to: {}", label);

    // Print live telemetry next to the workout progress
    let mut metrics = trainer.subscribe_metrics().await?;
    let telemetry = tokio::spawn(async move {
        while let Some(sample) = metrics.recv().await {
            info!(
                "📊 power={:?} W cadence={:?} rpm speed={:?} km/h",
                sample.power_watts, sample.cadence_rpm, sample.speed_kmh
            );
        }
    });

    let plan = WorkoutPlan::new(
        "Sweet Spot Sampler",
        vec![
            WorkoutStep::new(10, 150)?.with_label("Warm up"),
            WorkoutStep::new(20, 240)?
                .with_label("Sweet spot")
                .with_cadence(85, 95)?,
            WorkoutStep::new(10, 130)?.with_label("Cool down"),
        ],
    );

    let runner = WorkoutRunner::new(Arc::clone(&trainer) as Arc<dyn Trainer>);
    let (done_tx, done_rx) = oneshot::channel();
    runner
        .start(
            plan,
            TargetMode::Erg,
            260,
            |progress| {
                info!(
                    "⏱️  [{}/{}] {} target {:.0} {} band {}-{} W, {}s left in step, {}s left overall",
                    progress.step_index,
                    progress.step_total,
                    progress.step_label,
                    progress.target_display_value,
                    progress.target_display_unit,
                    progress.expected_power_min_watts,
                    progress.expected_power_max_watts,
                    progress.remaining_sec,
                    progress.total_remaining_sec
                );
            },
            move |outcome| {
                let _ = done_tx.send(outcome);
            },
        )
        .await?;

    match done_rx.await {
        Ok(outcome) if outcome.completed => info!("🏁 Workout completed"),
        Ok(outcome) => match outcome.failure {
            Some(e) => error!("❌ Workout failed: {}", e),
            None => info!("⏹️  Workout stopped"),
        },
        Err(_) => error!("❌ Workout task ended without reporting"),
    }

    trainer.disconnect().await?;
    telemetry.abort();
    Ok(())
}
