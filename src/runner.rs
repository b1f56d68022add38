use futures::FutureExt;
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, VeloxError},
    trainer::Trainer,
    types::RunnerConfig,
    workout::{
        expected_power_band, watts_to_resistance, watts_to_slope, TargetMode, WorkoutOutcome,
        WorkoutPlan, WorkoutProgress, WorkoutStep,
    },
};

/// Lifecycle of a [`WorkoutRunner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// No workout has run yet, or the last one completed or failed
    Idle,
    /// A workout is executing
    Running,
    /// The last workout ended because a stop was requested
    Stopped,
}

struct ActiveRun {
    task: JoinHandle<()>,
    stop_requested: Arc<RwLock<bool>>,
}

/// Executes a [`WorkoutPlan`] against any [`Trainer`]
///
/// At most one workout runs at a time. Each step's target is applied with
/// retries, then a countdown emits one [`WorkoutProgress`] per tick. The
/// finish callback fires exactly once per run, whether it completed, was
/// stopped or failed.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use velox::{
///     ConnectTarget, SimulatedTrainer, TargetMode, Trainer, WorkoutPlan, WorkoutRunner,
///     WorkoutStep,
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let trainer = Arc::new(SimulatedTrainer::new());
///     trainer.connect(&ConnectTarget::Auto).await?;
///
///     let plan = WorkoutPlan::new("Openers", vec![WorkoutStep::new(60, 180)?]);
///     let runner = WorkoutRunner::new(trainer);
///     runner
///         .start(
///             plan,
///             TargetMode::Erg,
///             250,
///             |progress| println!("{}s left", progress.total_remaining_sec),
///             |outcome| println!("completed: {}", outcome.completed),
///         )
///         .await?;
///     Ok(())
/// }
/// ```
pub struct WorkoutRunner {
    trainer: Arc<dyn Trainer>,
    config: RunnerConfig,
    active: Mutex<Option<ActiveRun>>,
    state: Arc<RwLock<RunnerState>>,
}

impl WorkoutRunner {
    /// Create a runner with default retry and tick settings
    #[must_use]
    pub fn new(trainer: Arc<dyn Trainer>) -> Self {
        Self::with_config(trainer, RunnerConfig::default())
    }

    /// Create a runner with explicit settings
    #[must_use]
    pub fn with_config(trainer: Arc<dyn Trainer>, config: RunnerConfig) -> Self {
        Self {
            trainer,
            config,
            active: Mutex::new(None),
            state: Arc::new(RwLock::new(RunnerState::Idle)),
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> RunnerState {
        *self.state.read().await
    }

    /// Whether a workout is executing
    pub async fn is_running(&self) -> bool {
        self.state().await == RunnerState::Running
    }

    /// Start executing `plan` in the background
    ///
    /// `ftp_watts` only matters for resistance and slope modes; values below
    /// 100 W are treated as 100 W.
    ///
    /// # Errors
    ///
    /// Returns [`VeloxError::AlreadyRunning`] if a workout is executing and
    /// [`VeloxError::InvalidParameters`] if a step of `plan` is invalid.
    pub async fn start<P, F>(
        &self,
        plan: WorkoutPlan,
        mode: TargetMode,
        ftp_watts: u32,
        on_progress: P,
        on_finish: F,
    ) -> Result<()>
    where
        P: FnMut(WorkoutProgress) + Send + 'static,
        F: FnOnce(WorkoutOutcome) + Send + 'static,
    {
        plan.validate()?;

        let mut active = self.active.lock().await;
        {
            let mut state = self.state.write().await;
            let alive = active.as_ref().is_some_and(|run| !run.task.is_finished());
            if *state == RunnerState::Running && alive {
                return Err(VeloxError::AlreadyRunning);
            }
            *state = RunnerState::Running;
        }

        info!(
            "Starting workout '{}': {} steps, {}s, {} mode",
            plan.name,
            plan.steps.len(),
            plan.total_duration_sec(),
            mode
        );

        let stop_requested = Arc::new(RwLock::new(false));
        let run = Run {
            trainer: Arc::clone(&self.trainer),
            config: self.config.clone(),
            stop_requested: Arc::clone(&stop_requested),
            state: Arc::clone(&self.state),
            mode,
            ftp_watts,
        };
        let task = tokio::spawn(run.execute(plan, on_progress, on_finish));

        *active = Some(ActiveRun {
            task,
            stop_requested,
        });
        Ok(())
    }

    /// Ask the running workout to stop without waiting for it
    ///
    /// # Errors
    ///
    /// Returns [`VeloxError::NotRunning`] if no workout is executing.
    pub async fn request_stop(&self) -> Result<()> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) if !run.task.is_finished() => {
                *run.stop_requested.write().await = true;
                Ok(())
            }
            _ => Err(VeloxError::NotRunning),
        }
    }

    /// Stop the running workout and wait until it has exited
    ///
    /// Calling this while idle is a no-op.
    pub async fn stop(&self) {
        let Some(run) = self.active.lock().await.take() else {
            return;
        };
        *run.stop_requested.write().await = true;
        if let Err(e) = run.task.await {
            warn!("Workout task ended abnormally: {}", e);
            let mut state = self.state.write().await;
            if *state == RunnerState::Running {
                *state = RunnerState::Idle;
            }
        }
    }
}

/// Everything one background run needs
struct Run {
    trainer: Arc<dyn Trainer>,
    config: RunnerConfig,
    stop_requested: Arc<RwLock<bool>>,
    state: Arc<RwLock<RunnerState>>,
    mode: TargetMode,
    ftp_watts: u32,
}

impl Run {
    async fn execute<P, F>(self, plan: WorkoutPlan, mut on_progress: P, on_finish: F)
    where
        P: FnMut(WorkoutProgress) + Send,
        F: FnOnce(WorkoutOutcome),
    {
        let result = AssertUnwindSafe(self.run_steps(&plan, &mut on_progress))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(VeloxError::WorkoutPanicked(panic_message(&*payload)))
            });
        let stopped = self.stop_requested().await;

        let outcome = match result {
            Ok(()) => WorkoutOutcome {
                completed: !stopped,
                failure: None,
            },
            Err(e) => {
                error!("Workout '{}' aborted: {}", plan.name, e);
                WorkoutOutcome {
                    completed: false,
                    failure: Some(e),
                }
            }
        };
        info!(
            "Workout '{}' finished, completed={}",
            plan.name, outcome.completed
        );

        *self.state.write().await = if stopped {
            RunnerState::Stopped
        } else {
            RunnerState::Idle
        };
        on_finish(outcome);
    }

    async fn stop_requested(&self) -> bool {
        *self.stop_requested.read().await
    }

    async fn run_steps(
        &self,
        plan: &WorkoutPlan,
        on_progress: &mut (impl FnMut(WorkoutProgress) + Send),
    ) -> Result<()> {
        let total_duration_sec = plan.total_duration_sec();
        let mut elapsed_offset_sec = 0;

        for (position, step) in plan.steps.iter().enumerate() {
            let step_index = position + 1;
            if self.stop_requested().await {
                break;
            }

            let Some((value, unit)) = self.apply_target(step).await? else {
                break;
            };
            info!(
                "Step {}/{} '{}': {} W, applied {:.1} {} for {}s",
                step_index,
                plan.steps.len(),
                step.display_label(step_index),
                step.target_watts,
                value,
                unit,
                step.duration_sec
            );

            let template = WorkoutProgress {
                step_index,
                step_total: plan.steps.len(),
                step_label: step.display_label(step_index),
                target_watts: step.target_watts,
                target_mode: self.mode,
                target_display_value: value,
                target_display_unit: unit.to_string(),
                expected_power_min_watts: 0,
                expected_power_max_watts: 0,
                expected_cadence_rpm: step.cadence_rpm,
                step_duration_sec: step.duration_sec,
                step_elapsed_sec: 0,
                remaining_sec: 0,
                elapsed_total_sec: 0,
                total_duration_sec,
                total_remaining_sec: 0,
            };
            self.countdown(template, elapsed_offset_sec, on_progress)
                .await;
            elapsed_offset_sec = elapsed_offset_sec.saturating_add(step.duration_sec);
        }
        Ok(())
    }

    /// Apply a step target, returning the applied value and its unit
    ///
    /// `Ok(None)` means a stop was requested before the target took effect.
    async fn apply_target(&self, step: &WorkoutStep) -> Result<Option<(f64, &'static str)>> {
        let max_attempts = self.config.max_attempts.max(1);
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if self.stop_requested().await {
                return Ok(None);
            }
            match self.set_target(step).await {
                Ok(applied) => return Ok(Some(applied)),
                Err(e) => {
                    warn!(
                        "Attempt {}/{} to apply {} target failed: {}",
                        attempt, max_attempts, self.mode, e
                    );
                    last_error = Some(e);
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(retry_delay).await;
            }
        }

        match last_error {
            Some(e) => Err(VeloxError::TargetApplicationFailed {
                mode: self.mode,
                attempts: max_attempts,
                source: Box::new(e),
            }),
            None => Ok(None),
        }
    }

    async fn set_target(&self, step: &WorkoutStep) -> Result<(f64, &'static str)> {
        match self.mode {
            TargetMode::Erg => {
                let watts = i32::try_from(step.target_watts).unwrap_or(i32::MAX);
                let applied = self.trainer.set_target_power(watts).await?;
                Ok((f64::from(applied), "W"))
            }
            TargetMode::Resistance => {
                let level = watts_to_resistance(step.target_watts, self.ftp_watts);
                Ok((self.trainer.set_target_resistance(level).await?, "%"))
            }
            TargetMode::Slope => {
                let grade = watts_to_slope(step.target_watts, self.ftp_watts);
                Ok((self.trainer.set_target_slope(grade).await?, "%"))
            }
        }
    }

    async fn countdown(
        &self,
        template: WorkoutProgress,
        elapsed_offset_sec: u32,
        on_progress: &mut (impl FnMut(WorkoutProgress) + Send),
    ) {
        let tick = Duration::from_millis(self.config.tick_interval_ms);
        let (expected_min, expected_max) = expected_power_band(template.target_watts);
        let duration = template.step_duration_sec;

        for remaining_sec in (1..=duration).rev() {
            if self.stop_requested().await {
                debug!("Stop requested during step {}", template.step_index);
                return;
            }
            let step_elapsed_sec = duration - remaining_sec + 1;
            let elapsed_total_sec = elapsed_offset_sec.saturating_add(step_elapsed_sec);

            on_progress(WorkoutProgress {
                expected_power_min_watts: expected_min,
                expected_power_max_watts: expected_max,
                step_elapsed_sec,
                remaining_sec,
                elapsed_total_sec,
                total_remaining_sec: template
                    .total_duration_sec
                    .saturating_sub(elapsed_total_sec),
                ..template.clone()
            });
            tokio::time::sleep(tick).await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
