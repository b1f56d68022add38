use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::{Result, VeloxError};

/// How a workout step's power target is expressed to the trainer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    /// Absolute power target in watts
    Erg,
    /// Resistance level derived from the target relative to FTP
    Resistance,
    /// Simulated grade derived from the target relative to FTP
    Slope,
}

impl fmt::Display for TargetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Erg => write!(f, "erg"),
            Self::Resistance => write!(f, "resistance"),
            Self::Slope => write!(f, "slope"),
        }
    }
}

impl FromStr for TargetMode {
    type Err = VeloxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "erg" => Ok(Self::Erg),
            "resistance" => Ok(Self::Resistance),
            "slope" => Ok(Self::Slope),
            other => Err(VeloxError::InvalidParameters(format!(
                "Unknown target mode: {other}"
            ))),
        }
    }
}

/// A single interval of a workout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StepFields")]
pub struct WorkoutStep {
    /// Step duration in seconds
    pub duration_sec: u32,
    /// Target power in watts
    pub target_watts: u32,
    /// Optional display label
    pub label: Option<String>,
    /// Optional expected cadence band (min, max) in rpm
    pub cadence_rpm: Option<(u32, u32)>,
}

impl WorkoutStep {
    /// Create a validated step
    ///
    /// # Errors
    ///
    /// Returns [`VeloxError::InvalidParameters`] if the duration or target is zero.
    pub fn new(duration_sec: u32, target_watts: u32) -> Result<Self> {
        let step = Self {
            duration_sec,
            target_watts,
            label: None,
            cadence_rpm: None,
        };
        step.validate()?;
        Ok(step)
    }

    /// Check a step built from its public fields
    ///
    /// # Errors
    ///
    /// Returns [`VeloxError::InvalidParameters`] if the duration or target is
    /// zero, or the cadence band is not `0 < min <= max`.
    pub fn validate(&self) -> Result<()> {
        if self.duration_sec == 0 {
            return Err(VeloxError::InvalidParameters(
                "Step duration must be positive".to_string(),
            ));
        }
        if self.target_watts == 0 {
            return Err(VeloxError::InvalidParameters(
                "Step target power must be positive".to_string(),
            ));
        }
        match self.cadence_rpm {
            Some((min_rpm, max_rpm)) => check_cadence_band(min_rpm, max_rpm),
            None => Ok(()),
        }
    }

    /// Attach a display label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Attach an expected cadence band
    ///
    /// # Errors
    ///
    /// Returns [`VeloxError::InvalidParameters`] unless `0 < min <= max`.
    pub fn with_cadence(mut self, min_rpm: u32, max_rpm: u32) -> Result<Self> {
        check_cadence_band(min_rpm, max_rpm)?;
        self.cadence_rpm = Some((min_rpm, max_rpm));
        Ok(self)
    }

    /// Label shown for this step, defaulting to its 1-based position
    #[must_use]
    pub fn display_label(&self, step_index: usize) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("Step {step_index}"))
    }
}

fn check_cadence_band(min_rpm: u32, max_rpm: u32) -> Result<()> {
    if min_rpm == 0 || min_rpm > max_rpm {
        return Err(VeloxError::InvalidParameters(format!(
            "Invalid cadence band {min_rpm}-{max_rpm} rpm"
        )));
    }
    Ok(())
}

/// Wire shape of a step, checked before it becomes a [`WorkoutStep`]
#[derive(Deserialize)]
struct StepFields {
    duration_sec: u32,
    target_watts: u32,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    cadence_rpm: Option<(u32, u32)>,
}

impl TryFrom<StepFields> for WorkoutStep {
    type Error = VeloxError;

    fn try_from(fields: StepFields) -> Result<Self> {
        let step = Self {
            duration_sec: fields.duration_sec,
            target_watts: fields.target_watts,
            label: fields.label,
            cadence_rpm: fields.cadence_rpm,
        };
        step.validate()?;
        Ok(step)
    }
}

/// An ordered sequence of workout steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkoutPlan {
    /// Plan name
    pub name: String,
    /// Steps in execution order
    pub steps: Vec<WorkoutStep>,
}

impl WorkoutPlan {
    /// Create a plan
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<WorkoutStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Check every step
    ///
    /// # Errors
    ///
    /// Returns the first step error, naming its 1-based position.
    pub fn validate(&self) -> Result<()> {
        for (position, step) in self.steps.iter().enumerate() {
            step.validate().map_err(|e| {
                VeloxError::InvalidParameters(format!("Step {}: {e}", position + 1))
            })?;
        }
        Ok(())
    }

    /// Sum of all step durations, saturating at `u32::MAX`
    #[must_use]
    pub fn total_duration_sec(&self) -> u32 {
        self.steps
            .iter()
            .fold(0, |total: u32, s| total.saturating_add(s.duration_sec))
    }
}

/// Snapshot emitted once per second while a workout runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutProgress {
    /// 1-based index of the current step
    pub step_index: usize,
    /// Number of steps in the plan
    pub step_total: usize,
    /// Display label of the current step
    pub step_label: String,
    /// Step target in watts
    pub target_watts: u32,
    /// Mode the target was applied in
    pub target_mode: TargetMode,
    /// Value actually applied to the trainer
    pub target_display_value: f64,
    /// Unit of `target_display_value` ("W" or "%")
    pub target_display_unit: String,
    /// Lower edge of the expected power band
    pub expected_power_min_watts: u32,
    /// Upper edge of the expected power band
    pub expected_power_max_watts: u32,
    /// Expected cadence band, if the step defines one
    pub expected_cadence_rpm: Option<(u32, u32)>,
    /// Step duration in seconds
    pub step_duration_sec: u32,
    /// Seconds elapsed in this step, counting the current tick
    pub step_elapsed_sec: u32,
    /// Seconds remaining in this step, counting the current tick
    pub remaining_sec: u32,
    /// Seconds elapsed in the whole plan
    pub elapsed_total_sec: u32,
    /// Total plan duration in seconds
    pub total_duration_sec: u32,
    /// Seconds remaining in the whole plan
    pub total_remaining_sec: u32,
}

/// Result reported once when a workout run ends
#[derive(Debug)]
pub struct WorkoutOutcome {
    /// True only if every step ran to completion without a stop request
    pub completed: bool,
    /// Failure that aborted the run, if any
    pub failure: Option<VeloxError>,
}

fn effective_ftp(ftp_watts: u32) -> f64 {
    f64::from(ftp_watts.max(100))
}

/// Convert a power target to a 1-200 resistance level relative to FTP
#[must_use]
pub fn watts_to_resistance(target_watts: u32, ftp_watts: u32) -> f64 {
    (f64::from(target_watts) / effective_ftp(ftp_watts) * 100.0).clamp(1.0, 200.0)
}

/// Convert a power target to a grade in percent relative to FTP
#[must_use]
pub fn watts_to_slope(target_watts: u32, ftp_watts: u32) -> f64 {
    ((f64::from(target_watts) - effective_ftp(ftp_watts)) / 20.0).clamp(-10.0, 15.0)
}

/// Expected power band of +/- 5% around a target, never below 1 W
#[must_use]
pub fn expected_power_band(target_watts: u32) -> (u32, u32) {
    let target = f64::from(target_watts);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let round = |v: f64| (v.round() as u32).max(1);
    (round(target * 0.95), round(target * 1.05))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_validation() {
        assert!(WorkoutStep::new(0, 200).is_err());
        assert!(WorkoutStep::new(60, 0).is_err());

        let step = WorkoutStep::new(60, 200).unwrap();
        assert!(step.clone().with_cadence(90, 80).is_err());
        assert!(step.clone().with_cadence(0, 80).is_err());
        assert_eq!(
            step.with_cadence(85, 95).unwrap().cadence_rpm,
            Some((85, 95))
        );
    }

    #[test]
    fn test_display_label() {
        let step = WorkoutStep::new(30, 150).unwrap();
        assert_eq!(step.display_label(2), "Step 2");
        assert_eq!(step.with_label("Warmup").display_label(2), "Warmup");
    }

    #[test]
    fn test_total_duration() {
        let plan = WorkoutPlan::new(
            "Intervals",
            vec![
                WorkoutStep::new(300, 150).unwrap(),
                WorkoutStep::new(60, 300).unwrap(),
                WorkoutStep::new(120, 120).unwrap(),
            ],
        );
        assert_eq!(plan.total_duration_sec(), 480);
        assert_eq!(WorkoutPlan::new("Empty", Vec::new()).total_duration_sec(), 0);

        let marathon = WorkoutPlan::new(
            "Marathon",
            vec![
                WorkoutStep::new(u32::MAX, 150).unwrap(),
                WorkoutStep::new(60, 150).unwrap(),
            ],
        );
        assert_eq!(marathon.total_duration_sec(), u32::MAX);
    }

    #[test]
    fn test_plan_validation_catches_field_edits() {
        let mut step = WorkoutStep::new(60, 200).unwrap();
        let good = WorkoutPlan::new("Good", vec![step.clone()]);
        assert!(good.validate().is_ok());

        step.cadence_rpm = Some((100, 90));
        let plan = WorkoutPlan::new("Bad", vec![good.steps[0].clone(), step]);
        match plan.validate() {
            Err(VeloxError::InvalidParameters(msg)) => assert!(msg.starts_with("Step 2")),
            other => panic!("unexpected result {other:?}"),
        }

        let zero = StepFields {
            duration_sec: 0,
            target_watts: 200,
            label: None,
            cadence_rpm: None,
        };
        assert!(WorkoutStep::try_from(zero).is_err());
    }

    #[test]
    fn test_resistance_conversion() {
        assert!((watts_to_resistance(200, 250) - 80.0).abs() < f64::EPSILON);
        // FTP below 100 W is treated as 100 W
        assert!((watts_to_resistance(150, 50) - 150.0).abs() < f64::EPSILON);
        assert!((watts_to_resistance(1, 400) - 1.0).abs() < f64::EPSILON);
        assert!((watts_to_resistance(900, 100) - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_slope_conversion() {
        assert!((watts_to_slope(300, 250) - 2.5).abs() < f64::EPSILON);
        assert!((watts_to_slope(50, 300) + 10.0).abs() < f64::EPSILON);
        assert!((watts_to_slope(900, 200) - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_expected_power_band() {
        assert_eq!(expected_power_band(200), (190, 210));
        assert_eq!(expected_power_band(1), (1, 1));
        assert_eq!(expected_power_band(100), (95, 105));
    }

    #[test]
    fn test_target_mode_parsing() {
        assert_eq!("ERG".parse::<TargetMode>().unwrap(), TargetMode::Erg);
        assert_eq!(" slope ".parse::<TargetMode>().unwrap(), TargetMode::Slope);
        assert!("incline".parse::<TargetMode>().is_err());
        assert_eq!(TargetMode::Resistance.to_string(), "resistance");
    }
}
