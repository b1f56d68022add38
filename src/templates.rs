use serde::Serialize;

use crate::{
    error::{Result, VeloxError},
    workout::{WorkoutPlan, WorkoutStep},
};

/// One step of a [`WorkoutTemplate`], expressed relative to FTP
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemplateStep {
    /// Step duration in seconds
    pub duration_sec: u32,
    /// Target as a fraction of FTP (1.0 = threshold)
    pub intensity: f64,
    /// Display label
    pub label: &'static str,
    /// Cadence band (min, max) in rpm; inferred from intensity when absent
    pub cadence_rpm: Option<(u32, u32)>,
}

const fn step(duration_sec: u32, intensity: f64, label: &'static str) -> TemplateStep {
    TemplateStep {
        duration_sec,
        intensity,
        label,
        cadence_rpm: None,
    }
}

const fn paced(
    duration_sec: u32,
    intensity: f64,
    label: &'static str,
    min_rpm: u32,
    max_rpm: u32,
) -> TemplateStep {
    TemplateStep {
        duration_sec,
        intensity,
        label,
        cadence_rpm: Some((min_rpm, max_rpm)),
    }
}

impl TemplateStep {
    /// Cadence band for this step, inferred from intensity when not set
    #[must_use]
    pub fn cadence_band(&self) -> (u32, u32) {
        self.cadence_rpm.unwrap_or(match self.intensity {
            i if i <= 0.60 => (80, 92),
            i if i <= 0.78 => (85, 95),
            i if i <= 0.95 => (88, 98),
            i if i <= 1.05 => (82, 92),
            _ => (95, 110),
        })
    }

    /// Target in watts for `ftp_watts`, never below 1 W
    #[must_use]
    pub fn target_watts(&self, ftp_watts: u32) -> u32 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let watts = (f64::from(ftp_watts) * self.intensity).round() as u32;
        watts.max(1)
    }
}

/// Built-in workout scaled to a rider's FTP
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WorkoutTemplate {
    /// Stable lookup key
    pub key: &'static str,
    /// Display name
    pub name: &'static str,
    /// Training category
    pub category: &'static str,
    /// Steps in execution order
    pub steps: &'static [TemplateStep],
}

impl WorkoutTemplate {
    /// Total duration in seconds
    #[must_use]
    pub fn total_duration_sec(&self) -> u32 {
        self.steps.iter().map(|s| s.duration_sec).sum()
    }

    /// Scale the template into a runnable plan
    ///
    /// # Errors
    ///
    /// Returns [`VeloxError::InvalidParameters`] if `ftp_watts` is zero.
    pub fn to_plan(&self, ftp_watts: u32) -> Result<WorkoutPlan> {
        if ftp_watts == 0 {
            return Err(VeloxError::InvalidParameters(
                "FTP must be positive".to_string(),
            ));
        }

        let steps = self
            .steps
            .iter()
            .map(|step| {
                let (min_rpm, max_rpm) = step.cadence_band();
                WorkoutStep::new(step.duration_sec, step.target_watts(ftp_watts))?
                    .with_label(step.label)
                    .with_cadence(min_rpm, max_rpm)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(WorkoutPlan::new(
            format!("{} ({ftp_watts} FTP)", self.name),
            steps,
        ))
    }
}

/// Built-in workout library
pub const TEMPLATES: &[WorkoutTemplate] = &[
    WorkoutTemplate {
        key: "wake_up_20",
        name: "Wake Up 20",
        category: "Wake up",
        steps: &[
            step(300, 0.50, "Warmup"),
            paced(180, 0.60, "Cadence Prep", 90, 100),
            paced(60, 0.80, "Activation", 95, 105),
            step(120, 0.55, "Recover"),
            paced(60, 0.90, "Openers", 100, 110),
            step(180, 0.50, "Cool-down"),
        ],
    },
    WorkoutTemplate {
        key: "tempo_30",
        name: "Tempo 30",
        category: "Tempo",
        steps: &[
            step(420, 0.55, "Warmup"),
            paced(720, 0.78, "Tempo Main", 88, 96),
            step(240, 0.50, "Cool-down"),
        ],
    },
    WorkoutTemplate {
        key: "sweetspot_45",
        name: "Sweet Spot 45",
        category: "FTP",
        steps: &[
            step(600, 0.55, "Warmup"),
            paced(900, 0.88, "Sweet Spot Block", 88, 96),
            step(300, 0.60, "Recover"),
            paced(600, 0.90, "Sweet Spot Finish", 88, 96),
            step(300, 0.50, "Cool-down"),
        ],
    },
    WorkoutTemplate {
        key: "endurance_60",
        name: "Endurance 60",
        category: "Endurance",
        steps: &[
            step(600, 0.55, "Warmup"),
            paced(2400, 0.70, "Endurance Cruise", 85, 95),
            paced(600, 0.60, "Tempo Finish", 88, 96),
        ],
    },
    WorkoutTemplate {
        key: "ftp_2x8",
        name: "FTP Builder 2x8",
        category: "FTP",
        steps: &[
            step(480, 0.55, "Warmup"),
            paced(480, 0.95, "Block 1", 85, 95),
            step(240, 0.60, "Recover"),
            paced(480, 1.00, "Block 2", 85, 95),
            step(360, 0.50, "Cool-down"),
        ],
    },
    WorkoutTemplate {
        key: "sweetspot_3x10",
        name: "Sweet Spot 3x10",
        category: "FTP",
        steps: &[
            step(600, 0.55, "Warmup"),
            paced(600, 0.88, "Sweet Spot 1", 88, 96),
            step(240, 0.60, "Recover"),
            paced(600, 0.90, "Sweet Spot 2", 88, 96),
            step(240, 0.60, "Recover"),
            paced(600, 0.92, "Sweet Spot 3", 88, 96),
            step(300, 0.50, "Cool-down"),
        ],
    },
    WorkoutTemplate {
        key: "vo2_30_30",
        name: "Power 30/30",
        category: "Power",
        steps: &[
            step(480, 0.55, "Warmup"),
            paced(30, 1.20, "ON 1", 100, 115),
            paced(30, 0.50, "OFF 1", 80, 95),
            paced(30, 1.20, "ON 2", 100, 115),
            paced(30, 0.50, "OFF 2", 80, 95),
            paced(30, 1.20, "ON 3", 100, 115),
            paced(30, 0.50, "OFF 3", 80, 95),
            paced(30, 1.20, "ON 4", 100, 115),
            paced(30, 0.50, "OFF 4", 80, 95),
            paced(30, 1.20, "ON 5", 100, 115),
            paced(30, 0.50, "OFF 5", 80, 95),
            paced(30, 1.20, "ON 6", 100, 115),
            paced(30, 0.50, "OFF 6", 80, 95),
            step(420, 0.50, "Cool-down"),
        ],
    },
    WorkoutTemplate {
        key: "vo2max_5x3",
        name: "VO2max 5x3",
        category: "VO2max",
        steps: &[
            step(600, 0.55, "Warmup"),
            paced(180, 1.12, "VO2 #1", 95, 108),
            paced(180, 0.55, "Recover #1", 82, 92),
            paced(180, 1.12, "VO2 #2", 95, 108),
            paced(180, 0.55, "Recover #2", 82, 92),
            paced(180, 1.12, "VO2 #3", 95, 108),
            paced(180, 0.55, "Recover #3", 82, 92),
            paced(180, 1.12, "VO2 #4", 95, 108),
            paced(180, 0.55, "Recover #4", 82, 92),
            paced(180, 1.12, "VO2 #5", 95, 108),
            step(420, 0.50, "Cool-down"),
        ],
    },
    WorkoutTemplate {
        key: "threshold_4x6",
        name: "Threshold 4x6",
        category: "FTP",
        steps: &[
            step(600, 0.55, "Warmup"),
            paced(360, 1.02, "Threshold 1", 82, 92),
            step(180, 0.60, "Recover"),
            paced(360, 1.03, "Threshold 2", 82, 92),
            step(180, 0.60, "Recover"),
            paced(360, 1.04, "Threshold 3", 82, 92),
            step(180, 0.60, "Recover"),
            paced(360, 1.05, "Threshold 4", 82, 92),
            step(420, 0.50, "Cool-down"),
        ],
    },
];

/// Look up a built-in template by key
#[must_use]
pub fn find_template(key: &str) -> Option<&'static WorkoutTemplate> {
    TEMPLATES.iter().find(|template| template.key == key)
}

/// Build a plan from the built-in template named `key`
///
/// # Errors
///
/// Returns [`VeloxError::InvalidParameters`] for an unknown key or a zero FTP.
pub fn build_plan_from_template(key: &str, ftp_watts: u32) -> Result<WorkoutPlan> {
    find_template(key)
        .ok_or_else(|| VeloxError::InvalidParameters(format!("Unknown workout template '{key}'")))?
        .to_plan(ftp_watts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_template_scaling() {
        let plan = build_plan_from_template("ftp_2x8", 300).unwrap();
        assert_eq!(plan.name, "FTP Builder 2x8 (300 FTP)");
        assert_eq!(plan.total_duration_sec(), 2040);

        let watts: Vec<u32> = plan.steps.iter().map(|s| s.target_watts).collect();
        assert_eq!(watts, vec![165, 285, 180, 300, 150]);

        let block = &plan.steps[1];
        assert_eq!(block.label.as_deref(), Some("Block 1"));
        assert_eq!(block.cadence_rpm, Some((85, 95)));
        assert_eq!(block.duration_sec, 480);
    }

    #[test]
    fn test_cadence_inferred_from_intensity() {
        assert_eq!(step(60, 0.50, "Easy").cadence_band(), (80, 92));
        assert_eq!(step(60, 0.60, "Easy").cadence_band(), (80, 92));
        assert_eq!(step(60, 0.70, "Endurance").cadence_band(), (85, 95));
        assert_eq!(step(60, 0.90, "Sweet spot").cadence_band(), (88, 98));
        assert_eq!(step(60, 1.00, "Threshold").cadence_band(), (82, 92));
        assert_eq!(step(60, 1.20, "VO2").cadence_band(), (95, 110));
        assert_eq!(paced(60, 1.20, "ON", 100, 115).cadence_band(), (100, 115));

        let plan = build_plan_from_template("tempo_30", 200).unwrap();
        assert_eq!(plan.steps[0].cadence_rpm, Some((80, 92)));
        assert_eq!(plan.steps[1].cadence_rpm, Some((88, 96)));
    }

    #[test]
    fn test_target_never_below_one_watt() {
        let plan = build_plan_from_template("wake_up_20", 1).unwrap();
        assert!(plan.steps.iter().all(|s| s.target_watts >= 1));
        assert_eq!(step(60, 0.1, "Spin").target_watts(2), 1);
    }

    #[test]
    fn test_invalid_requests() {
        assert!(matches!(
            build_plan_from_template("tempo_30", 0),
            Err(VeloxError::InvalidParameters(_))
        ));
        assert!(matches!(
            build_plan_from_template("hour_of_power", 250),
            Err(VeloxError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_library_is_consistent() {
        let keys: HashSet<&str> = TEMPLATES.iter().map(|t| t.key).collect();
        assert_eq!(keys.len(), TEMPLATES.len());

        for template in TEMPLATES {
            let plan = template.to_plan(280).unwrap();
            assert!(plan.validate().is_ok(), "{}", template.key);
            assert_eq!(plan.steps.len(), template.steps.len());
            assert_eq!(plan.total_duration_sec(), template.total_duration_sec());
        }
        assert_eq!(find_template("sweetspot_45").unwrap().total_duration_sec(), 2700);
    }
}
