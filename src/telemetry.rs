use bytes::Buf;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, VeloxError},
    types::IndoorBikeMetrics,
};

/// Size of the Indoor Bike Data flag word
pub const FLAGS_SIZE: usize = 2;

/// Penalty added for each field outside its plausible range
pub const IMPLAUSIBLE_PENALTY: u32 = 1000;

/// Indoor Bike Data flag bits
pub mod flags {
    /// Instantaneous speed absent when set (per the FTMS convention)
    pub const MORE_DATA: u16 = 1 << 0;
    /// Average speed present
    pub const AVERAGE_SPEED: u16 = 1 << 1;
    /// Instantaneous cadence present
    pub const INSTANTANEOUS_CADENCE: u16 = 1 << 2;
    /// Average cadence present
    pub const AVERAGE_CADENCE: u16 = 1 << 3;
    /// Total distance present
    pub const TOTAL_DISTANCE: u16 = 1 << 4;
    /// Resistance level present
    pub const RESISTANCE_LEVEL: u16 = 1 << 5;
    /// Instantaneous power present
    pub const INSTANTANEOUS_POWER: u16 = 1 << 6;
    /// Average power present
    pub const AVERAGE_POWER: u16 = 1 << 7;
    /// Expended energy present
    pub const EXPENDED_ENERGY: u16 = 1 << 8;
    /// Heart rate present
    pub const HEART_RATE: u16 = 1 << 9;
    /// Metabolic equivalent present
    pub const METABOLIC_EQUIVALENT: u16 = 1 << 10;
    /// Elapsed time present
    pub const ELAPSED_TIME: u16 = 1 << 11;
    /// Remaining time present
    pub const REMAINING_TIME: u16 = 1 << 12;

    /// Names of the set flags, for diagnostics
    #[must_use]
    pub fn describe(raw: u16) -> Vec<&'static str> {
        const NAMES: [(u16, &str); 13] = [
            (MORE_DATA, "more_data"),
            (AVERAGE_SPEED, "average_speed"),
            (INSTANTANEOUS_CADENCE, "cadence"),
            (AVERAGE_CADENCE, "average_cadence"),
            (TOTAL_DISTANCE, "distance"),
            (RESISTANCE_LEVEL, "resistance"),
            (INSTANTANEOUS_POWER, "power"),
            (AVERAGE_POWER, "average_power"),
            (EXPENDED_ENERGY, "energy"),
            (HEART_RATE, "heart_rate"),
            (METABOLIC_EQUIVALENT, "met"),
            (ELAPSED_TIME, "elapsed_time"),
            (REMAINING_TIME, "remaining_time"),
        ];
        NAMES
            .iter()
            .filter(|(bit, _)| raw & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

type ApplyFn = fn(&[u8], &mut IndoorBikeMetrics);

/// One flag-selected optional field of the Indoor Bike Data layout
struct OptionalField {
    flag: u16,
    width: usize,
    name: &'static str,
    apply: Option<ApplyFn>,
}

fn apply_cadence(mut raw: &[u8], metrics: &mut IndoorBikeMetrics) {
    metrics.cadence_rpm = Some(f64::from(raw.get_u16_le()) / 2.0);
}

fn apply_power(mut raw: &[u8], metrics: &mut IndoorBikeMetrics) {
    metrics.power_watts = Some(raw.get_i16_le());
}

/// Optional fields in wire order. Only cadence and power are kept.
const INDOOR_BIKE_FIELDS: [OptionalField; 12] = [
    OptionalField { flag: flags::AVERAGE_SPEED, width: 2, name: "average speed", apply: None },
    OptionalField { flag: flags::INSTANTANEOUS_CADENCE, width: 2, name: "instantaneous cadence", apply: Some(apply_cadence) },
    OptionalField { flag: flags::AVERAGE_CADENCE, width: 2, name: "average cadence", apply: None },
    OptionalField { flag: flags::TOTAL_DISTANCE, width: 3, name: "total distance", apply: None },
    OptionalField { flag: flags::RESISTANCE_LEVEL, width: 2, name: "resistance level", apply: None },
    OptionalField { flag: flags::INSTANTANEOUS_POWER, width: 2, name: "instantaneous power", apply: Some(apply_power) },
    OptionalField { flag: flags::AVERAGE_POWER, width: 2, name: "average power", apply: None },
    OptionalField { flag: flags::EXPENDED_ENERGY, width: 5, name: "expended energy", apply: None },
    OptionalField { flag: flags::HEART_RATE, width: 1, name: "heart rate", apply: None },
    OptionalField { flag: flags::METABOLIC_EQUIVALENT, width: 1, name: "metabolic equivalent", apply: None },
    OptionalField { flag: flags::ELAPSED_TIME, width: 2, name: "elapsed time", apply: None },
    OptionalField { flag: flags::REMAINING_TIME, width: 2, name: "remaining time", apply: None },
];

/// One interpretation of an Indoor Bike Data payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Decoded metrics
    pub metrics: IndoorBikeMetrics,
    /// Whether this parse assumed the instantaneous speed field is present
    pub speed_present: bool,
    /// Bytes consumed, flag word included
    pub consumed: usize,
    /// Plausibility penalty, lower is better
    pub penalty: u32,
}

impl Candidate {
    /// Bytes left over after the last flagged field
    #[must_use]
    pub const fn trailing(&self, payload_len: usize) -> usize {
        payload_len.saturating_sub(self.consumed)
    }
}

fn take<'a>(payload: &'a [u8], offset: usize, width: usize, field: &'static str) -> Result<&'a [u8]> {
    payload
        .get(offset..offset + width)
        .ok_or(VeloxError::TruncatedField {
            field,
            offset,
            needed: width,
            len: payload.len(),
        })
}

fn read_flags(payload: &[u8]) -> Result<u16> {
    if payload.len() < FLAGS_SIZE {
        return Err(VeloxError::MalformedPayload {
            len: payload.len(),
            needed: FLAGS_SIZE,
        });
    }
    Ok((&payload[..FLAGS_SIZE]).get_u16_le())
}

/// Decode Indoor Bike Data under one speed-field assumption
///
/// # Errors
///
/// Returns [`VeloxError::MalformedPayload`] if the flag word is missing and
/// [`VeloxError::TruncatedField`] if a flagged field runs past the payload.
pub fn decode_indoor_bike_layout(payload: &[u8], speed_present: bool) -> Result<Candidate> {
    let raw_flags = read_flags(payload)?;
    let mut metrics = IndoorBikeMetrics::default();
    let mut offset = FLAGS_SIZE;

    if speed_present {
        let mut raw = take(payload, offset, 2, "instantaneous speed")?;
        metrics.speed_kmh = Some(f64::from(raw.get_u16_le()) / 100.0);
        offset += 2;
    }

    for field in INDOOR_BIKE_FIELDS.iter().filter(|f| raw_flags & f.flag != 0) {
        let raw = take(payload, offset, field.width, field.name)?;
        if let Some(apply) = field.apply {
            apply(raw, &mut metrics);
        }
        offset += field.width;
    }

    Ok(Candidate {
        metrics,
        speed_present,
        consumed: offset,
        penalty: plausibility_penalty(&metrics),
    })
}

/// Score decoded metrics; each value outside its plausible range adds
/// [`IMPLAUSIBLE_PENALTY`]
#[must_use]
pub fn plausibility_penalty(metrics: &IndoorBikeMetrics) -> u32 {
    let mut penalty = 0;
    if metrics.cadence_rpm.is_some_and(|c| !(0.0..=220.0).contains(&c)) {
        penalty += IMPLAUSIBLE_PENALTY;
    }
    if metrics.power_watts.is_some_and(|p| !(-200..=3000).contains(&p)) {
        penalty += IMPLAUSIBLE_PENALTY;
    }
    if metrics.speed_kmh.is_some_and(|s| !(0.0..=130.0).contains(&s)) {
        penalty += IMPLAUSIBLE_PENALTY;
    }
    penalty
}

/// Parse a payload under both speed-field assumptions, the flag-implied one first
///
/// # Errors
///
/// Returns [`VeloxError::MalformedPayload`] if the payload lacks a flag word.
pub fn indoor_bike_candidates(payload: &[u8]) -> Result<[Result<Candidate>; 2]> {
    let raw_flags = read_flags(payload)?;
    let preferred = raw_flags & flags::MORE_DATA == 0;
    Ok([
        decode_indoor_bike_layout(payload, preferred),
        decode_indoor_bike_layout(payload, !preferred),
    ])
}

/// Decode an Indoor Bike Data (0x2AD2) payload
///
/// Some trainers invert the "more data" flag that governs the instantaneous
/// speed field, so both layouts are parsed. The candidate with the lowest
/// plausibility penalty wins; ties go to the parse that leaves fewer trailing
/// bytes, then to the flag-implied layout.
///
/// # Errors
///
/// Returns [`VeloxError::MalformedPayload`] for payloads shorter than the flag
/// word, or the first parse error when neither layout decodes.
pub fn decode_indoor_bike(payload: &[u8]) -> Result<IndoorBikeMetrics> {
    let [preferred, alternate] = indoor_bike_candidates(payload)?;
    let best = match (preferred, alternate) {
        (Ok(a), Ok(b)) => {
            if (b.penalty, b.trailing(payload.len())) < (a.penalty, a.trailing(payload.len())) {
                b
            } else {
                a
            }
        }
        (Ok(only), Err(_)) | (Err(_), Ok(only)) => only,
        (Err(first), Err(_)) => return Err(first),
    };
    Ok(best.metrics)
}

/// Cycling Power Measurement flag bits
pub mod cycling_power_flags {
    /// Pedal power balance present
    pub const PEDAL_POWER_BALANCE: u16 = 1 << 0;
    /// Accumulated torque present
    pub const ACCUMULATED_TORQUE: u16 = 1 << 2;
    /// Wheel revolution data present
    pub const WHEEL_REVOLUTION: u16 = 1 << 4;
    /// Crank revolution data present
    pub const CRANK_REVOLUTION: u16 = 1 << 5;
    /// Extreme force magnitudes present
    pub const EXTREME_FORCE: u16 = 1 << 6;
    /// Extreme torque magnitudes present
    pub const EXTREME_TORQUE: u16 = 1 << 7;
    /// Extreme angles present
    pub const EXTREME_ANGLES: u16 = 1 << 8;
    /// Top dead spot angle present
    pub const TOP_DEAD_SPOT: u16 = 1 << 9;
    /// Bottom dead spot angle present
    pub const BOTTOM_DEAD_SPOT: u16 = 1 << 10;
    /// Accumulated energy present
    pub const ACCUMULATED_ENERGY: u16 = 1 << 11;
}

/// Flag and width of every optional Cycling Power field, in wire order
const CYCLING_POWER_FIELDS: [(u16, usize); 10] = [
    (cycling_power_flags::PEDAL_POWER_BALANCE, 1),
    (cycling_power_flags::ACCUMULATED_TORQUE, 2),
    (cycling_power_flags::WHEEL_REVOLUTION, 6),
    (cycling_power_flags::CRANK_REVOLUTION, 4),
    (cycling_power_flags::EXTREME_FORCE, 4),
    (cycling_power_flags::EXTREME_TORQUE, 4),
    (cycling_power_flags::EXTREME_ANGLES, 3),
    (cycling_power_flags::TOP_DEAD_SPOT, 2),
    (cycling_power_flags::BOTTOM_DEAD_SPOT, 2),
    (cycling_power_flags::ACCUMULATED_ENERGY, 2),
];

/// Crank event time resolution in ticks per second
pub const CRANK_TICKS_PER_SECOND: f64 = 1024.0;

/// Best-effort result of one Cycling Power Measurement (0x2A63)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CyclingPowerSample {
    /// Instantaneous power in watts
    pub power_watts: Option<i16>,
    /// Crank cadence derived from this and the previous sample
    pub cadence_rpm: Option<f64>,
}

/// Stateful Cycling Power Measurement decoder
///
/// Cadence needs the previous crank sample, so one decoder lives per connection.
#[derive(Debug, Clone, Default)]
pub struct CyclingPowerDecoder {
    last_crank: Option<(u16, u16)>,
}

impl CyclingPowerDecoder {
    /// Create a decoder with no crank history
    #[must_use]
    pub const fn new() -> Self {
        Self { last_crank: None }
    }

    /// Decode a measurement; truncated payloads yield whatever was decoded
    /// before the missing field
    pub fn decode(&mut self, payload: &[u8]) -> CyclingPowerSample {
        if payload.len() < 4 {
            return CyclingPowerSample::default();
        }
        let mut header = payload;
        let raw_flags = header.get_u16_le();
        let power = header.get_i16_le();
        let mut sample = CyclingPowerSample {
            power_watts: Some(power),
            cadence_rpm: None,
        };

        let mut offset = 4;
        for (flag, width) in CYCLING_POWER_FIELDS {
            if raw_flags & flag == 0 {
                continue;
            }
            let Some(mut raw) = payload.get(offset..offset + width) else {
                return sample;
            };
            if flag == cycling_power_flags::CRANK_REVOLUTION {
                let revolutions = raw.get_u16_le();
                let event_time = raw.get_u16_le();
                sample.cadence_rpm = self.crank_cadence(revolutions, event_time, power);
            }
            offset += width;
        }
        sample
    }

    fn crank_cadence(&mut self, revolutions: u16, event_time: u16, power: i16) -> Option<f64> {
        let previous = self.last_crank.replace((revolutions, event_time));
        let (last_revolutions, last_event_time) = previous?;
        let delta_revolutions = revolutions.wrapping_sub(last_revolutions);
        let delta_ticks = event_time.wrapping_sub(last_event_time);
        if delta_ticks > 0 {
            Some(f64::from(delta_revolutions) * 60.0 * CRANK_TICKS_PER_SECOND / f64::from(delta_ticks))
        } else if power == 0 {
            Some(0.0)
        } else {
            None
        }
    }
}

/// Per-connection merge of Indoor Bike Data and Cycling Power telemetry
///
/// Indoor Bike Data is authoritative for power and speed. Crank-derived
/// cadence wins once it has been observed; before that the FTMS cadence is
/// used unless it is missing or exactly zero.
#[derive(Debug, Clone, Default)]
pub struct MetricsMerger {
    ftms: IndoorBikeMetrics,
    cycling_power: Option<i16>,
    crank_cadence: Option<f64>,
    cycling_power_decoder: CyclingPowerDecoder,
}

impl MetricsMerger {
    /// Create an empty merger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record decoded Indoor Bike Data
    pub fn apply_indoor_bike(&mut self, metrics: IndoorBikeMetrics) {
        self.ftms = metrics;
    }

    /// Decode and record a Cycling Power Measurement payload
    pub fn apply_cycling_power(&mut self, payload: &[u8]) -> CyclingPowerSample {
        let sample = self.cycling_power_decoder.decode(payload);
        self.cycling_power = sample.power_watts;
        if sample.cadence_rpm.is_some() {
            self.crank_cadence = sample.cadence_rpm;
        }
        sample
    }

    /// Current merged snapshot
    #[must_use]
    pub fn merged(&self) -> IndoorBikeMetrics {
        let cadence_rpm = match (self.crank_cadence, self.ftms.cadence_rpm) {
            (Some(crank), _) => Some(crank),
            (None, Some(ftms)) if ftms != 0.0 => Some(ftms),
            (None, _) => None,
        };
        IndoorBikeMetrics {
            power_watts: self.ftms.power_watts.or(self.cycling_power),
            cadence_rpm,
            speed_kmh: self.ftms.speed_kmh,
        }
    }
}
