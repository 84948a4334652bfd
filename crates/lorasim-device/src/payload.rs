//! ---
//! sim_section: "02-device-model"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Deterministic payload generators for simulated sensors."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use std::f64::consts::PI;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, TimeZone, Timelike, Utc};
use lorasim_common::{PayloadProfile, Result, SimulatorError};
use rand::prelude::*;
use rand_distr::Normal;

use crate::event::SensorReading;

const BATTERY_TAG: u8 = 0x10;
const TEMPERATURE_TAG: u8 = 0x20;
const NOISE_SIGMA: f64 = 0.1;

/// Inputs of one payload computation.
#[derive(Debug, Clone, Copy)]
pub struct PayloadContext {
    pub seq: u32,
    pub timestamp: DateTime<Utc>,
    /// Time since the battery discharge cycle started.
    pub cycle_elapsed: Duration,
}

/// Payload generator compiled from a [`PayloadProfile`].
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadGenerator {
    Temperature {
        baseline: i32,
        day_delta: i32,
        discharge: Duration,
        local_offset: FixedOffset,
    },
    Counter,
    Random {
        length: usize,
    },
    Fixed(Vec<u8>),
}

impl PayloadGenerator {
    pub fn from_profile(profile: &PayloadProfile) -> Result<Self> {
        Ok(match profile {
            PayloadProfile::Temperature {
                baseline_temperature,
                day_temperature_delta,
                discharge_time,
                utc_offset_minutes,
            } => PayloadGenerator::Temperature {
                baseline: *baseline_temperature,
                day_delta: *day_temperature_delta,
                discharge: *discharge_time,
                local_offset: FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60))
                    .ok_or_else(|| {
                        SimulatorError::configuration(format!(
                            "utc_offset_minutes {} out of range",
                            utc_offset_minutes
                        ))
                    })?,
            },
            PayloadProfile::Counter => PayloadGenerator::Counter,
            PayloadProfile::Random { length } => PayloadGenerator::Random { length: *length },
            PayloadProfile::Fixed { hex: encoded } => {
                let bytes = hex::decode(encoded).map_err(|err| {
                    SimulatorError::configuration(format!("fixed payload hex: {}", err))
                })?;
                PayloadGenerator::Fixed(bytes)
            }
        })
    }

    /// Whether the payload reports a battery level that downlinks may reset.
    pub fn has_battery(&self) -> bool {
        matches!(self, PayloadGenerator::Temperature { .. })
    }

    /// Produce the payload bytes. `rng` must be seeded per uplink so the
    /// result depends only on seed, sequence number and timestamp.
    pub fn generate(&self, rng: &mut StdRng, ctx: &PayloadContext) -> Vec<u8> {
        match self {
            PayloadGenerator::Temperature {
                baseline,
                day_delta,
                discharge,
                local_offset,
            } => {
                let battery = battery_level(ctx.cycle_elapsed, *discharge);
                let noise = Normal::new(0.0, NOISE_SIGMA)
                    .map(|normal| rng.sample(normal))
                    .unwrap_or(0.0);
                let local = ctx.timestamp.with_timezone(local_offset);
                let temperature = temperature(*baseline, *day_delta, &local) + noise;
                encode_temperature(battery, temperature as f32)
            }
            PayloadGenerator::Counter => ctx.seq.to_be_bytes().to_vec(),
            PayloadGenerator::Random { length } => {
                let mut bytes = vec![0u8; *length];
                rng.fill_bytes(&mut bytes);
                bytes
            }
            PayloadGenerator::Fixed(bytes) => bytes.clone(),
        }
    }

    /// Decoded view of a payload this generator produced. Only the
    /// temperature profile has one.
    pub fn decode(&self, bytes: &[u8]) -> Option<SensorReading> {
        if !self.has_battery() {
            return None;
        }
        match bytes {
            [BATTERY_TAG, b0, b1, b2, b3, TEMPERATURE_TAG, t0, t1, t2, t3] => Some(SensorReading {
                battery: i32::from_be_bytes([*b0, *b1, *b2, *b3]),
                temperature: f32::from_be_bytes([*t0, *t1, *t2, *t3]),
            }),
            _ => None,
        }
    }
}

/// Remaining battery in percent after `elapsed` of a `discharge` cycle.
pub fn battery_level(elapsed: Duration, discharge: Duration) -> i32 {
    let total = discharge.as_millis();
    if total == 0 {
        return 100;
    }
    let spent = elapsed.as_millis() % total;
    (100 - (100 * spent) / total) as i32
}

/// Seasonal offset by zero-based month index.
pub fn season_baseline(month0: u32) -> i32 {
    match month0 {
        2..=4 => 10,
        5..=7 => 20,
        8..=10 => 15,
        _ => 5,
    }
}

/// Noise-free temperature reading at the sensor's local `timestamp`.
pub fn temperature<Tz: TimeZone>(baseline: i32, day_delta: i32, timestamp: &DateTime<Tz>) -> f64 {
    let hour = f64::from(timestamp.hour());
    f64::from(baseline + season_baseline(timestamp.month0()))
        + (PI * hour / 24.0).sin() * f64::from(day_delta)
}

fn encode_temperature(battery: i32, temperature: f32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    bytes.push(BATTERY_TAG);
    bytes.extend_from_slice(&battery.to_be_bytes());
    bytes.push(TEMPERATURE_TAG);
    bytes.extend_from_slice(&temperature.to_be_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(seq: u32, cycle_elapsed: Duration) -> PayloadContext {
        PayloadContext {
            seq,
            timestamp: Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap(),
            cycle_elapsed,
        }
    }

    #[test]
    fn battery_discharges_and_wraps() {
        let day = Duration::from_secs(86_400);
        assert_eq!(battery_level(Duration::ZERO, day), 100);
        assert_eq!(battery_level(Duration::from_secs(43_200), day), 50);
        assert_eq!(battery_level(day, day), 100);
    }

    #[test]
    fn seasons_follow_month_index() {
        assert_eq!(season_baseline(0), 5);
        assert_eq!(season_baseline(3), 10);
        assert_eq!(season_baseline(6), 20);
        assert_eq!(season_baseline(9), 15);
        assert_eq!(season_baseline(11), 5);
    }

    #[test]
    fn temperature_payload_layout() {
        let generator = PayloadGenerator::from_profile(&PayloadProfile::temperature(2, 10)).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let bytes = generator.generate(&mut rng, &ctx(1, Duration::ZERO));
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes[0], BATTERY_TAG);
        assert_eq!(i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]), 100);
        assert_eq!(bytes[5], TEMPERATURE_TAG);
        let reading = f32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        // July noon: 2 + 20 + sin(pi/2) * 10
        assert!((reading - 32.0).abs() < 1.0, "reading {}", reading);

        let decoded = generator.decode(&bytes).expect("temperature payload decodes");
        assert_eq!(decoded.battery, 100);
        assert_eq!(decoded.temperature, reading);
        assert_eq!(generator.decode(&bytes[..9]), None);
        assert_eq!(PayloadGenerator::Counter.decode(&bytes), None);
    }

    #[test]
    fn season_and_hour_follow_the_local_offset() {
        // 2024-02-29 23:00 UTC is already March, 09:00 at UTC+10.
        let at = Utc.with_ymd_and_hms(2024, 2, 29, 23, 0, 0).unwrap();
        let utc = temperature(0, 10, &at);
        let sydney = temperature(0, 10, &at.with_timezone(&FixedOffset::east_opt(10 * 3600).unwrap()));
        assert!((utc - (5.0 + (PI * 23.0 / 24.0).sin() * 10.0)).abs() < 1e-9);
        assert!((sydney - (10.0 + (PI * 9.0 / 24.0).sin() * 10.0)).abs() < 1e-9);

        let profile = PayloadProfile::Temperature {
            baseline_temperature: 0,
            day_temperature_delta: 0,
            discharge_time: Duration::from_secs(60),
            utc_offset_minutes: 10 * 60,
        };
        let generator = PayloadGenerator::from_profile(&profile).unwrap();
        let bytes = generator.generate(
            &mut StdRng::seed_from_u64(1),
            &PayloadContext {
                seq: 1,
                timestamp: at,
                cycle_elapsed: Duration::ZERO,
            },
        );
        let reading = generator.decode(&bytes).unwrap();
        assert!((reading.temperature - 10.0).abs() < 1.0, "reading {:?}", reading);
    }

    #[test]
    fn counter_and_fixed_payloads() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(
            PayloadGenerator::Counter.generate(&mut rng, &ctx(258, Duration::ZERO)),
            vec![0, 0, 1, 2]
        );
        let fixed = PayloadGenerator::from_profile(&PayloadProfile::Fixed {
            hex: "cafe".into(),
        })
        .unwrap();
        assert_eq!(fixed.generate(&mut rng, &ctx(1, Duration::ZERO)), vec![0xca, 0xfe]);
    }

    #[test]
    fn random_payload_is_reproducible_for_the_same_rng_state() {
        let generator = PayloadGenerator::Random { length: 16 };
        let a = generator.generate(&mut StdRng::seed_from_u64(42), &ctx(1, Duration::ZERO));
        let b = generator.generate(&mut StdRng::seed_from_u64(42), &ctx(1, Duration::ZERO));
        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
    }
}
