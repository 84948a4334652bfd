//! ---
//! sim_section: "02-device-model"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Simulated end-device state machine."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use lorasim_common::{DeviceConfig, Result};
use rand::prelude::*;
use tracing::{debug, error, warn};

use crate::event::{DownlinkCommand, DownlinkEffect, UplinkEvent, DEFAULT_F_PORT};
use crate::payload::{PayloadContext, PayloadGenerator};

const OPCODE_SET_INTERVAL: u8 = 0x01;
const OPCODE_RESET_BATTERY: u8 = 0x02;

/// One simulated end-device.
///
/// The device owns its sequence counter and refuses to emit more often than
/// its interval, whatever the caller does.
#[derive(Debug, Clone)]
pub struct Device {
    application_id: String,
    device_id: String,
    interval: Duration,
    generator: PayloadGenerator,
    seed: u64,
    seq: u32,
    last_emission: Option<DateTime<Utc>>,
    /// `None` until the first emission of a discharge cycle.
    cycle_elapsed: Option<Duration>,
    pending_ack: Option<String>,
    last_downlink: Option<Vec<u8>>,
    downlinks_applied: u64,
}

impl Device {
    pub fn from_config(application_id: &str, config: &DeviceConfig) -> Result<Self> {
        config.validate()?;
        let generator = PayloadGenerator::from_profile(&config.payload)?;
        let seed = if config.jitter {
            config.seed ^ rand::random::<u64>()
        } else {
            config.seed
        };
        Ok(Self {
            application_id: application_id.to_owned(),
            device_id: config.device_id.clone(),
            interval: config.interval,
            generator,
            seed,
            seq: 0,
            last_emission: None,
            cycle_elapsed: None,
            pending_ack: None,
            last_downlink: None,
            downlinks_applied: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.device_id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sequence number of the last emitted uplink, 0 before the first one.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn last_emission(&self) -> Option<DateTime<Utc>> {
        self.last_emission
    }

    pub fn pending_ack(&self) -> Option<&str> {
        self.pending_ack.as_deref()
    }

    pub fn last_downlink(&self) -> Option<&[u8]> {
        self.last_downlink.as_deref()
    }

    pub fn downlinks_applied(&self) -> u64 {
        self.downlinks_applied
    }

    /// Emit the next uplink at `now`, or `None` if the previous emission was
    /// less than one interval ago.
    pub fn next_uplink(&mut self, now: DateTime<Utc>) -> Option<UplinkEvent> {
        if let Some(last) = self.last_emission {
            let since = (now - last).to_std().unwrap_or(Duration::ZERO);
            if since < self.interval {
                debug!(
                    device_id = %self.device_id,
                    since_ms = since.as_millis() as u64,
                    interval_ms = self.interval.as_millis() as u64,
                    "uplink suppressed, interval not elapsed"
                );
                return None;
            }
        }
        let Some(seq) = self.seq.checked_add(1) else {
            error!(
                device_id = %self.device_id,
                seq = self.seq,
                "sequence counter exhausted, device stops emitting"
            );
            return None;
        };
        let cycle_elapsed = self
            .cycle_elapsed
            .map_or(Duration::ZERO, |elapsed| elapsed + self.interval);
        self.cycle_elapsed = Some(cycle_elapsed);

        self.seq = seq;
        let mut rng = StdRng::seed_from_u64(mix_seed(self.seed, self.seq));
        let payload = self.generator.generate(
            &mut rng,
            &PayloadContext {
                seq: self.seq,
                timestamp: now,
                cycle_elapsed,
            },
        );
        let object = self.generator.decode(&payload);
        let rssi = rng.gen_range(-120..=-40);
        let snr = f64::from(rng.gen_range(-200..=100)) / 10.0;
        self.last_emission = Some(now);

        Some(UplinkEvent {
            application_id: self.application_id.clone(),
            device_id: self.device_id.clone(),
            seq: self.seq,
            timestamp: now,
            payload,
            rssi,
            snr,
            f_port: DEFAULT_F_PORT,
            ack: self.pending_ack.take(),
            object,
        })
    }

    /// Apply a downlink. Already emitted uplinks are never affected.
    pub fn apply_downlink(&mut self, command: &DownlinkCommand) -> DownlinkEffect {
        self.downlinks_applied += 1;
        if command.confirmed {
            self.pending_ack = Some(command.correlation_id.clone());
        }

        let effect = match command.payload.split_first() {
            Some((&OPCODE_SET_INTERVAL, rest)) => match <[u8; 4]>::try_from(rest) {
                Ok(raw) if u32::from_be_bytes(raw) > 0 => {
                    self.interval = Duration::from_millis(u64::from(u32::from_be_bytes(raw)));
                    DownlinkEffect::IntervalChanged {
                        interval: self.interval,
                    }
                }
                Ok(_) => DownlinkEffect::Ignored {
                    reason: "interval must be greater than zero".into(),
                },
                Err(_) => DownlinkEffect::Ignored {
                    reason: format!("interval opcode expects 4 bytes, got {}", rest.len()),
                },
            },
            Some((&OPCODE_RESET_BATTERY, [])) if self.generator.has_battery() => {
                self.cycle_elapsed = None;
                DownlinkEffect::BatteryReset
            }
            _ => {
                self.last_downlink = Some(command.payload.clone());
                DownlinkEffect::Stored
            }
        };

        if let DownlinkEffect::Ignored { reason } = &effect {
            warn!(
                device_id = %self.device_id,
                correlation_id = %command.correlation_id,
                %reason,
                "downlink ignored"
            );
        }
        effect
    }
}

/// Derive the per-uplink RNG seed.
fn mix_seed(seed: u64, seq: u32) -> u64 {
    let mut z = seed ^ u64::from(seq).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lorasim_common::PayloadProfile;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap()
    }

    fn device(profile: PayloadProfile) -> Device {
        let config = DeviceConfig::new("dev-1", Duration::from_secs(1))
            .with_payload(profile)
            .with_seed(42);
        Device::from_config("app", &config).unwrap()
    }

    fn command(payload: Vec<u8>, confirmed: bool) -> DownlinkCommand {
        DownlinkCommand {
            device_id: "dev-1".into(),
            confirmed,
            payload,
            correlation_id: "corr-1".into(),
            f_port: None,
        }
    }

    #[test]
    fn sequence_starts_at_one_and_enforces_spacing() {
        let mut device = device(PayloadProfile::Counter);
        let first = device.next_uplink(epoch()).expect("first uplink");
        assert_eq!(first.seq, 1);
        assert_eq!(first.payload, vec![0, 0, 0, 1]);
        assert_eq!(first.f_port, DEFAULT_F_PORT);

        let early = epoch() + chrono::Duration::milliseconds(999);
        assert!(device.next_uplink(early).is_none());
        assert_eq!(device.seq(), 1);

        let second = device
            .next_uplink(epoch() + chrono::Duration::seconds(1))
            .expect("second uplink");
        assert_eq!(second.seq, 2);
    }

    #[test]
    fn confirmed_downlink_is_acknowledged_once() {
        let mut device = device(PayloadProfile::Counter);
        device.next_uplink(epoch()).unwrap();
        assert_eq!(device.apply_downlink(&command(vec![0xff], true)), DownlinkEffect::Stored);
        assert_eq!(device.last_downlink(), Some(&[0xff][..]));

        let acked = device
            .next_uplink(epoch() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(acked.ack.as_deref(), Some("corr-1"));
        let after = device
            .next_uplink(epoch() + chrono::Duration::seconds(2))
            .unwrap();
        assert_eq!(after.ack, None);
    }

    #[test]
    fn interval_opcode_updates_cadence() {
        let mut device = device(PayloadProfile::Counter);
        let effect = device.apply_downlink(&command(vec![0x01, 0, 0, 0x0b, 0xb8], false));
        assert_eq!(
            effect,
            DownlinkEffect::IntervalChanged {
                interval: Duration::from_millis(3000)
            }
        );
        assert_eq!(device.interval(), Duration::from_millis(3000));

        let zero = device.apply_downlink(&command(vec![0x01, 0, 0, 0, 0], false));
        assert!(matches!(zero, DownlinkEffect::Ignored { .. }));
        assert_eq!(device.interval(), Duration::from_millis(3000));
        assert_eq!(device.downlinks_applied(), 2);
    }

    #[test]
    fn battery_reset_restarts_discharge_cycle() {
        let mut device = device(PayloadProfile::Temperature {
            baseline_temperature: 0,
            day_temperature_delta: 0,
            discharge_time: Duration::from_secs(4),
            utc_offset_minutes: 0,
        });
        let battery = |event: &UplinkEvent| {
            i32::from_be_bytes([event.payload[1], event.payload[2], event.payload[3], event.payload[4]])
        };
        let mut now = epoch();
        let mut levels = Vec::new();
        for _ in 0..3 {
            levels.push(battery(&device.next_uplink(now).unwrap()));
            now += chrono::Duration::seconds(1);
        }
        assert_eq!(levels, vec![100, 75, 50]);

        assert_eq!(device.apply_downlink(&command(vec![0x02], false)), DownlinkEffect::BatteryReset);
        assert_eq!(battery(&device.next_uplink(now).unwrap()), 100);
    }

    #[test]
    fn battery_opcode_is_stored_for_profiles_without_battery() {
        let mut device = device(PayloadProfile::Counter);
        assert_eq!(device.apply_downlink(&command(vec![0x02], false)), DownlinkEffect::Stored);
    }

    #[test]
    fn payload_is_deterministic_for_the_same_seed() {
        let run = || {
            let mut device = device(PayloadProfile::Random { length: 8 });
            (0..3)
                .map(|i| {
                    device
                        .next_uplink(epoch() + chrono::Duration::seconds(i))
                        .unwrap()
                })
                .collect::<Vec<_>>()
        };
        let a = run();
        let b = run();
        assert_eq!(a, b);
        assert_ne!(a[0].payload, a[1].payload);
    }

    #[test]
    fn exhausted_sequence_stops_emission_instead_of_wrapping() {
        let mut device = device(PayloadProfile::Counter);
        device.seq = u32::MAX - 1;
        let last = device.next_uplink(epoch()).expect("final uplink");
        assert_eq!(last.seq, u32::MAX);

        let later = epoch() + chrono::Duration::seconds(5);
        assert!(device.next_uplink(later).is_none());
        assert_eq!(device.seq(), u32::MAX);
        assert_eq!(device.last_emission(), Some(epoch()));
    }

    #[test]
    fn temperature_uplinks_carry_their_decoded_reading() {
        let mut device = device(PayloadProfile::temperature(2, 10));
        let event = device.next_uplink(epoch()).unwrap();
        let reading = event.object.expect("temperature reading");
        assert_eq!(reading.battery, 100);
        assert_eq!(
            reading.temperature,
            f32::from_be_bytes([event.payload[6], event.payload[7], event.payload[8], event.payload[9]])
        );

        let mut counter = self::device(PayloadProfile::Counter);
        assert_eq!(counter.next_uplink(epoch()).unwrap().object, None);
    }
}
