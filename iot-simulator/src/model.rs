//! # Model
//!
//! Fabricates sensor readings for the simulated data source.
use chrono::{NaiveDateTime, Timelike};
use iot_common::record::RawReading;
use rand::Rng;

/// Scale of the humidity curve.
const HUMIDITY_A: f64 = 100.0;
/// Decay of the humidity curve per degree.
const HUMIDITY_B: f64 = 0.05;

/// Humidity derived from temperature, `a * exp(-b * t)`, rounded to two
/// decimals. Non-finite results fall back to 0.
pub fn humidity_model(temperature: f64) -> f64 {
    let humidity = round2(HUMIDITY_A * (-HUMIDITY_B * temperature).exp());
    if humidity.is_finite() {
        humidity
    } else {
        0.0
    }
}

/// A reading from one of three devices, with a temperature between 900 and 1000.
pub fn generate<R: Rng + ?Sized>(rng: &mut R, now: NaiveDateTime) -> RawReading {
    let temperature = round2(rng.gen_range(0.9..1.0) * 1000.0);

    RawReading {
        device_id: rng.gen_range(0..=2),
        temperature,
        humidity: humidity_model(temperature),
        timestamp: wall_clock(now),
    }
}

/// Microsecond precision, with the fraction left out when it is zero.
fn wall_clock(now: NaiveDateTime) -> String {
    match now.nanosecond() / 1000 {
        0 => now.format("%Y-%m-%dT%H:%M:%S").to_string(),
        _ => now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
