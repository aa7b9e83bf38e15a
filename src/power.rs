//! Calibration-corrected power computation
//!
//! Circles count raw pulses. Each device has four calibration coefficients
//! that map raw pulses to corrected pulses with a quadratic:
//!
//! ```text
//! p         = pulses / seconds
//! corrected = seconds * ((p + off_noise)^2 * gain_b + (p + off_noise) * gain_a + off_tot)
//! ```
//!
//! Corrected pulses convert to kWs with the fixed ratio
//! [`PULSES_PER_KW_SECOND`]. The inverse mapping (watts to raw pulses) is used
//! when encoding schedule thresholds.

use serde::{Deserialize, Serialize};

use crate::error::{PlugwiseError, PlugwiseResult};
use crate::protocol::PulseCounters;

/// Corrected pulses per kW·s
pub const PULSES_PER_KW_SECOND: f64 = 468.9385193;

/// Per-device calibration coefficients, fetched once and cached
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub gain_a: f64,
    pub gain_b: f64,
    pub off_tot: f64,
    pub off_noise: f64,
}

impl Calibration {
    /// Identity calibration: corrected pulses equal raw pulses
    pub const fn identity() -> Self {
        Self {
            gain_a: 1.0,
            gain_b: 0.0,
            off_tot: 0.0,
            off_noise: 0.0,
        }
    }

    /// Correct a raw pulse count measured over `seconds`
    ///
    /// Returns 0 when the correction would flip the sign of the reading.
    pub fn correct(&self, pulses: f64, seconds: f64) -> f64 {
        if pulses == 0.0 || seconds <= 0.0 {
            return 0.0;
        }
        let p = pulses / seconds + self.off_noise;
        let corrected = seconds * (p * p * self.gain_b + p * self.gain_a + self.off_tot);
        if (pulses > 0.0 && corrected < 0.0) || (pulses < 0.0 && corrected > 0.0) {
            return 0.0;
        }
        corrected
    }

    /// Raw pulses over `seconds` that correspond to a steady `watt` load
    pub fn watt_to_pulses(&self, watt: f64, seconds: f64) -> PlugwiseResult<f64> {
        if watt == 0.0 {
            return Ok(0.0);
        }
        let corrected_1s = watt * PULSES_PER_KW_SECOND / 1000.0;

        let raw_1s = if self.gain_b == 0.0 {
            if self.gain_a == 0.0 {
                return Err(PlugwiseError::value("calibration has zero gain"));
            }
            (corrected_1s - self.off_tot) / self.gain_a - self.off_noise
        } else {
            let discriminant =
                self.gain_a * self.gain_a + 4.0 * self.gain_b * (corrected_1s - self.off_tot);
            if discriminant < 0.0 {
                return Err(PlugwiseError::value(format!(
                    "{} W is outside the calibrated range",
                    watt
                )));
            }
            (discriminant.sqrt() - self.gain_a - 2.0 * self.gain_b * self.off_noise)
                / (2.0 * self.gain_b)
        };

        if (corrected_1s > 0.0 && raw_1s < 0.0) || (corrected_1s < 0.0 && raw_1s > 0.0) {
            return Ok(0.0);
        }
        Ok(seconds * raw_1s)
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::identity()
    }
}

/// Convert corrected pulses to kW·s
pub fn pulses_to_kws(pulses: f64) -> f64 {
    pulses / PULSES_PER_KW_SECOND
}

/// Watt values computed from one power usage reply
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerReading {
    pub watts_1s: f64,
    pub watts_8s: f64,
    /// Average over the current hour, consumption
    pub watts_1h: f64,
    /// Average over the current hour, production
    pub watts_prod_1h: f64,
}

impl PowerReading {
    /// Apply calibration, unit conversion and polarity to raw counters
    ///
    /// Production pulses are ignored unless the device logs production.
    pub fn from_counters(
        counters: &PulseCounters,
        calibration: &Calibration,
        reverse_polarity: bool,
        production: bool,
    ) -> Self {
        let watts = |pulses: i64, seconds: f64| {
            1000.0 * pulses_to_kws(calibration.correct(pulses as f64, seconds)) / seconds
        };
        let prod_pulses = if production { counters.pulse_prod_1h } else { 0 };

        let reading = Self {
            watts_1s: watts(counters.pulse_1s, 1.0),
            watts_8s: watts(counters.pulse_8s, 8.0),
            watts_1h: watts(counters.pulse_1h, 3600.0),
            watts_prod_1h: watts(prod_pulses, 3600.0),
        };
        if reverse_polarity {
            reading.negated()
        } else {
            reading
        }
    }

    fn negated(self) -> Self {
        Self {
            watts_1s: -self.watts_1s,
            watts_8s: -self.watts_8s,
            watts_1h: -self.watts_1h,
            watts_prod_1h: -self.watts_prod_1h,
        }
    }

    /// Net average over the current hour
    pub fn net_1h(&self) -> f64 {
        self.watts_1h - self.watts_prod_1h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_calibration() -> Calibration {
        Calibration {
            gain_a: 0.98,
            gain_b: -2.0e-6,
            off_tot: 0.1,
            off_noise: 0.02,
        }
    }

    #[test]
    fn test_identity_calibration_scenario() {
        let counters = PulseCounters { pulse_1s: 469, ..Default::default() };
        let reading = PowerReading::from_counters(&counters, &Calibration::identity(), false, false);
        assert!((reading.watts_1s - 1000.0).abs() < 0.5, "{}", reading.watts_1s);
    }

    #[test]
    fn test_zero_pulses_stay_zero() {
        let cal = sample_calibration();
        assert_eq!(cal.correct(0.0, 1.0), 0.0);
        assert_eq!(cal.correct(0.0, 3600.0), 0.0);
    }

    #[test]
    fn test_sign_flip_clamps_to_zero() {
        let cal = Calibration { gain_a: 1.0, gain_b: 0.0, off_tot: -5.0, off_noise: 0.0 };
        assert_eq!(cal.correct(2.0, 1.0), 0.0);
        assert!(cal.correct(10.0, 1.0) > 0.0);
    }

    #[test]
    fn test_polarity_and_production() {
        let counters = PulseCounters {
            pulse_1s: 469,
            pulse_8s: 8 * 469,
            pulse_1h: 3600 * 469,
            pulse_prod_1h: 3600 * 100,
        };
        let cal = Calibration::identity();

        let normal = PowerReading::from_counters(&counters, &cal, false, false);
        assert_eq!(normal.watts_prod_1h, 0.0);
        assert!((normal.watts_8s - normal.watts_1s).abs() < 1e-6);
        assert!((normal.watts_1h - normal.watts_1s).abs() < 1e-6);

        let with_prod = PowerReading::from_counters(&counters, &cal, false, true);
        assert!(with_prod.watts_prod_1h > 0.0);
        assert!(with_prod.net_1h() < with_prod.watts_1h);

        let reversed = PowerReading::from_counters(&counters, &cal, true, true);
        assert_eq!(reversed.watts_1s, -with_prod.watts_1s);
        assert_eq!(reversed.watts_prod_1h, -with_prod.watts_prod_1h);
    }

    #[test]
    fn test_watt_to_pulses_inverts_correction() {
        let cal = sample_calibration();
        for watt in [1.0, 25.0, 60.0, 500.0, 2000.0] {
            let raw = cal.watt_to_pulses(watt, 1.0).unwrap();
            let back = 1000.0 * pulses_to_kws(cal.correct(raw, 1.0));
            assert!((back - watt).abs() < 1e-6, "{} W -> {} pulses -> {} W", watt, raw, back);
        }
    }

    #[test]
    fn test_watt_to_pulses_linear() {
        let cal = Calibration::identity();
        let raw = cal.watt_to_pulses(1000.0, 1.0).unwrap();
        assert!((raw - PULSES_PER_KW_SECOND).abs() < 1e-9);
        assert_eq!(cal.watt_to_pulses(0.0, 1.0).unwrap(), 0.0);

        let dead = Calibration { gain_a: 0.0, ..Calibration::identity() };
        assert!(dead.watt_to_pulses(10.0, 1.0).is_err());
    }
}
