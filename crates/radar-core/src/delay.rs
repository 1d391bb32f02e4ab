//! Per-beam fractional delay parameters and LFM waveform parameters.

use crate::error::{RadarError, Result};
use crate::lagrange::LAGRANGE_ROWS;
use serde::{Deserialize, Serialize};

/// One per-beam delay: an integer sample offset plus a fractional-part index
/// into the 48-row Lagrange table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct DelayParams {
    pub delay_integer: i32,
    pub lagrange_row: u32,
}

impl DelayParams {
    pub fn new(delay_integer: i32, lagrange_row: u32) -> Self {
        Self {
            delay_integer,
            lagrange_row: lagrange_row % LAGRANGE_ROWS as u32,
        }
    }

    /// Effective delay in samples: `delay_integer + lagrange_row / 48`.
    pub fn as_samples(&self) -> f64 {
        self.delay_integer as f64 + self.lagrange_row as f64 / LAGRANGE_ROWS as f64
    }

    /// Build the nearest representable `DelayParams` for a floating delay `d`.
    pub fn from_samples(d: f64) -> Self {
        let delay_integer = d.floor();
        let frac = d - delay_integer;
        let lagrange_row = (frac * LAGRANGE_ROWS as f64).floor() as i64;
        let lagrange_row = lagrange_row.rem_euclid(LAGRANGE_ROWS as i64) as u32;
        Self {
            delay_integer: delay_integer as i32,
            lagrange_row,
        }
    }
}

/// Symmetric boundary reflection against `[0, len)`, periodic with period
/// `2 * (len - 1)`. Implemented without branches beyond a single conditional
/// flip, matching the branch-free requirement of the fractional-delay kernel.
pub fn reflect(index: i64, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len as i64 - 1);
    let mut m = index.rem_euclid(period);
    if m >= len as i64 {
        m = period - m;
    }
    m as usize
}

/// Linear frequency modulation (chirp) parameters; the external generator's
/// only visible contract is that it turns a validated `LfmParams` into a
/// `num_beams x count_points` complex device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LfmParams {
    pub f_start: f64,
    pub f_stop: f64,
    pub sample_rate: f64,
    pub num_beams: usize,
    pub count_points: Option<usize>,
    pub duration: Option<f64>,
    pub angle_start_deg: f64,
    pub angle_stop_deg: f64,
    pub angle_step_deg: f64,
}

impl LfmParams {
    /// Validate and resolve `count_points`, deriving it from `duration` if needed.
    pub fn resolved_count_points(&self) -> Result<usize> {
        if !(self.f_stop > self.f_start && self.f_start > 0.0) {
            return Err(RadarError::InvalidConfig(format!(
                "require f_stop > f_start > 0, got f_start={} f_stop={}",
                self.f_start, self.f_stop
            )));
        }
        if self.sample_rate < 2.0 * self.f_stop {
            return Err(RadarError::InvalidConfig(format!(
                "sample_rate {} violates Nyquist for f_stop {}",
                self.sample_rate, self.f_stop
            )));
        }
        if self.num_beams < 1 {
            return Err(RadarError::InvalidConfig("num_beams must be >= 1".into()));
        }

        match (self.count_points, self.duration) {
            (Some(n), _) if n > 0 => Ok(n),
            (_, Some(d)) if d > 0.0 => Ok((d * self.sample_rate).round() as usize),
            _ => Err(RadarError::InvalidConfig(
                "either count_points > 0 or duration > 0 is required".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_samples_round_trips_within_one_lagrange_row() {
        for d in [0.0, 0.5, 1.25, -3.7, 10.999, -0.01] {
            let p = DelayParams::from_samples(d);
            let err = (p.as_samples() - d).abs();
            assert!(err <= 1.0 / LAGRANGE_ROWS as f64 + 1e-9, "d={d} err={err}");
        }
    }

    #[test]
    fn lagrange_row_is_modulo_48() {
        let p = DelayParams::new(3, 300);
        assert_eq!(p.lagrange_row, 300 % LAGRANGE_ROWS as u32);
    }

    #[test]
    fn reflect_handles_negative_and_overflow_indices() {
        let len = 10;
        assert_eq!(reflect(-1, len), 0);
        assert_eq!(reflect(-2, len), 1);
        assert_eq!(reflect(len as i64, len), len - 1);
        assert_eq!(reflect(len as i64 + 1, len), len - 2);
        for i in 0..len as i64 {
            assert_eq!(reflect(i, len), i as usize);
        }
    }

    #[test]
    fn lfm_params_reject_non_nyquist_sample_rate() {
        let p = LfmParams {
            f_start: 1000.0,
            f_stop: 2000.0,
            sample_rate: 3000.0,
            num_beams: 1,
            count_points: Some(100),
            duration: None,
            angle_start_deg: 0.0,
            angle_stop_deg: 0.0,
            angle_step_deg: 1.0,
        };
        assert!(matches!(
            p.resolved_count_points(),
            Err(RadarError::InvalidConfig(_))
        ));
    }

    #[test]
    fn lfm_params_derive_count_points_from_duration() {
        let p = LfmParams {
            f_start: 1000.0,
            f_stop: 2000.0,
            sample_rate: 5000.0,
            num_beams: 1,
            count_points: None,
            duration: Some(0.1),
            angle_start_deg: 0.0,
            angle_stop_deg: 0.0,
            angle_step_deg: 1.0,
        };
        assert_eq!(p.resolved_count_points().unwrap(), 500);
    }
}
