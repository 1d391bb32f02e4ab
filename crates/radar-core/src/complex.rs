//! Complex sample type shared between the host and device.

use bytemuck::{Pod, Zeroable};

/// A single complex-valued sample: a pair of single-precision floats.
///
/// Layout is `#[repr(C)]` so that a `&[Complex]` can be handed directly to a
/// device buffer with the same bit pattern as the device's native `float2`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Complex {
    pub re: f32,
    pub im: f32,
}

impl Complex {
    pub const ZERO: Complex = Complex { re: 0.0, im: 0.0 };

    pub fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    pub fn magnitude(&self) -> f32 {
        (self.re * self.re + self.im * self.im).sqrt()
    }

    /// Phase in degrees, normalised to `[-180, 180)`.
    pub fn phase_degrees(&self) -> f32 {
        let deg = self.im.atan2(self.re) * 180.0 / std::f32::consts::PI;
        normalize_phase_degrees(deg)
    }

    pub fn conj(&self) -> Complex {
        Complex::new(self.re, -self.im)
    }
}

impl std::ops::Add for Complex {
    type Output = Complex;
    fn add(self, rhs: Complex) -> Complex {
        Complex::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl std::ops::Sub for Complex {
    type Output = Complex;
    fn sub(self, rhs: Complex) -> Complex {
        Complex::new(self.re - rhs.re, self.im - rhs.im)
    }
}

impl std::ops::Mul<f32> for Complex {
    type Output = Complex;
    fn mul(self, rhs: f32) -> Complex {
        Complex::new(self.re * rhs, self.im * rhs)
    }
}

impl std::ops::Mul for Complex {
    type Output = Complex;
    fn mul(self, rhs: Complex) -> Complex {
        Complex::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

/// Normalise an angle in degrees to the half-open interval `[-180, 180)`.
pub fn normalize_phase_degrees(mut deg: f32) -> f32 {
    deg %= 360.0;
    if deg >= 180.0 {
        deg -= 360.0;
    } else if deg < -180.0 {
        deg += 360.0;
    }
    deg
}

/// Logical shape of a beam matrix: `num_beams` rows of `num_samples` complex
/// values each, stored row-major as a single linear buffer
/// `B[beam * num_samples + sample]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamMatrixShape {
    pub num_beams: usize,
    pub num_samples: usize,
}

impl BeamMatrixShape {
    pub fn new(num_beams: usize, num_samples: usize) -> Self {
        Self {
            num_beams,
            num_samples,
        }
    }

    pub fn num_elements(&self) -> usize {
        self.num_beams * self.num_samples
    }

    pub fn index(&self, beam: usize, sample: usize) -> usize {
        beam * self.num_samples + sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_wraps_into_range() {
        assert!((normalize_phase_degrees(270.0) - (-90.0)).abs() < 1e-4);
        assert!((normalize_phase_degrees(-270.0) - 90.0).abs() < 1e-4);
        assert!((normalize_phase_degrees(180.0) - (-180.0)).abs() < 1e-4);
        assert!((normalize_phase_degrees(0.0) - 0.0).abs() < 1e-4);
    }

    #[test]
    fn magnitude_and_phase_of_unit_real() {
        let c = Complex::new(1.0, 0.0);
        assert!((c.magnitude() - 1.0).abs() < 1e-6);
        assert!(c.phase_degrees().abs() < 1e-4);
    }

    #[test]
    fn shape_indexes_row_major() {
        let shape = BeamMatrixShape::new(4, 16);
        assert_eq!(shape.num_elements(), 64);
        assert_eq!(shape.index(2, 5), 2 * 16 + 5);
    }
}
