//! Affine brightness model compensating exposure differences between frames.

/// Two-parameter photometric transform between a reference and a target frame.
///
/// A target intensity relates to a reference intensity as
/// `I_target ≈ exp(a) · I_ref + b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineBrightness {
    /// Log-gain.
    pub a: f64,
    /// Bias.
    pub b: f64,
}

impl AffineBrightness {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }

    /// Seed the gain from known exposures: `a = ln(exp_target / exp_ref)`.
    ///
    /// Returns the identity model when either exposure is unknown (≤ 0).
    pub fn from_exposures(exposure_ref: f32, exposure_target: f32) -> Self {
        if exposure_ref > 0.0 && exposure_target > 0.0 {
            Self {
                a: f64::from(exposure_target / exposure_ref).ln(),
                b: 0.0,
            }
        } else {
            Self::default()
        }
    }

    /// Gain and bias as applied to a reference intensity, `(exp(a), b)`.
    pub fn gain_bias(&self) -> (f32, f32) {
        (self.a.exp() as f32, self.b as f32)
    }
}

impl Default for AffineBrightness {
    fn default() -> Self {
        Self { a: 0.0, b: 0.0 }
    }
}
