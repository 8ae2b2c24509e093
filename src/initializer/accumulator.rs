//! Rank-1 accumulators for the reduced normal equations.
//!
//! Reduction order is fixed and documented for reproducibility: points are
//! accumulated in arena order, and within one point the residual-pattern
//! samples in pattern order. Floating-point rounding, not correctness,
//! depends on this order.

use nalgebra::{SMatrix, SVector};

pub type Matrix8 = SMatrix<f32, 8, 8>;
pub type Vector8 = SVector<f32, 8>;

/// Accumulates Σ w · j jᵀ for 9-vectors j = [∂r/∂ξ (8), r].
///
/// The top-left 8×8 block is the information matrix of the pose+affine
/// parameters, the top-right column the gradient.
#[derive(Debug, Clone)]
pub struct Accumulator9 {
    h: SMatrix<f32, 9, 9>,
    pub num: usize,
}

impl Accumulator9 {
    pub fn new() -> Self {
        Self {
            h: SMatrix::zeros(),
            num: 0,
        }
    }

    #[inline]
    pub fn update(&mut self, j: &[f32; 9]) {
        for row in 0..9 {
            for col in row..9 {
                self.h[(row, col)] += j[row] * j[col];
            }
        }
        self.num += 1;
    }

    #[inline]
    pub fn update_weighted(&mut self, j: &[f32; 9], weight: f32) {
        for row in 0..9 {
            let wj = weight * j[row];
            for col in row..9 {
                self.h[(row, col)] += wj * j[col];
            }
        }
        self.num += 1;
    }

    /// Mirrors the accumulated upper triangle into the lower one.
    pub fn finish(&mut self) {
        for row in 0..9 {
            for col in 0..row {
                self.h[(row, col)] = self.h[(col, row)];
            }
        }
    }

    pub fn hessian(&self) -> Matrix8 {
        self.h.fixed_view::<8, 8>(0, 0).into_owned()
    }

    pub fn rhs(&self) -> Vector8 {
        self.h.fixed_view::<8, 1>(0, 8).into_owned()
    }
}

impl Default for Accumulator9 {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain scalar energy accumulator with a term count.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyAccumulator {
    pub sum: f32,
    pub num: usize,
}

impl EnergyAccumulator {
    pub fn new() -> Self {
        Self { sum: 0.0, num: 0 }
    }

    #[inline]
    pub fn add(&mut self, value: f32) {
        self.sum += value;
        self.num += 1;
    }
}
