//! SE(3) rigid transforms with exponential/logarithm maps.
//!
//! The twist convention is translation-first: ξ = [υ, ω] with the rotational
//! part coupled to the translation through the SO(3) left Jacobian, so that
//! `SE3::exp(log(T)) == T`.

use nalgebra::{Matrix3, UnitQuaternion, Vector3, Vector6};

use crate::geometry::so3::{left_jacobian_so3, left_jacobian_so3_inv};

/// A rigid transform in SE(3).
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Exponential map from a twist ξ = [υ, ω].
    ///
    /// R = exp([ω]×), t = Jl(ω) υ.
    pub fn exp(xi: &Vector6<f64>) -> Self {
        let upsilon = Vector3::new(xi[0], xi[1], xi[2]);
        let omega = Vector3::new(xi[3], xi[4], xi[5]);

        let rotation = UnitQuaternion::from_scaled_axis(omega);
        let translation = left_jacobian_so3(&omega) * upsilon;

        Self {
            rotation,
            translation,
        }
    }

    /// Logarithm map back to a twist ξ = [υ, ω].
    pub fn log(&self) -> Vector6<f64> {
        let omega = self.rotation.scaled_axis();
        let upsilon = left_jacobian_so3_inv(&omega) * self.translation;

        Vector6::new(
            upsilon.x, upsilon.y, upsilon.z, omega.x, omega.y, omega.z,
        )
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            translation: -(rotation * self.translation),
            rotation,
        }
    }

    /// Composition: `self * other` applies `other` first.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }
}
