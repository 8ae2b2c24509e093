//! Pinhole camera intrinsics and their per-level pyramid derivation.

use nalgebra::Matrix3;

/// Base-resolution pinhole intrinsics.
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Camera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }
}

/// Intrinsics of one pyramid level.
#[derive(Debug, Clone, Copy)]
pub struct LevelCalib {
    pub width: usize,
    pub height: usize,
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    /// Inverse intrinsics K⁻¹ of this level.
    pub ki: Matrix3<f32>,
}

/// Per-level intrinsics derived from the base camera.
///
/// Focal lengths halve per level; the principal point is remapped as
/// `c[l] = (c[0] + 0.5) / 2^l − 0.5` to keep the sampling grids of adjacent
/// levels aligned.
#[derive(Debug, Clone)]
pub struct PyramidCalib {
    pub levels: Vec<LevelCalib>,
}

impl PyramidCalib {
    pub fn new(camera: &Camera, width: usize, height: usize, num_levels: usize) -> Self {
        let mut levels = Vec::with_capacity(num_levels);

        let mut fx = camera.fx;
        let mut fy = camera.fy;
        for lvl in 0..num_levels {
            let w = width >> lvl;
            let h = height >> lvl;
            let (cx, cy) = if lvl == 0 {
                (camera.cx, camera.cy)
            } else {
                let scale = f64::from(1u32 << lvl);
                (
                    (camera.cx + 0.5) / scale - 0.5,
                    (camera.cy + 0.5) / scale - 0.5,
                )
            };

            let k = Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0);
            // A pinhole K is always invertible for positive focal lengths.
            let ki = k.try_inverse().unwrap_or_else(Matrix3::identity);

            levels.push(LevelCalib {
                width: w,
                height: h,
                fx: fx as f32,
                fy: fy as f32,
                cx: cx as f32,
                cy: cy as f32,
                ki: ki.cast::<f32>(),
            });

            fx *= 0.5;
            fy *= 0.5;
        }

        Self { levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}
