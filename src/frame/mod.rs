//! Frame data consumed by the initializer.
//!
//! A [`Frame`] is a pyramid of dense gradient images: one `(intensity, gx, gy)`
//! triple per pixel and per level, each level half the linear resolution of
//! the previous, plus a scalar exposure value (≤ 0 meaning unknown).
//!
//! Pyramid construction below the base level is normally the concern of the
//! surrounding pipeline; [`Frame::from_intensity`] is provided so callers and
//! tests can build a conforming pyramid from a single intensity image.

pub mod camera;

pub use camera::{Camera, PyramidCalib};

use nalgebra::Vector3;

/// A dense image of `(intensity, x-gradient, y-gradient)` triples.
#[derive(Debug, Clone)]
pub struct GradientImage {
    pub width: usize,
    pub height: usize,
    /// Row-major texels, `data[x + y * width] = (intensity, gx, gy)`.
    pub data: Vec<Vector3<f32>>,
}

impl GradientImage {
    /// Builds a gradient image from raw intensities using central differences.
    ///
    /// Gradients on the first and last row are left at zero.
    pub fn from_intensity(width: usize, height: usize, intensity: &[f32]) -> Self {
        assert_eq!(intensity.len(), width * height);
        let mut data: Vec<Vector3<f32>> = intensity
            .iter()
            .map(|&i| Vector3::new(i, 0.0, 0.0))
            .collect();

        for idx in width..width * (height - 1) {
            data[idx][1] = 0.5 * (intensity[idx + 1] - intensity[idx - 1]);
            data[idx][2] = 0.5 * (intensity[idx + width] - intensity[idx - width]);
        }

        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    pub fn texel(&self, x: usize, y: usize) -> &Vector3<f32> {
        &self.data[x + y * self.width]
    }

    /// Bilinearly samples the full `(intensity, gx, gy)` triple at `(u, v)`.
    ///
    /// The caller must keep `(u, v)` at least one pixel inside the image.
    #[inline]
    pub fn interpolate(&self, u: f32, v: f32) -> Vector3<f32> {
        let ix = u as usize;
        let iy = v as usize;
        let dx = u - ix as f32;
        let dy = v - iy as f32;
        let dxdy = dx * dy;

        let base = ix + iy * self.width;
        dxdy * self.data[base + 1 + self.width]
            + (dy - dxdy) * self.data[base + self.width]
            + (dx - dxdy) * self.data[base + 1]
            + (1.0 - dx - dy + dxdy) * self.data[base]
    }

    /// Bilinearly samples the intensity channel only.
    #[inline]
    pub fn interpolate_intensity(&self, u: f32, v: f32) -> f32 {
        let ix = u as usize;
        let iy = v as usize;
        let dx = u - ix as f32;
        let dy = v - iy as f32;
        let dxdy = dx * dy;

        let base = ix + iy * self.width;
        dxdy * self.data[base + 1 + self.width][0]
            + (dy - dxdy) * self.data[base + self.width][0]
            + (dx - dxdy) * self.data[base + 1][0]
            + (1.0 - dx - dy + dxdy) * self.data[base][0]
    }

    /// Downsamples the intensity channel by 2×2 block averaging.
    fn halved_intensity(&self) -> (usize, usize, Vec<f32>) {
        let wl = self.width / 2;
        let hl = self.height / 2;
        let mut out = vec![0.0f32; wl * hl];
        for y in 0..hl {
            for x in 0..wl {
                out[x + y * wl] = 0.25
                    * (self.data[2 * x + 2 * y * self.width][0]
                        + self.data[2 * x + 1 + 2 * y * self.width][0]
                        + self.data[2 * x + (2 * y + 1) * self.width][0]
                        + self.data[2 * x + 1 + (2 * y + 1) * self.width][0]);
            }
        }
        (wl, hl, out)
    }
}

/// A pyramid of gradient images plus the frame's exposure.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Per-level gradient images, finest first.
    pub levels: Vec<GradientImage>,
    /// Exposure in arbitrary units; ≤ 0 means unknown.
    pub exposure: f32,
}

impl Frame {
    pub fn new(levels: Vec<GradientImage>, exposure: f32) -> Self {
        Self { levels, exposure }
    }

    /// Builds the full pyramid from a base intensity image.
    pub fn from_intensity(
        width: usize,
        height: usize,
        intensity: &[f32],
        num_levels: usize,
        exposure: f32,
    ) -> Self {
        let mut levels = Vec::with_capacity(num_levels);
        levels.push(GradientImage::from_intensity(width, height, intensity));

        for _ in 1..num_levels {
            let (wl, hl, halved) = levels.last().unwrap().halved_intensity();
            levels.push(GradientImage::from_intensity(wl, hl, &halved));
        }

        Self { levels, exposure }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}
