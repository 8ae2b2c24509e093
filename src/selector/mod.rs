//! Adaptive sparse pixel selection from gradient images.
//!
//! The selector partitions the image into square cells of side `potential`
//! and keeps, per cell, the pixels maximizing |gx|, |gy|, |gx−gy| and
//! |gx+gy| among those passing a minimum squared-gradient threshold. This
//! biases selection toward high-gradient, multi-directional texture. A
//! feedback recursion rescales the cell size (and, once the cells have
//! collapsed to single pixels, relaxes the threshold instead) until the
//! achieved count lands near the requested density.

use tracing::debug;

use crate::frame::GradientImage;

/// Minimum usable gradient magnitude for selection.
const MIN_USE_GRAD: f32 = 10.0;

/// Down-weighting applied to the base gradient threshold.
const GRAD_TH_FACTOR: f32 = 0.75;

/// Result of one selection pass.
#[derive(Debug, Clone)]
pub struct Selection {
    /// One flag per pixel; `true` marks a selected pixel.
    pub mask: Vec<bool>,
    /// Number of `true` entries in `mask`.
    pub count: usize,
}

/// Adaptive grid-based pixel selector.
///
/// The grid potential (cell side length) persists across calls so that the
/// density reached on one image seeds the search on the next. It is an
/// explicit field here: selection is reproducible given identical inputs and
/// an identical starting potential.
#[derive(Debug, Clone)]
pub struct PixelSelector {
    /// Current grid cell side length, always ≥ 1.
    pub potential: usize,
}

impl PixelSelector {
    pub fn new(potential: usize) -> Self {
        Self {
            potential: potential.max(1),
        }
    }

    /// One non-recursive grid pass at the current potential.
    ///
    /// Used at very coarse pyramid levels where density targets are tiny and
    /// threshold relaxation is unnecessary.
    pub fn select_single_pass(&self, img: &GradientImage, th_factor: f32) -> Selection {
        grid_select(img, self.potential, th_factor)
    }

    /// Recursive density search: selects approximately `desired` pixels.
    ///
    /// At most `recursions` refinements are performed. Each step either
    /// rescales the potential by `sqrt(achieved / desired)` or, once the
    /// potential has collapsed to 1 and still yields too few points, halves
    /// the gradient threshold; the two adjustments are mutually exclusive
    /// within one step.
    pub fn select_adaptive(
        &mut self,
        img: &GradientImage,
        desired: f32,
        recursions: usize,
        th_factor: f32,
    ) -> Selection {
        if self.potential < 1 {
            self.potential = 1;
        }

        let selection = grid_select(img, self.potential, th_factor);
        let quotia = selection.count as f32 / desired;

        // Point count is roughly proportional to potential².
        let mut new_potential = (self.potential as f32 * quotia.sqrt() + 0.7) as usize;
        if new_potential < 1 {
            new_potential = 1;
        }

        let old_th_factor = th_factor;
        let mut th_factor = th_factor;
        if new_potential == 1 && self.potential == 1 {
            // Cells cannot shrink further; relax the threshold instead.
            th_factor = 0.5;
        }

        let settled = new_potential == self.potential && th_factor == old_th_factor;
        let close_enough = quotia > 0.8 && 1.0 / quotia > 0.8;

        if settled || close_enough || recursions == 0 {
            debug!(
                count = selection.count,
                desired,
                potential = new_potential,
                "pixel selection settled"
            );
            self.potential = new_potential;
            selection
        } else {
            self.potential = new_potential;
            self.select_adaptive(img, desired, recursions - 1, th_factor)
        }
    }
}

impl Default for PixelSelector {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Selects up to four gradient-extremal pixels per grid cell.
fn grid_select(img: &GradientImage, potential: usize, th_factor: f32) -> Selection {
    let w = img.width;
    let h = img.height;
    let pot = potential.max(1);

    let mut mask = vec![false; w * h];
    let mut count = 0usize;

    if h <= pot + 1 || w <= pot + 1 {
        return Selection { mask, count };
    }

    let th = th_factor * MIN_USE_GRAD * GRAD_TH_FACTOR;
    let th_sq = th * th;

    let mut y = 1;
    while y < h - pot {
        let mut x = 1;
        while x < w - pot {
            let mut best_xx: (f32, Option<usize>) = (0.0, None);
            let mut best_yy: (f32, Option<usize>) = (0.0, None);
            let mut best_xmy: (f32, Option<usize>) = (0.0, None);
            let mut best_xpy: (f32, Option<usize>) = (0.0, None);

            for dy in 0..pot {
                for dx in 0..pot {
                    let idx = (x + dx) + (y + dy) * w;
                    let g = &img.data[idx];
                    let sq_grad = g[1] * g[1] + g[2] * g[2];
                    if sq_grad <= th_sq {
                        continue;
                    }

                    let agx = g[1].abs();
                    if agx > best_xx.0 {
                        best_xx = (agx, Some(idx));
                    }
                    let agy = g[2].abs();
                    if agy > best_yy.0 {
                        best_yy = (agy, Some(idx));
                    }
                    let gxmy = (g[1] - g[2]).abs();
                    if gxmy > best_xmy.0 {
                        best_xmy = (gxmy, Some(idx));
                    }
                    let gxpy = (g[1] + g[2]).abs();
                    if gxpy > best_xpy.0 {
                        best_xpy = (gxpy, Some(idx));
                    }
                }
            }

            // A pixel may win several bins; it is counted once.
            for best in [best_xx.1, best_yy.1, best_xmy.1, best_xpy.1] {
                if let Some(idx) = best {
                    if !mask[idx] {
                        count += 1;
                    }
                    mask[idx] = true;
                }
            }

            x += pot;
        }
        y += pot;
    }

    Selection { mask, count }
}
