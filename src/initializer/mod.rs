//! Joint photometric optimizer for monocular initialization.
//!
//! Given a reference frame with adaptively selected sparse points, each
//! incoming frame is aligned by a coarse-to-fine damped Gauss-Newton solve
//! over the relative pose, the affine brightness model, and one inverse
//! depth per point. The per-point depth unknowns are eliminated from the
//! joint normal equations with a Schur complement, so only an 8×8 system
//! (6-DoF pose + gain + bias) is ever factorized; the depth increments are
//! recovered by back-substitution afterwards.
//!
//! Until the accumulated translation is judged sufficient ("snapped"), a
//! depth-to-1 prior keeps the scale from collapsing; once snapped, the
//! prior is swapped for a coupling to the neighbour-consensus target `iR`.
//! The attempt reaches `Converged` once more than five further frames have
//! been processed after snapping.

pub mod accumulator;
pub mod point;

use anyhow::{bail, ensure, Result};
use nalgebra::{Cholesky, Matrix3, SVector, Vector2, Vector3, Vector6};
use tracing::{debug, info};

use crate::frame::camera::LevelCalib;
use crate::frame::{Camera, Frame, GradientImage, PyramidCalib};
use crate::geometry::{AffineBrightness, SE3};
use crate::neighbors::build_neighbor_graph;
use crate::selector::PixelSelector;

use self::accumulator::{Accumulator9, EnergyAccumulator, Matrix8, Vector8};
use self::point::Point;

/// Residual sampling pattern: pixel offsets around each point.
const PATTERN: [(i32, i32); 8] = [
    (0, -2),
    (-1, -1),
    (1, -1),
    (-2, 0),
    (0, 0),
    (2, 0),
    (-1, 1),
    (0, 2),
];

/// Border kept free of points so the whole pattern stays in the image.
const PATTERN_PADDING: usize = 2;

/// Outlier energy budget per pattern sample.
const OUTLIER_ENERGY_PER_SAMPLE: f32 = 12.0 * 12.0;

/// Inverse depth is clamped into this range after every update.
const IDEPTH_MIN: f32 = 1e-3;
const IDEPTH_MAX: f32 = 50.0;

/// Fraction of a point's projective depth sensitivity usable per step.
const MAX_PIXEL_STEP: f32 = 0.25;

/// Absolute cap on one inverse-depth step.
const IDEPTH_MAX_STEP: f32 = 1e10;

type JbBuffer = SVector<f32, 10>;

/// Tuning parameters of the initializer.
#[derive(Debug, Clone)]
pub struct InitializerConfig {
    /// Number of pyramid levels.
    pub num_levels: usize,
    /// Per-level iteration budgets, indexed by level (0 = finest).
    pub max_iterations: Vec<usize>,
    /// Per-level point densities as fractions of the base pixel count.
    pub densities: Vec<f32>,
    /// Initial Levenberg-Marquardt damping.
    pub lambda_init: f32,
    /// Step-norm threshold below which a level's loop stops.
    pub step_eps: f32,
    /// Translation-sufficiency cap, per point.
    pub alpha_k: f32,
    /// Translation-sufficiency weight.
    pub alpha_w: f32,
    /// Mixing weight of the neighbour median in the `iR` update.
    pub reg_weight: f32,
    /// Weight of the depth-to-`iR` coupling after snapping.
    pub coupling_weight: f32,
    /// Huber threshold on photometric residuals.
    pub huber_th: f32,
    /// Hold the affine brightness parameters fixed (solve 6-DoF only).
    pub fix_affine: bool,
    /// Recursion budget of the adaptive pixel selector.
    pub selector_recursions: usize,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            num_levels: 5,
            max_iterations: vec![5, 5, 10, 30, 50],
            densities: vec![0.03, 0.05, 0.15, 0.5, 1.0],
            lambda_init: 0.1,
            step_eps: 1e-4,
            alpha_k: 2.5 * 2.5,
            alpha_w: 150.0 * 150.0,
            reg_weight: 0.8,
            coupling_weight: 1.0,
            huber_th: 9.0,
            fix_affine: true,
            selector_recursions: 5,
        }
    }
}

/// Attempt-level state of the initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializerState {
    /// Accumulated translation not yet judged sufficient.
    Unsnapped,
    /// Translation sufficient; depth estimates are being refined.
    Snapped,
    /// Snapped and more than five further frames processed.
    Converged,
}

/// A finest-level point with its recovered inverse depth.
#[derive(Debug, Clone, Copy)]
pub struct InverseDepthPoint {
    pub u: f32,
    pub v: f32,
    pub idepth: f32,
}

/// Reduced normal equations of one residual evaluation.
struct LevelSystem {
    /// (data energy, translation-sufficiency energy, term count).
    res: Vector3<f32>,
    h: Matrix8,
    b: Vector8,
    h_sc: Matrix8,
    b_sc: Vector8,
}

/// Monocular initialization front-end.
///
/// Owns the per-level point population for the active reference frame; the
/// whole population is discarded and rebuilt by [`set_first`](Self::set_first).
pub struct MonoInitializer {
    config: InitializerConfig,
    calib: PyramidCalib,
    selector: PixelSelector,

    first_frame: Option<Frame>,
    points: Vec<Vec<Point>>,

    /// Committed per-point solve buffers (8 cross terms, residual term,
    /// inverted depth-depth term), shared across levels by point index.
    jb: Vec<JbBuffer>,
    /// Candidate solve buffers, swapped in on step acceptance.
    jb_new: Vec<JbBuffer>,

    /// Accepted relative transform, reference to latest frame.
    this_to_next: SE3,
    /// Accepted affine brightness parameters.
    this_to_next_aff: AffineBrightness,

    /// Fixed diagonal preconditioner for [rot, trans, gain, bias].
    w_m: Vector8,

    snapped: bool,
    snapped_at: Option<usize>,
    frame_id: usize,
}

impl MonoInitializer {
    pub fn new(camera: &Camera, width: usize, height: usize, config: InitializerConfig) -> Self {
        let calib = PyramidCalib::new(camera, width, height, config.num_levels);

        let mut w_m = Vector8::zeros();
        w_m[0] = 1.0;
        w_m[1] = 1.0;
        w_m[2] = 1.0;
        w_m[3] = 0.5;
        w_m[4] = 0.5;
        w_m[5] = 0.5;
        w_m[6] = 10.0;
        w_m[7] = 1000.0;

        Self {
            config,
            calib,
            selector: PixelSelector::default(),
            first_frame: None,
            points: Vec::new(),
            jb: Vec::new(),
            jb_new: Vec::new(),
            this_to_next: SE3::identity(),
            this_to_next_aff: AffineBrightness::default(),
            w_m,
            snapped: false,
            snapped_at: None,
            frame_id: 0,
        }
    }

    /// Sets the reference frame and rebuilds the point population.
    pub fn set_first(&mut self, frame: Frame) -> Result<()> {
        ensure!(
            frame.num_levels() == self.config.num_levels,
            "expected {} pyramid levels, got {}",
            self.config.num_levels,
            frame.num_levels()
        );
        ensure!(
            self.config.max_iterations.len() == self.config.num_levels
                && self.config.densities.len() == self.config.num_levels,
            "per-level configuration does not match the level count"
        );
        for (lvl, img) in frame.levels.iter().enumerate() {
            let calib = &self.calib.levels[lvl];
            ensure!(
                img.width == calib.width && img.height == calib.height,
                "level {} image is {}x{}, calibration expects {}x{}",
                lvl,
                img.width,
                img.height,
                calib.width,
                calib.height
            );
        }

        let num_levels = self.config.num_levels;
        let base_area = (self.calib.levels[0].width * self.calib.levels[0].height) as f32;
        let outlier_th = PATTERN.len() as f32 * OUTLIER_ENERGY_PER_SAMPLE;

        self.selector = PixelSelector::default();

        let mut points: Vec<Vec<Point>> = Vec::with_capacity(num_levels);
        let mut max_points = 0usize;

        for lvl in 0..num_levels {
            let img = &frame.levels[lvl];
            let desired = self.config.densities[lvl] * base_area;

            // The coarsest level's target density is tiny; a single grid
            // pass suffices there and skips the threshold relaxation.
            let selection = if lvl == num_levels - 1 {
                self.selector.select_single_pass(img, 1.0)
            } else {
                self.selector
                    .select_adaptive(img, desired, self.config.selector_recursions, 1.0)
            };

            let mut arena = Vec::with_capacity(selection.count);
            let wl = img.width;
            let hl = img.height;
            if hl > 2 * PATTERN_PADDING + 3 && wl > 2 * PATTERN_PADDING + 3 {
                for y in PATTERN_PADDING + 1..hl - PATTERN_PADDING - 2 {
                    for x in PATTERN_PADDING + 1..wl - PATTERN_PADDING - 2 {
                        if selection.mask[x + y * wl] {
                            arena.push(Point::new(x as f32 + 0.1, y as f32 + 0.1, outlier_th));
                        }
                    }
                }
            }

            debug!(
                level = lvl,
                desired = desired as usize,
                selected = selection.count,
                kept = arena.len(),
                "reference points selected"
            );
            max_points = max_points.max(arena.len());
            points.push(arena);
        }

        build_neighbor_graph(&mut points);

        self.points = points;
        self.jb = vec![JbBuffer::zeros(); max_points];
        self.jb_new = vec![JbBuffer::zeros(); max_points];
        self.first_frame = Some(frame);
        self.this_to_next = SE3::identity();
        self.this_to_next_aff = AffineBrightness::default();
        self.snapped = false;
        self.snapped_at = None;
        self.frame_id = 0;

        Ok(())
    }

    /// Tracks one incoming frame against the reference frame.
    ///
    /// Returns `true` once the attempt has converged: translation judged
    /// sufficient and more than five further frames processed since.
    pub fn track_frame(&mut self, frame: &Frame) -> Result<bool> {
        ensure!(
            frame.num_levels() == self.config.num_levels,
            "expected {} pyramid levels, got {}",
            self.config.num_levels,
            frame.num_levels()
        );
        for (lvl, img) in frame.levels.iter().enumerate() {
            let calib = &self.calib.levels[lvl];
            ensure!(
                img.width == calib.width && img.height == calib.height,
                "level {} image is {}x{}, calibration expects {}x{}",
                lvl,
                img.width,
                img.height,
                calib.width,
                calib.height
            );
        }
        let first = match self.first_frame.take() {
            Some(f) => f,
            None => bail!("set_first must be called before track_frame"),
        };

        let num_levels = self.config.num_levels;

        // Without sufficient translation the problem has no depth
        // information yet: restart from the uninformative prior.
        if !self.snapped {
            self.this_to_next.translation = Vector3::zeros();
            for level in &mut self.points {
                for p in level.iter_mut() {
                    p.ir = 1.0;
                    p.idepth_new = 1.0;
                    p.last_hessian = 0.0;
                }
            }
        }

        let mut pose_current = self.this_to_next.clone();
        let mut aff_current = self.this_to_next_aff;
        if first.exposure > 0.0 && frame.exposure > 0.0 {
            aff_current = AffineBrightness::from_exposures(first.exposure, frame.exposure);
        }

        for lvl in (0..num_levels).rev() {
            if lvl < num_levels - 1 {
                self.propagate_down(lvl + 1);
            }

            let is_coarsest = lvl == num_levels - 1;
            reset_points(&mut self.points[lvl], is_coarsest);

            let mut sys = calc_res_and_gs(
                &mut self.points[lvl],
                &mut self.jb_new,
                &self.calib.levels[lvl],
                &first.levels[lvl],
                &frame.levels[lvl],
                &pose_current,
                aff_current,
                &self.config,
            );
            apply_step(&mut self.points[lvl], &mut self.jb, &mut self.jb_new);

            let npts = self.points[lvl].len() as f32;
            let area_scale = 0.01
                / (self.calib.levels[lvl].width * self.calib.levels[lvl].height) as f32;

            let mut lambda = self.config.lambda_init;
            let mut fails = 0usize;
            let mut iteration = 0usize;

            loop {
                // Damp the reduced system: the depth-depth diagonal absorbs
                // the same 1/(1+λ) that scales the Schur pair.
                let mut hl = sys.h;
                for i in 0..8 {
                    hl[(i, i)] *= 1.0 + lambda;
                }
                hl -= sys.h_sc * (1.0 / (1.0 + lambda));
                let bl = sys.b - sys.b_sc * (1.0 / (1.0 + lambda));

                let mut hl_scaled = hl;
                for r in 0..8 {
                    for c in 0..8 {
                        hl_scaled[(r, c)] *= self.w_m[r] * self.w_m[c] * area_scale;
                    }
                }
                let mut bl_scaled = bl;
                for r in 0..8 {
                    bl_scaled[r] *= self.w_m[r] * area_scale;
                }

                let inc = if self.config.fix_affine {
                    let h66 = hl_scaled.fixed_view::<6, 6>(0, 0).into_owned();
                    let b6 = bl_scaled.fixed_rows::<6>(0).into_owned();
                    Cholesky::new(h66).map(|ch| {
                        let x = ch.solve(&b6);
                        let mut inc = Vector8::zeros();
                        for i in 0..6 {
                            inc[i] = -(self.w_m[i] * x[i]);
                        }
                        inc
                    })
                } else {
                    Cholesky::new(hl_scaled).map(|ch| {
                        let x = ch.solve(&bl_scaled);
                        let mut inc = Vector8::zeros();
                        for i in 0..8 {
                            inc[i] = -(self.w_m[i] * x[i]);
                        }
                        inc
                    })
                };

                let Some(inc) = inc else {
                    // Not positive definite even under damping; back off.
                    fails += 1;
                    lambda = (lambda * 4.0).min(1e4);
                    if fails >= 2 || iteration >= self.config.max_iterations[lvl] {
                        break;
                    }
                    iteration += 1;
                    continue;
                };

                let mut xi = Vector6::<f64>::zeros();
                for i in 0..6 {
                    xi[i] = f64::from(inc[i]);
                }
                let pose_new = SE3::exp(&xi).compose(&pose_current);
                let aff_new = AffineBrightness::new(
                    aff_current.a + f64::from(inc[6]),
                    aff_current.b + f64::from(inc[7]),
                );
                do_step(&mut self.points[lvl], &self.jb, lambda, &inc);

                let sys_new = calc_res_and_gs(
                    &mut self.points[lvl],
                    &mut self.jb_new,
                    &self.calib.levels[lvl],
                    &first.levels[lvl],
                    &frame.levels[lvl],
                    &pose_new,
                    aff_new,
                    &self.config,
                );
                let reg_energy = calc_ec(
                    &self.points[lvl],
                    self.snapped,
                    self.config.coupling_weight,
                );

                let e_total_new = sys_new.res[0] + sys_new.res[1] + reg_energy[1];
                let e_total_old = sys.res[0] + sys.res[1] + reg_energy[0];
                let accept = e_total_old > e_total_new;

                if accept {
                    if sys_new.res[1] == self.config.alpha_k * npts {
                        if !self.snapped {
                            info!(
                                level = lvl,
                                frame = self.frame_id + 1,
                                "translation sufficient, snapping"
                            );
                        }
                        self.snapped = true;
                    }
                    sys = sys_new;
                    pose_current = pose_new;
                    aff_current = aff_new;
                    apply_step(&mut self.points[lvl], &mut self.jb, &mut self.jb_new);
                    opt_reg(
                        &mut self.points[lvl],
                        self.snapped,
                        self.config.reg_weight,
                    );
                    lambda = (lambda * 0.5).max(1e-4);
                    fails = 0;
                } else {
                    fails += 1;
                    lambda = (lambda * 4.0).min(1e4);
                }

                if !(inc.norm() > self.config.step_eps)
                    || iteration >= self.config.max_iterations[lvl]
                    || fails >= 2
                {
                    break;
                }
                iteration += 1;
            }

            debug!(
                level = lvl,
                energy = sys.res[0],
                alpha_energy = sys.res[1],
                iterations = iteration,
                "level finished"
            );
        }

        self.this_to_next = pose_current;
        self.this_to_next_aff = aff_current;

        for lvl in 0..num_levels - 1 {
            self.propagate_up(lvl);
        }

        self.frame_id += 1;
        if !self.snapped {
            self.snapped_at = None;
        }
        if self.snapped && self.snapped_at.is_none() {
            self.snapped_at = Some(self.frame_id);
        }

        self.first_frame = Some(first);

        let converged = self.converged();
        if converged {
            info!(
                frame = self.frame_id,
                translation = self.this_to_next.translation.norm(),
                "initialization converged"
            );
        }
        Ok(converged)
    }

    /// Accepted relative transform from the reference to the latest frame.
    pub fn pose(&self) -> &SE3 {
        &self.this_to_next
    }

    /// Accepted affine brightness parameters.
    pub fn affine(&self) -> AffineBrightness {
        self.this_to_next_aff
    }

    pub fn state(&self) -> InitializerState {
        if self.converged() {
            InitializerState::Converged
        } else if self.snapped {
            InitializerState::Snapped
        } else {
            InitializerState::Unsnapped
        }
    }

    /// Number of frames tracked against the current reference.
    pub fn frame_count(&self) -> usize {
        self.frame_id
    }

    /// Point arena of one pyramid level.
    pub fn points(&self, level: usize) -> &[Point] {
        &self.points[level]
    }

    /// Valid finest-level points with their inverse-depth estimates.
    pub fn finest_points(&self) -> impl Iterator<Item = InverseDepthPoint> + '_ {
        self.points[0].iter().filter(|p| p.is_good).map(|p| {
            InverseDepthPoint {
                u: p.u,
                v: p.v,
                idepth: p.idepth,
            }
        })
    }

    fn converged(&self) -> bool {
        self.snapped && self.snapped_at.map_or(false, |at| self.frame_id > at + 5)
    }

    /// Seeds a finer level from the solved depths of the coarser `src_lvl`.
    fn propagate_down(&mut self, src_lvl: usize) {
        debug_assert!(src_lvl > 0);
        let (lower, upper) = self.points.split_at_mut(src_lvl);
        let target = &mut lower[src_lvl - 1];
        let source = &upper[0];

        for p in target.iter_mut() {
            let Some((parent_idx, _)) = p.parent else {
                continue;
            };
            let parent = &source[parent_idx as usize];
            if !parent.is_good || parent.last_hessian < 0.1 {
                continue;
            }

            if !p.is_good {
                // Invalid child: adopt the parent's target outright.
                p.ir = parent.ir;
                p.idepth = parent.ir;
                p.idepth_new = parent.ir;
                p.is_good = true;
                p.last_hessian = 0.0;
            } else {
                // Information-weighted blend, child counted twice.
                let new_ir = (p.ir * p.last_hessian * 2.0 + parent.ir * parent.last_hessian)
                    / (p.last_hessian * 2.0 + parent.last_hessian);
                p.ir = new_ir;
                p.idepth = new_ir;
                p.idepth_new = new_ir;
            }
        }

        opt_reg(target, self.snapped, self.config.reg_weight);
    }

    /// Feeds the solved depths of `src_lvl` up into the next coarser level.
    fn propagate_up(&mut self, src_lvl: usize) {
        debug_assert!(src_lvl + 1 < self.points.len());
        let (lower, upper) = self.points.split_at_mut(src_lvl + 1);
        let source = &lower[src_lvl];
        let target = &mut upper[0];

        for p in target.iter_mut() {
            p.ir_sum = 0.0;
            p.ir_sum_num = 0.0;
        }

        for p in source.iter() {
            if !p.is_good {
                continue;
            }
            let Some((parent_idx, _)) = p.parent else {
                continue;
            };
            let parent = &mut target[parent_idx as usize];
            parent.ir_sum += p.ir * p.last_hessian;
            parent.ir_sum_num += p.last_hessian;
        }

        for p in target.iter_mut() {
            if p.ir_sum_num > 0.0 {
                let ir = p.ir_sum / p.ir_sum_num;
                p.idepth = ir;
                p.ir = ir;
                p.is_good = true;
            }
        }

        opt_reg(target, self.snapped, self.config.reg_weight);
    }
}

/// Resets candidate state at the start of a level's optimization.
///
/// At the coarsest level (processed first, with nothing to propagate from)
/// points still invalid are seeded from the depth-weighted average of their
/// valid neighbours.
fn reset_points(points: &mut [Point], is_coarsest: bool) {
    for i in 0..points.len() {
        points[i].energy = Vector2::zeros();
        points[i].idepth_new = points[i].idepth;

        if is_coarsest && !points[i].is_good {
            let neighbours = points[i].neighbours;
            let num = points[i].num_neighbours;

            let mut sum = 0.0f32;
            let mut count = 0.0f32;
            for &(idx, _) in &neighbours[..num] {
                let other = &points[idx as usize];
                if other.is_good {
                    sum += other.ir;
                    count += 1.0;
                }
            }
            if count > 0.0 {
                let seed = sum / count;
                points[i].is_good = true;
                points[i].ir = seed;
                points[i].idepth = seed;
                points[i].idepth_new = seed;
            }
        }
    }
}

/// Evaluates residuals, Jacobians and the reduced normal equations at the
/// candidate hypothesis.
///
/// Accumulation is strictly ordered (points in arena order, pattern samples
/// in pattern order) so float results are reproducible.
#[allow(clippy::too_many_arguments)]
fn calc_res_and_gs(
    points: &mut [Point],
    jb_new: &mut [JbBuffer],
    calib: &LevelCalib,
    ref_img: &GradientImage,
    new_img: &GradientImage,
    ref_to_new: &SE3,
    aff: AffineBrightness,
    cfg: &InitializerConfig,
) -> LevelSystem {
    let wf = calib.width as f32;
    let hf = calib.height as f32;
    let fxl = calib.fx;
    let fyl = calib.fy;
    let cxl = calib.cx;
    let cyl = calib.cy;

    let rki: Matrix3<f32> = ref_to_new.rotation_matrix().cast::<f32>() * calib.ki;
    let t: Vector3<f32> = ref_to_new.translation.cast::<f32>();
    let (gain, bias) = aff.gain_bias();

    let pattern_len = PATTERN.len();
    let mut energy_acc = EnergyAccumulator::new();
    let mut acc = Accumulator9::new();

    for i in 0..points.len() {
        let point = &mut points[i];
        point.max_step = 1e10;

        if !point.is_good {
            energy_acc.add(point.energy[0]);
            point.energy_new = point.energy;
            point.is_good_new = false;
            continue;
        }

        let mut dp = [[0.0f32; 8]; 8];
        let mut dd = [0.0f32; 8];
        let mut res = [0.0f32; 8];
        jb_new[i] = JbBuffer::zeros();

        let mut is_good = true;
        let mut energy = 0.0f32;

        for (idx, &(dx, dy)) in PATTERN.iter().enumerate() {
            let pu = point.u + dx as f32;
            let pv = point.v + dy as f32;

            let pt = rki * Vector3::new(pu, pv, 1.0) + t * point.idepth_new;
            let u = pt[0] / pt[2];
            let v = pt[1] / pt[2];
            let ku = fxl * u + cxl;
            let kv = fyl * v + cyl;
            let new_idepth = point.idepth_new / pt[2];

            if !(ku > 1.0 && kv > 1.0 && ku < wf - 2.0 && kv < hf - 2.0 && new_idepth > 0.0) {
                is_good = false;
                break;
            }

            let hit = new_img.interpolate(ku, kv);
            let ref_color = ref_img.interpolate_intensity(pu, pv);

            if !ref_color.is_finite() || !hit[0].is_finite() {
                is_good = false;
                break;
            }

            let residual = hit[0] - gain * ref_color - bias;
            let mut hw = if residual.abs() < cfg.huber_th {
                1.0
            } else {
                cfg.huber_th / residual.abs()
            };
            energy += hw * residual * residual * (2.0 - hw);

            // Projected-point sensitivity to the inverse depth.
            let dxdd = (t[0] - t[2] * u) / pt[2];
            let dydd = (t[1] - t[2] * v) / pt[2];

            if hw < 1.0 {
                hw = hw.sqrt();
            }
            let dx_interp = hw * hit[1] * fxl;
            let dy_interp = hw * hit[2] * fyl;

            // Translation, rotation (exponential-map generators), affine.
            dp[0][idx] = new_idepth * dx_interp;
            dp[1][idx] = new_idepth * dy_interp;
            dp[2][idx] = -new_idepth * (u * dx_interp + v * dy_interp);
            dp[3][idx] = -u * v * dx_interp - (1.0 + v * v) * dy_interp;
            dp[4][idx] = (1.0 + u * u) * dx_interp + u * v * dy_interp;
            dp[5][idx] = -v * dx_interp + u * dy_interp;
            dp[6][idx] = -hw * gain * ref_color;
            dp[7][idx] = -hw;
            dd[idx] = dx_interp * dxdd + dy_interp * dydd;
            res[idx] = hw * residual;

            let max_step = 1.0 / Vector2::new(dxdd * fxl, dydd * fyl).norm();
            if max_step < point.max_step {
                point.max_step = max_step;
            }

            for k in 0..8 {
                jb_new[i][k] += dp[k][idx] * dd[idx];
            }
            jb_new[i][8] += res[idx] * dd[idx];
            jb_new[i][9] += dd[idx] * dd[idx];
        }

        if !is_good || energy > point.outlier_th * 20.0 {
            // Invalid for this evaluation: carry the previous energy forward.
            energy_acc.add(point.energy[0]);
            point.is_good_new = false;
            point.energy_new = point.energy;
            continue;
        }

        energy_acc.add(energy);
        point.is_good_new = true;
        point.energy_new[0] = energy;

        for idx in 0..pattern_len {
            acc.update(&[
                dp[0][idx], dp[1][idx], dp[2][idx], dp[3][idx], dp[4][idx], dp[5][idx],
                dp[6][idx], dp[7][idx], res[idx],
            ]);
        }
    }
    acc.finish();

    // Depth-consensus penalty, accumulated into the energy total to keep the
    // scale from drifting before translation is observed.
    for point in points.iter_mut() {
        if !point.is_good_new {
            energy_acc.add(point.energy[1]);
        } else {
            point.energy_new[1] = (point.idepth_new - 1.0) * (point.idepth_new - 1.0);
            energy_acc.add(point.energy_new[1]);
        }
    }

    let npts = points.len() as f32;
    let translation_sq = ref_to_new.translation.norm_squared() as f32;
    let mut alpha_energy = cfg.alpha_w * translation_sq * npts;

    // Once the metric saturates its cap, the depth-to-1 prior is switched
    // off in favor of the coupling to the neighbour-consensus target.
    let alpha_opt = if alpha_energy > cfg.alpha_k * npts {
        alpha_energy = cfg.alpha_k * npts;
        0.0
    } else {
        cfg.alpha_w
    };

    let mut acc_sc = Accumulator9::new();
    for (i, point) in points.iter_mut().enumerate() {
        if !point.is_good_new {
            continue;
        }

        point.last_hessian_new = jb_new[i][9];

        jb_new[i][8] += alpha_opt * (point.idepth_new - 1.0);
        jb_new[i][9] += alpha_opt;

        if alpha_opt == 0.0 {
            jb_new[i][8] += cfg.coupling_weight * (point.idepth_new - point.ir);
            jb_new[i][9] += cfg.coupling_weight;
        }

        // Stored inverted: this is the marginal depth covariance used to
        // weight the Schur terms and, later, the depth back-substitution.
        jb_new[i][9] = 1.0 / (1.0 + jb_new[i][9]);

        acc_sc.update_weighted(
            &[
                jb_new[i][0], jb_new[i][1], jb_new[i][2], jb_new[i][3], jb_new[i][4],
                jb_new[i][5], jb_new[i][6], jb_new[i][7], jb_new[i][8],
            ],
            jb_new[i][9],
        );
    }
    acc_sc.finish();

    let mut h = acc.hessian();
    let mut b = acc.rhs();
    let h_sc = acc_sc.hessian();
    let b_sc = acc_sc.rhs();

    h[(0, 0)] += alpha_opt * npts;
    h[(1, 1)] += alpha_opt * npts;
    h[(2, 2)] += alpha_opt * npts;

    let tlog = ref_to_new.log();
    b[0] += tlog[0] as f32 * alpha_opt * npts;
    b[1] += tlog[1] as f32 * alpha_opt * npts;
    b[2] += tlog[2] as f32 * alpha_opt * npts;

    LevelSystem {
        res: Vector3::new(energy_acc.sum, alpha_energy, energy_acc.num as f32),
        h,
        b,
        h_sc,
        b_sc,
    }
}

/// Depth-consensus energy of the current and candidate depths.
fn calc_ec(points: &[Point], snapped: bool, coupling_weight: f32) -> Vector3<f32> {
    if !snapped {
        return Vector3::new(0.0, 0.0, points.len() as f32);
    }

    let mut e_old = 0.0f32;
    let mut e_new = 0.0f32;
    let mut num = 0usize;
    for p in points {
        if !p.is_good_new {
            continue;
        }
        let r_old = p.idepth - p.ir;
        let r_new = p.idepth_new - p.ir;
        e_old += r_old * r_old;
        e_new += r_new * r_new;
        num += 1;
    }

    Vector3::new(
        coupling_weight * e_old,
        coupling_weight * e_new,
        num as f32,
    )
}

/// Refreshes the regularization targets after an accepted step.
fn opt_reg(points: &mut [Point], snapped: bool, reg_weight: f32) {
    if !snapped {
        for p in points.iter_mut() {
            p.ir = 1.0;
        }
        return;
    }

    for i in 0..points.len() {
        if !points[i].is_good {
            continue;
        }

        let neighbours = points[i].neighbours;
        let num = points[i].num_neighbours;

        let mut id_nn = [0.0f32; point::MAX_NEIGHBOURS];
        let mut count = 0usize;
        for &(idx, _) in &neighbours[..num] {
            let other = &points[idx as usize];
            if other.is_good {
                id_nn[count] = other.ir;
                count += 1;
            }
        }

        if count > 2 {
            let mid = count / 2;
            id_nn[..count].select_nth_unstable_by(mid, f32::total_cmp);
            points[i].ir = (1.0 - reg_weight) * points[i].idepth + reg_weight * id_nn[mid];
        }
    }
}

/// Back-substitutes the pose/affine increment into each point's depth.
fn do_step(points: &mut [Point], jb: &[JbBuffer], lambda: f32, inc: &Vector8) {
    for (i, p) in points.iter_mut().enumerate() {
        if !p.is_good {
            continue;
        }

        let mut b = jb[i][8];
        for k in 0..8 {
            b += jb[i][k] * inc[k];
        }
        let mut step = -b * jb[i][9] / (1.0 + lambda);

        let max_step = (MAX_PIXEL_STEP * p.max_step).min(IDEPTH_MAX_STEP);
        step = step.clamp(-max_step, max_step);

        p.idepth_new = (p.idepth + step).clamp(IDEPTH_MIN, IDEPTH_MAX);
    }
}

/// Commits the candidate state and swaps the solve buffers.
fn apply_step(points: &mut [Point], jb: &mut Vec<JbBuffer>, jb_new: &mut Vec<JbBuffer>) {
    for p in points.iter_mut() {
        if !p.is_good {
            p.idepth = p.ir;
            p.idepth_new = p.ir;
            continue;
        }
        p.energy = p.energy_new;
        p.is_good = p.is_good_new;
        p.idepth = p.idepth_new;
        p.last_hessian = p.last_hessian_new;
    }
    std::mem::swap(jb, jb_new);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const TEST_W: usize = 160;
    const TEST_H: usize = 120;
    const TEST_LEVELS: usize = 4;
    const TEST_FX: f64 = 100.0;

    fn test_config() -> InitializerConfig {
        InitializerConfig {
            num_levels: TEST_LEVELS,
            max_iterations: vec![5, 5, 10, 30],
            densities: vec![0.03, 0.05, 0.15, 0.5],
            ..InitializerConfig::default()
        }
    }

    /// Multi-frequency texture with gradients strong enough for selection.
    fn texture(x: f32, y: f32) -> f32 {
        128.0
            + 70.0 * (0.15 * x + 0.5).sin()
            + 65.0 * (0.12 * y + 1.1).cos()
            + 50.0 * (0.08 * (x + y)).sin()
    }

    /// A view of a fronto-parallel plane at depth 1, translated so the image
    /// content shifts by `shift` pixels along +x at the base level.
    fn shifted_frame(shift: f32) -> Frame {
        let intensity: Vec<f32> = (0..TEST_W * TEST_H)
            .map(|idx| texture((idx % TEST_W) as f32 - shift, (idx / TEST_W) as f32))
            .collect();
        Frame::from_intensity(TEST_W, TEST_H, &intensity, TEST_LEVELS, 1.0)
    }

    /// Tracks a pure-translation sequence (1.8 px per frame, i.e. 0.018 m per
    /// frame at fx = 100 and depth 1) until convergence or `max_frames`.
    fn run_sequence(max_frames: usize) -> (MonoInitializer, Vec<(bool, InitializerState)>) {
        let camera = Camera::new(TEST_FX, TEST_FX, 79.5, 59.5);
        let mut init = MonoInitializer::new(&camera, TEST_W, TEST_H, test_config());
        init.set_first(shifted_frame(0.0)).unwrap();

        let mut states = Vec::new();
        for k in 1..=max_frames {
            let done = init.track_frame(&shifted_frame(1.8 * k as f32)).unwrap();
            states.push((done, init.state()));
            if done {
                break;
            }
        }
        (init, states)
    }

    #[test]
    fn test_track_frame_requires_reference() {
        let camera = Camera::new(TEST_FX, TEST_FX, 79.5, 59.5);
        let mut init = MonoInitializer::new(&camera, TEST_W, TEST_H, test_config());

        assert!(init.track_frame(&shifted_frame(0.0)).is_err());
    }

    #[test]
    fn test_set_first_rejects_wrong_level_count() {
        let camera = Camera::new(TEST_FX, TEST_FX, 79.5, 59.5);
        let mut init = MonoInitializer::new(&camera, TEST_W, TEST_H, test_config());

        let intensity: Vec<f32> = (0..TEST_W * TEST_H)
            .map(|idx| texture((idx % TEST_W) as f32, (idx / TEST_W) as f32))
            .collect();
        let frame = Frame::from_intensity(TEST_W, TEST_H, &intensity, TEST_LEVELS - 1, 1.0);

        assert!(init.set_first(frame).is_err());
    }

    #[test]
    fn test_track_frame_rejects_mismatched_dimensions() {
        let camera = Camera::new(TEST_FX, TEST_FX, 79.5, 59.5);
        let mut init = MonoInitializer::new(&camera, TEST_W, TEST_H, test_config());
        init.set_first(shifted_frame(0.0)).unwrap();

        // Right level count, wrong per-level resolution.
        let intensity: Vec<f32> = (0..80 * 60)
            .map(|idx| texture((idx % 80) as f32, (idx / 80) as f32))
            .collect();
        let small = Frame::from_intensity(80, 60, &intensity, TEST_LEVELS, 1.0);

        assert!(init.track_frame(&small).is_err());
    }

    #[test]
    fn test_accepted_steps_strictly_decrease_energy() {
        let camera = Camera::new(TEST_FX, TEST_FX, 79.5, 59.5);
        let mut init = MonoInitializer::new(&camera, TEST_W, TEST_H, test_config());
        init.set_first(shifted_frame(0.0)).unwrap();
        let first = init.first_frame.take().unwrap();
        let frame = shifted_frame(1.8);

        let lvl = TEST_LEVELS - 1;
        let cfg = init.config.clone();
        let calib = init.calib.levels[lvl];
        let area_scale = 0.01 / (calib.width * calib.height) as f32;

        let mut pose = SE3::identity();
        let aff = AffineBrightness::default();

        reset_points(&mut init.points[lvl], true);
        let mut sys = calc_res_and_gs(
            &mut init.points[lvl],
            &mut init.jb_new,
            &calib,
            &first.levels[lvl],
            &frame.levels[lvl],
            &pose,
            aff,
            &cfg,
        );
        apply_step(&mut init.points[lvl], &mut init.jb, &mut init.jb_new);

        let mut lambda = cfg.lambda_init;
        let mut accepted_energies = vec![sys.res[0] + sys.res[1]];

        for _ in 0..10 {
            let mut hl = sys.h;
            for i in 0..8 {
                hl[(i, i)] *= 1.0 + lambda;
            }
            hl -= sys.h_sc * (1.0 / (1.0 + lambda));
            let bl = sys.b - sys.b_sc * (1.0 / (1.0 + lambda));

            let mut h66 = hl.fixed_view::<6, 6>(0, 0).into_owned();
            let mut b6 = bl.fixed_rows::<6>(0).into_owned();
            for r in 0..6 {
                for c in 0..6 {
                    h66[(r, c)] *= init.w_m[r] * init.w_m[c] * area_scale;
                }
                b6[r] *= init.w_m[r] * area_scale;
            }
            let Some(ch) = Cholesky::new(h66) else {
                lambda = (lambda * 4.0).min(1e4);
                continue;
            };
            let x = ch.solve(&b6);
            let mut inc = Vector8::zeros();
            for i in 0..6 {
                inc[i] = -(init.w_m[i] * x[i]);
            }

            let mut xi = Vector6::<f64>::zeros();
            for i in 0..6 {
                xi[i] = f64::from(inc[i]);
            }
            let pose_new = SE3::exp(&xi).compose(&pose);
            do_step(&mut init.points[lvl], &init.jb, lambda, &inc);

            let sys_new = calc_res_and_gs(
                &mut init.points[lvl],
                &mut init.jb_new,
                &calib,
                &first.levels[lvl],
                &frame.levels[lvl],
                &pose_new,
                aff,
                &cfg,
            );
            let reg = calc_ec(&init.points[lvl], false, cfg.coupling_weight);

            let e_old = sys.res[0] + sys.res[1] + reg[0];
            let e_new = sys_new.res[0] + sys_new.res[1] + reg[1];

            if e_old > e_new {
                accepted_energies.push(e_new);
                sys = sys_new;
                pose = pose_new;
                apply_step(&mut init.points[lvl], &mut init.jb, &mut init.jb_new);
                opt_reg(&mut init.points[lvl], false, cfg.reg_weight);
                lambda = (lambda * 0.5).max(1e-4);
            } else {
                lambda = (lambda * 4.0).min(1e4);
            }
        }

        assert!(
            accepted_energies.len() > 1,
            "no step was ever accepted on the coarsest level"
        );
        for pair in accepted_energies.windows(2) {
            assert!(
                pair[1] < pair[0],
                "accepted step raised the energy: {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_schur_complement_matches_dense_elimination() {
        let mut rng = StdRng::seed_from_u64(7);
        const NPTS: usize = 3;
        const SAMPLES: usize = 8;

        let mut acc = Accumulator9::new();
        let mut acc_sc = Accumulator9::new();
        let mut jb = [JbBuffer::zeros(); NPTS];

        // Dense joint system over [pose+affine (8) | inverse depths (NPTS)],
        // with the unit prior on each depth diagonal that the inverted
        // buffer slot 1/(1 + h_dd) implies.
        let n = 8 + NPTS;
        let mut a_full = DMatrix::<f64>::zeros(n, n);
        let mut b_full = DVector::<f64>::zeros(n);

        for k in 0..NPTS {
            for _ in 0..SAMPLES {
                let mut jp = [0.0f32; 8];
                for v in jp.iter_mut() {
                    *v = rng.gen_range(-1.0..1.0);
                }
                let dd: f32 = rng.gen_range(0.2..1.5);
                let r: f32 = rng.gen_range(-0.5..0.5);

                acc.update(&[jp[0], jp[1], jp[2], jp[3], jp[4], jp[5], jp[6], jp[7], r]);
                for i in 0..8 {
                    jb[k][i] += jp[i] * dd;
                }
                jb[k][8] += r * dd;
                jb[k][9] += dd * dd;

                for row in 0..8 {
                    for col in 0..8 {
                        a_full[(row, col)] += f64::from(jp[row] * jp[col]);
                    }
                    a_full[(row, 8 + k)] += f64::from(jp[row] * dd);
                    a_full[(8 + k, row)] += f64::from(jp[row] * dd);
                    b_full[row] += f64::from(jp[row] * r);
                }
                a_full[(8 + k, 8 + k)] += f64::from(dd * dd);
                b_full[8 + k] += f64::from(r * dd);
            }
            a_full[(8 + k, 8 + k)] += 1.0;
        }
        acc.finish();

        for buf in &jb {
            let weight = 1.0 / (1.0 + buf[9]);
            acc_sc.update_weighted(
                &[
                    buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8],
                ],
                weight,
            );
        }
        acc_sc.finish();

        let h_red = (acc.hessian() - acc_sc.hessian()).cast::<f64>();
        let b_red = (acc.rhs() - acc_sc.rhs()).cast::<f64>();
        let x_red = Cholesky::new(h_red)
            .expect("reduced system is positive definite")
            .solve(&b_red);

        let x_full = a_full.lu().solve(&b_full).expect("joint system solvable");

        for i in 0..8 {
            assert_relative_eq!(x_red[i], x_full[i], epsilon = 1e-4, max_relative = 1e-3);
        }
    }

    #[test]
    fn test_regularization_targets_reset_before_snap() {
        let mut points: Vec<Point> = (0..5)
            .map(|i| Point::new(i as f32, 0.0, 1152.0))
            .collect();
        for p in points.iter_mut() {
            p.ir = 7.0;
        }

        opt_reg(&mut points, false, 0.8);

        assert!(points.iter().all(|p| p.ir == 1.0));
    }

    #[test]
    fn test_regularization_blends_toward_neighbour_median() {
        let mut points: Vec<Point> = (0..4)
            .map(|i| Point::new(i as f32, 0.0, 1152.0))
            .collect();
        for i in 0..4 {
            let mut n = 0;
            for j in 0..4 {
                if j != i {
                    points[i].neighbours[n] = (j as u32, 1.0);
                    n += 1;
                }
            }
            points[i].num_neighbours = n;
        }
        points[0].idepth = 2.0;
        points[1].ir = 1.0;
        points[2].ir = 3.0;
        points[3].ir = 5.0;

        opt_reg(&mut points, true, 0.8);

        // Median of {1, 3, 5} is 3; the target mixes 20% own depth in.
        assert_relative_eq!(points[0].ir, 0.2 * 2.0 + 0.8 * 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_coupling_energy_zero_before_snap() {
        let mut points: Vec<Point> = (0..3)
            .map(|i| Point::new(i as f32, 0.0, 1152.0))
            .collect();
        for p in points.iter_mut() {
            p.idepth = 4.0;
            p.idepth_new = 6.0;
            p.ir = 1.0;
        }

        let before = calc_ec(&points, false, 1.0);
        assert_eq!(before[0], 0.0);
        assert_eq!(before[1], 0.0);

        let after = calc_ec(&points, true, 1.0);
        assert_relative_eq!(after[0], 3.0 * 9.0, epsilon = 1e-4);
        assert_relative_eq!(after[1], 3.0 * 25.0, epsilon = 1e-4);
    }

    #[test]
    fn test_synthetic_translation_recovery() {
        let (init, states) = run_sequence(12);
        assert!(
            states.last().map_or(false, |(done, _)| *done),
            "did not converge within twelve frames"
        );

        let t = init.pose().translation;
        assert!(t.norm() > 1e-3, "translation collapsed: {}", t.norm());
        assert!(
            t.x / t.norm() > 0.95,
            "translation direction off: {:?}",
            t
        );
        assert!(t.x > 0.0);

        let mut depths: Vec<f32> = init.finest_points().map(|p| p.idepth).collect();
        assert!(depths.len() > 50, "too few surviving points: {}", depths.len());
        depths.sort_by(f32::total_cmp);
        let median = depths[depths.len() / 2];

        // Monocular scale is a free gauge: the depth-to-1 prior anchors it
        // only until snapping, after which the data constrain the product
        // fx·tx·idepth alone. Compare that observable to the known pixel
        // shift of the last tracked frame.
        let expected_shift = 1.8 * init.frame_count() as f64;
        let observed_shift = TEST_FX * t.x * f64::from(median);
        assert!(
            ((observed_shift - expected_shift) / expected_shift).abs() < 0.05,
            "observable pixel shift {} deviates from ground truth {}",
            observed_shift,
            expected_shift
        );

        // With the gauge normalized out, the plane must come out flat.
        let lower_quartile = depths[depths.len() / 4] / median;
        let upper_quartile = depths[3 * depths.len() / 4] / median;
        assert!(
            lower_quartile > 0.8 && upper_quartile < 1.25,
            "normalized depth spread too wide: [{}, {}]",
            lower_quartile,
            upper_quartile
        );

        for lvl in 0..TEST_LEVELS {
            for p in init.points(lvl) {
                assert!(p.idepth >= IDEPTH_MIN && p.idepth <= IDEPTH_MAX);
            }
        }
    }

    #[test]
    fn test_snap_is_sticky_and_convergence_is_delayed() {
        let (init, states) = run_sequence(12);

        let snap_frame = states
            .iter()
            .position(|(_, s)| *s != InitializerState::Unsnapped)
            .expect("translation never judged sufficient")
            + 1;

        for (i, (done, state)) in states.iter().enumerate() {
            let frame = i + 1;
            if frame > snap_frame {
                assert_ne!(
                    *state,
                    InitializerState::Unsnapped,
                    "snap must not revert at frame {}",
                    frame
                );
            }
            if *done {
                assert_eq!(*state, InitializerState::Converged);
                assert!(
                    frame > snap_frame + 5,
                    "converged at frame {} too soon after snapping at {}",
                    frame,
                    snap_frame
                );
            }
        }

        assert_eq!(init.state(), InitializerState::Converged);
        assert!(init.frame_count() > snap_frame + 5);
    }
}
