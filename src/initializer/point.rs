//! Per-level point arenas for the joint photometric optimizer.
//!
//! One [`Point`] exists per selected reference-frame pixel and per pyramid
//! level. The arenas are rebuilt from scratch when a new reference frame is
//! set and are addressed by stable indices for the lifetime of one
//! initialization attempt; neighbour and parent links index into them.

use nalgebra::Vector2;

/// Maximum number of same-level neighbours per point.
pub const MAX_NEIGHBOURS: usize = 10;

/// Neighbour weights are renormalized to sum to this constant.
pub const NEIGHBOUR_WEIGHT_SUM: f32 = 10.0;

/// One selected reference-frame pixel with its inverse-depth state.
#[derive(Debug, Clone)]
pub struct Point {
    /// Subpixel column in the level's image.
    pub u: f32,
    /// Subpixel row in the level's image.
    pub v: f32,

    /// Current inverse depth, clamped to [1e-3, 50].
    pub idepth: f32,
    /// Candidate inverse depth for the step under evaluation.
    pub idepth_new: f32,
    /// Regularization target.
    pub ir: f32,

    /// Validity of the current state.
    pub is_good: bool,
    /// Validity of the candidate state.
    pub is_good_new: bool,

    /// Current (data-term, depth-prior) energy.
    pub energy: Vector2<f32>,
    /// Candidate (data-term, depth-prior) energy.
    pub energy_new: Vector2<f32>,

    /// Depth-depth information scalar from the last solve.
    pub last_hessian: f32,
    /// Candidate information scalar.
    pub last_hessian_new: f32,

    /// Upper bound on one inverse-depth step, from projective sensitivity.
    pub max_step: f32,

    /// Outlier energy threshold, sized to the residual-pattern cardinality.
    pub outlier_th: f32,

    /// Same-level neighbour indices with similarity weights.
    pub neighbours: [(u32, f32); MAX_NEIGHBOURS],
    /// Number of valid entries in `neighbours`.
    pub num_neighbours: usize,

    /// Nearest point in the next coarser level with its similarity weight,
    /// or `None` at the coarsest level.
    pub parent: Option<(u32, f32)>,

    /// Accumulator for information-weighted upward propagation.
    pub ir_sum: f32,
    /// Total information weight accumulated during upward propagation.
    pub ir_sum_num: f32,
}

impl Point {
    pub fn new(u: f32, v: f32, outlier_th: f32) -> Self {
        Self {
            u,
            v,
            idepth: 1.0,
            idepth_new: 1.0,
            ir: 1.0,
            is_good: true,
            is_good_new: true,
            energy: Vector2::zeros(),
            energy_new: Vector2::zeros(),
            last_hessian: 0.0,
            last_hessian_new: 0.0,
            max_step: 1e10,
            outlier_th,
            neighbours: [(0, 0.0); MAX_NEIGHBOURS],
            num_neighbours: 0,
            parent: None,
            ir_sum: 0.0,
            ir_sum_num: 0.0,
        }
    }

    /// Valid same-level neighbour links.
    pub fn neighbour_iter(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.neighbours[..self.num_neighbours]
            .iter()
            .map(|&(idx, w)| (idx as usize, w))
    }
}
