//! Neighbour graph construction over the selected points of each level.
//!
//! For every point we keep its 10 nearest same-level neighbours, weighted by
//! an exponential kernel of the squared distance and renormalized to sum to
//! 10, plus a single "parent" link to the nearest point of the next coarser
//! level. The parent query runs at the point's coordinate scaled by one-half
//! minus a half-pixel offset, aligning the sampling grids of adjacent
//! pyramid levels. The graph is rebuilt with the point population and is
//! immutable for the rest of the attempt.

use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::initializer::point::{Point, MAX_NEIGHBOURS, NEIGHBOUR_WEIGHT_SUM};

/// Decay factor of the distance kernel `exp(-d² · factor)`.
const NN_DIST_FACTOR: f32 = 0.05;

/// Arena index plus position, as stored in the spatial index.
struct IndexedPoint {
    index: usize,
    pos: [f32; 2],
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f32; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.pos)
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f32; 2]) -> f32 {
        let dx = self.pos[0] - point[0];
        let dy = self.pos[1] - point[1];
        dx * dx + dy * dy
    }
}

/// Builds neighbour and parent links for every level of the point arena.
pub fn build_neighbor_graph(levels: &mut [Vec<Point>]) {
    let trees: Vec<RTree<IndexedPoint>> = levels
        .iter()
        .map(|points| {
            RTree::bulk_load(
                points
                    .iter()
                    .enumerate()
                    .map(|(index, p)| IndexedPoint {
                        index,
                        pos: [p.u, p.v],
                    })
                    .collect(),
            )
        })
        .collect();

    let num_levels = levels.len();
    for lvl in 0..num_levels {
        let has_coarser = lvl + 1 < num_levels;
        for point in levels[lvl].iter_mut() {
            let query = [point.u, point.v];

            let mut num = 0;
            let mut weight_sum = 0.0f32;
            for (entry, dist_sq) in trees[lvl]
                .nearest_neighbor_iter_with_distance_2(&query)
                .take(MAX_NEIGHBOURS)
            {
                let weight = (-dist_sq * NN_DIST_FACTOR).exp();
                point.neighbours[num] = (entry.index as u32, weight);
                weight_sum += weight;
                num += 1;
            }
            point.num_neighbours = num;

            if weight_sum > 0.0 {
                let scale = NEIGHBOUR_WEIGHT_SUM / weight_sum;
                for entry in &mut point.neighbours[..num] {
                    entry.1 *= scale;
                }
            }

            point.parent = if has_coarser {
                let parent_query = [query[0] * 0.5 - 0.25, query[1] * 0.5 - 0.25];
                trees[lvl + 1]
                    .nearest_neighbor_iter_with_distance_2(&parent_query)
                    .next()
                    .map(|(entry, dist_sq)| {
                        (entry.index as u32, (-dist_sq * NN_DIST_FACTOR).exp())
                    })
            } else {
                None
            };
        }
    }
}
