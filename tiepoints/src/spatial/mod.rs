//! 2-D k-d tree for radius queries over interest point positions.
//!
//! Constrained matching maps every raster 1 point into raster 2 space and only
//! compares it against raster 2 points within the expected error. The tree is
//! built once per point set and queried from many workers.


use glam::DVec2;

#[derive(Debug)]
pub struct KdTree {
    nodes: Vec<KdNode>,
    points: Vec<DVec2>,
}

#[derive(Debug, Clone)]
struct KdNode {
    point_idx: usize,
    left: Option<usize>,
    right: Option<usize>,
    /// 0 = x, 1 = y
    split_dim: usize,
}

impl KdTree {
    /// Builds a median-split tree; `None` for an empty point set.
    pub fn build(points: &[DVec2]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }

        let points_vec = points.to_vec();
        let mut indices: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());

        Self::build_recursive(&points_vec, &mut indices, 0, &mut nodes);

        Some(Self {
            nodes,
            points: points_vec,
        })
    }

    fn build_recursive(
        points: &[DVec2],
        indices: &mut [usize],
        depth: usize,
        nodes: &mut Vec<KdNode>,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        let split_dim = depth % 2;
        indices.sort_by(|&a, &b| points[a][split_dim].total_cmp(&points[b][split_dim]));

        let median = indices.len() / 2;
        let point_idx = indices[median];

        let node_idx = nodes.len();
        nodes.push(KdNode {
            point_idx,
            left: None,
            right: None,
            split_dim,
        });

        let (left_indices, right_part) = indices.split_at_mut(median);
        let right_indices = &mut right_part[1..];

        let left = Self::build_recursive(points, left_indices, depth + 1, nodes);
        let right = Self::build_recursive(points, right_indices, depth + 1, nodes);

        nodes[node_idx].left = left;
        nodes[node_idx].right = right;

        Some(node_idx)
    }

    /// All points within `radius` of `query` as `(index, distance_squared)`,
    /// sorted by distance then index.
    pub fn radius_search(&self, query: DVec2, radius: f64) -> Vec<(usize, f64)> {
        let mut results = Vec::new();
        self.radius_search_into(query, radius, &mut results);
        results
    }

    /// Same as [`KdTree::radius_search`], reusing `results`.
    pub fn radius_search_into(&self, query: DVec2, radius: f64, results: &mut Vec<(usize, f64)>) {
        results.clear();
        if self.nodes.is_empty() || radius.is_nan() || radius < 0.0 {
            return;
        }

        self.radius_search_recursive(0, query, radius * radius, results);
        results.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    }

    fn radius_search_recursive(
        &self,
        node_idx: usize,
        query: DVec2,
        radius_sq: f64,
        results: &mut Vec<(usize, f64)>,
    ) {
        let node = &self.nodes[node_idx];
        let point = self.points[node.point_idx];

        let dist_sq = query.distance_squared(point);
        if dist_sq <= radius_sq {
            results.push((node.point_idx, dist_sq));
        }

        let diff = query[node.split_dim] - point[node.split_dim];
        let diff_sq = diff * diff;

        if let Some(left_idx) = node.left {
            if diff <= 0.0 || diff_sq <= radius_sq {
                self.radius_search_recursive(left_idx, query, radius_sq, results);
            }
        }

        if let Some(right_idx) = node.right {
            if diff >= 0.0 || diff_sq <= radius_sq {
                self.radius_search_recursive(right_idx, query, radius_sq, results);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, idx: usize) -> DVec2 {
        self.points[idx]
    }
}
