//! Mutual-best matching between two interest point sets.
//!
//! The metric is supplied by the strategy as a similarity (higher is better,
//! `None` or non-positive = not comparable). A pair `(i, j)` is kept only when
//! `j` is the unique best match of `i` and `i` is the unique best match of `j`.
//! Exact ties leave both sides unmatched.

use std::f64::consts::SQRT_2;

use common::parallel::{WorkCounter, broadcast_workers};
use glam::DVec2;

use crate::spatial::KdTree;
use crate::transform::GeometricTransformation;

/// Raster 1 rows handed out per work unit.
const ROWS_PER_UNIT: usize = 16;

/// Which raster 2 points a raster 1 point is compared against.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SearchRegion<'a> {
    /// Every raster 2 point.
    Unrestricted,
    /// Points within `radius` of the raster 1 point mapped through `transformation`.
    Prior {
        transformation: &'a GeometricTransformation,
        radius: f64,
    },
    /// Points whose x and y both differ by at most this many pixels.
    MaxOffset(f64),
}

impl<'a> SearchRegion<'a> {
    /// A prior transformation wins over the offset limit; an offset of 0 is off.
    pub(crate) fn new(
        prior: Option<&'a GeometricTransformation>,
        expected_error: f64,
        max_offset: f64,
    ) -> Self {
        match prior {
            Some(transformation) => SearchRegion::Prior {
                transformation,
                radius: expected_error,
            },
            None if max_offset > 0.0 => SearchRegion::MaxOffset(max_offset),
            None => SearchRegion::Unrestricted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Match {
    pub index1: usize,
    pub index2: usize,
    pub similarity: f64,
}

/// Best candidate seen so far for one row or column.
#[derive(Debug, Clone, Copy)]
struct Best {
    similarity: f64,
    index: Option<usize>,
    tied: bool,
}

impl Best {
    const NONE: Best = Best {
        similarity: 0.0,
        index: None,
        tied: false,
    };

    fn offer(&mut self, similarity: f64, index: usize) {
        match self.index {
            None => {
                *self = Best {
                    similarity,
                    index: Some(index),
                    tied: false,
                }
            }
            Some(current) => {
                if similarity > self.similarity {
                    *self = Best {
                        similarity,
                        index: Some(index),
                        tied: false,
                    };
                } else if similarity == self.similarity && current != index {
                    self.tied = true;
                }
            }
        }
    }

    fn merge(&mut self, other: &Best) {
        let Some(other_index) = other.index else {
            return;
        };
        match self.index {
            None => *self = *other,
            Some(current) => {
                if other.similarity > self.similarity {
                    *self = *other;
                } else if other.similarity == self.similarity {
                    self.tied |= other.tied || current != other_index;
                }
            }
        }
    }

    fn unique(&self) -> Option<usize> {
        if self.tied { None } else { self.index }
    }
}

/// Matches `points1` against `points2` (raster pixel coordinates) with
/// `similarity(index1, index2)`, spreading raster 1 rows over `workers`.
pub(crate) fn match_mutual_best<F>(
    points1: &[DVec2],
    points2: &[DVec2],
    region: SearchRegion<'_>,
    workers: usize,
    similarity: F,
) -> Result<Vec<Match>, rayon::ThreadPoolBuildError>
where
    F: Fn(usize, usize) -> Option<f64> + Sync,
{
    let (Some(tree), false) = (KdTree::build(points2), points1.is_empty()) else {
        return Ok(Vec::new());
    };

    let counter = WorkCounter::new(points1.len().div_ceil(ROWS_PER_UNIT));

    let partials = broadcast_workers(workers, |_| {
        let mut rows = Vec::new();
        let mut columns = vec![Best::NONE; points2.len()];
        let mut found = Vec::new();
        let mut candidates = Vec::new();

        while let Some(unit) = counter.next_unit() {
            let first = unit * ROWS_PER_UNIT;
            let last = (first + ROWS_PER_UNIT).min(points1.len());

            for index1 in first..last {
                collect_candidates(&tree, points1[index1], region, &mut found, &mut candidates);

                let mut row = Best::NONE;
                for &index2 in &candidates {
                    let Some(s) = similarity(index1, index2) else {
                        continue;
                    };
                    if s.is_nan() || s <= 0.0 {
                        continue;
                    }
                    row.offer(s, index2);
                    columns[index2].offer(s, index1);
                }
                rows.push((index1, row));
            }
        }

        (rows, columns)
    })?;

    let mut row_best = vec![Best::NONE; points1.len()];
    let mut column_best = vec![Best::NONE; points2.len()];
    for (rows, columns) in partials {
        for (index1, best) in rows {
            row_best[index1] = best;
        }
        for (dst, src) in column_best.iter_mut().zip(&columns) {
            dst.merge(src);
        }
    }

    let matches: Vec<Match> = row_best
        .iter()
        .enumerate()
        .filter_map(|(index1, row)| {
            let index2 = row.unique()?;
            (column_best[index2].unique() == Some(index1)).then_some(Match {
                index1,
                index2,
                similarity: row.similarity,
            })
        })
        .collect();

    tracing::debug!(
        points1 = points1.len(),
        points2 = points2.len(),
        matches = matches.len(),
        "Mutual best matching finished"
    );

    Ok(matches)
}

fn collect_candidates(
    tree: &KdTree,
    point1: DVec2,
    region: SearchRegion<'_>,
    found: &mut Vec<(usize, f64)>,
    candidates: &mut Vec<usize>,
) {
    candidates.clear();
    match region {
        SearchRegion::Unrestricted => candidates.extend(0..tree.len()),
        SearchRegion::Prior {
            transformation,
            radius,
        } => {
            tree.radius_search_into(transformation.direct_map(point1), radius, found);
            candidates.extend(found.iter().map(|&(idx, _)| idx));
        }
        SearchRegion::MaxOffset(offset) => {
            tree.radius_search_into(point1, offset * SQRT_2, found);
            candidates.extend(found.iter().map(|&(idx, _)| idx).filter(|&idx| {
                let d = (tree.point(idx) - point1).abs();
                d.x <= offset && d.y <= offset
            }));
        }
    }
}
