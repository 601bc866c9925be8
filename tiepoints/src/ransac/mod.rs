//! RANSAC (Random Sample Consensus) outlier filter for tie-points.
//!
//! Every worker repeatedly draws the model's minimum number of tie-points
//! (weighted, without replacement), fits a candidate and collects the
//! consensus set of tie-points whose direct and inverse mapping errors stay
//! within the thresholds. Candidates are ranked by:
//! 1. More inliers
//! 2. Same count, larger convex-hull area of the inliers' raster 1 coordinates
//! 3. Same count and area, smaller maximum direct AND inverse error
//!
//! Workers merge their local best into a shared best under one mutex using the
//! same rule, every `workers` iterations and when they finish. With
//! `max_iterations == 0` the iteration bound follows the classic estimate
//! `log(1 - assurance) / log(1 - inlier_ratio^min_points)`.


use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use common::parallel;
use glam::DVec2;
use parking_lot::Mutex;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use crate::error::RansacError;
use crate::geometry::convex_hull_area;
use crate::transform::{
    GTParameters, GeometricTransformation, TiePoint, TransformModel, TransformRegistry,
};

/// Upper bound for automatically estimated iteration counts.
const MAX_AUTO_ITERATIONS: usize = 1 << 22;

/// Upper bound for an automatically derived assurance.
const MAX_AUTO_ASSURANCE: f64 = 0.9999;

/// Redraws allowed per requested index before a sample is given up.
const MAX_DRAWS_PER_INDEX: usize = 64;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RansacConfig {
    /// Maximum direct mapping error of an inlier, in raster 2 pixels.
    pub max_direct_map_error: f64,
    /// Maximum inverse mapping error of an inlier, in raster 1 pixels.
    pub max_inverse_map_error: f64,
    /// Total iteration budget shared by all workers. 0 = estimated dynamically.
    pub max_iterations: usize,
    /// Probability of drawing at least one outlier-free sample, in [0, 1].
    /// 0 = derived from the model's minimum tie-points count.
    pub assurance: f64,
    pub enable_multi_thread: bool,
    /// Base seed; worker `i` uses `seed + i`. `None` seeds from OS entropy.
    pub seed: Option<u64>,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_direct_map_error: 2.0,
            max_inverse_map_error: 2.0,
            max_iterations: 0,
            assurance: 0.75,
            enable_multi_thread: true,
            seed: None,
        }
    }
}

impl RansacConfig {
    pub fn validate(&self) -> Result<(), RansacError> {
        let negative = |e: f64| e.is_nan() || e < 0.0;
        if negative(self.max_direct_map_error) || negative(self.max_inverse_map_error) {
            return Err(RansacError::NegativeThreshold);
        }
        if !(0.0..=1.0).contains(&self.assurance) {
            return Err(RansacError::InvalidAssurance(self.assurance));
        }
        Ok(())
    }

    /// Assurance actually used for a model needing `min_points` tie-points.
    pub fn effective_assurance(&self, min_points: usize) -> f64 {
        if self.assurance > 0.0 {
            self.assurance
        } else {
            auto_assurance(min_points)
        }
    }
}

/// `1 - 10^(-min_points)`, capped below 1.
pub fn auto_assurance(min_points: usize) -> f64 {
    (1.0 - 10f64.powi(-(min_points as i32))).min(MAX_AUTO_ASSURANCE)
}

// ============================================================================
// Result
// ============================================================================

#[derive(Debug, Clone)]
pub struct RansacOutcome {
    /// Best transformation, refitted on its consensus set when possible.
    pub transformation: GeometricTransformation,
    /// Consensus tie-points in input order.
    pub tie_points: Vec<TiePoint>,
    /// Input indices of `tie_points`.
    pub indices: Vec<usize>,
    /// Input weights of `tie_points` (1.0 when no weights were given).
    pub weights: Vec<f64>,
    pub direct_rmse: f64,
    pub inverse_rmse: f64,
    /// Iterations run across all workers.
    pub iterations: usize,
}

// ============================================================================
// Filter
// ============================================================================

/// RANSAC filter over the models of a [`TransformRegistry`].
#[derive(Debug, Clone, Default)]
pub struct RansacFilter {
    registry: TransformRegistry,
}

impl RansacFilter {
    pub fn new(registry: TransformRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TransformRegistry {
        &self.registry
    }

    /// Finds the best-supported `transformation_name` for `tie_points`.
    ///
    /// `weights` bias sampling; `None` samples uniformly. Failing to reach any
    /// consensus is reported as [`RansacError::NoConsensus`].
    pub fn apply(
        &self,
        transformation_name: &str,
        tie_points: &[TiePoint],
        weights: Option<&[f64]>,
        config: &RansacConfig,
    ) -> Result<RansacOutcome, RansacError> {
        config.validate()?;

        let prototype = self
            .registry
            .build(transformation_name)
            .ok_or_else(|| RansacError::UnknownTransformation(transformation_name.to_string()))?;

        let sampling = SamplingMap::new(tie_points.len(), weights)?;

        let required = prototype.min_required_tie_points();
        if sampling.selectable < required {
            return Err(RansacError::NotEnoughTiePoints {
                required,
                supplied: sampling.selectable,
            });
        }

        let workers = parallel::worker_count(config.enable_multi_thread);
        let assurance = config.effective_assurance(required);
        let initial_max_iterations = if config.max_iterations > 0 {
            (config.max_iterations / workers).max(1)
        } else {
            estimate_max_iterations(required, tie_points.len(), required, workers, assurance)
        };

        let search = Search {
            model: prototype.model(),
            tie_points,
            sampling: &sampling,
            required,
            workers,
            assurance,
            max_direct_error: config.max_direct_map_error,
            max_inverse_error: config.max_inverse_map_error,
            dynamic: config.max_iterations == 0,
            seed: config.seed,
            keep_running: AtomicBool::new(true),
            global_max_iterations: AtomicUsize::new(initial_max_iterations),
            best: Mutex::new(None),
        };

        tracing::debug!(
            transformation = transformation_name,
            tie_points = tie_points.len(),
            workers,
            assurance,
            initial_max_iterations,
            "Starting RANSAC"
        );

        let iterations: usize = parallel::broadcast_workers(workers, |idx| search.run_worker(idx))?
            .into_iter()
            .sum();

        let best = search.best.into_inner().ok_or(RansacError::NoConsensus)?;

        let mut transformation = prototype;
        transformation
            .set_parameters(best.params)
            .map_err(|_| RansacError::NoConsensus)?;

        let consensus: Vec<TiePoint> = best.inliers.iter().map(|&i| tie_points[i]).collect();
        if let Err(err) = transformation.initialize(GTParameters::from_tie_points(consensus.clone())) {
            tracing::debug!(%err, "Consensus refit failed, keeping sample fit");
        }

        let outcome = RansacOutcome {
            direct_rmse: transformation.direct_map_rmse_of(&consensus),
            inverse_rmse: transformation.inverse_map_rmse_of(&consensus),
            weights: best
                .inliers
                .iter()
                .map(|&i| weights.map_or(1.0, |w| w[i]))
                .collect(),
            tie_points: consensus,
            indices: best.inliers,
            transformation,
            iterations,
        };

        tracing::info!(
            transformation = transformation_name,
            inliers = outcome.tie_points.len(),
            tie_points = tie_points.len(),
            iterations,
            direct_rmse = outcome.direct_rmse,
            inverse_rmse = outcome.inverse_rmse,
            "RANSAC finished"
        );

        Ok(outcome)
    }
}

/// Classic RANSAC iteration estimate split across `workers`.
fn estimate_max_iterations(
    good: usize,
    total: usize,
    required: usize,
    workers: usize,
    assurance: f64,
) -> usize {
    let inlier_ratio = good as f64 / total as f64;
    let estimate =
        (1.0 - assurance).ln() / (1.0 - inlier_ratio.powi(required as i32)).ln();
    let estimate = if estimate.is_nan() {
        1.0
    } else {
        estimate.clamp(0.0, MAX_AUTO_ITERATIONS as f64)
    };
    ((estimate as usize) / workers).max(1)
}

fn max_invalid_iterations(assurance: f64, max_iterations: usize) -> usize {
    ((max_iterations as f64 * assurance) as usize).max(1)
}

// ============================================================================
// Weighted sampling
// ============================================================================

/// Cumulative selection probabilities over the input tie-points.
#[derive(Debug)]
pub(crate) struct SamplingMap {
    cumulative: Vec<f64>,
    /// Tie-points `select` can actually return: those owning a non-empty
    /// step of `cumulative`. A weight too small to move the running sum
    /// does not count.
    selectable: usize,
}

impl SamplingMap {
    pub(crate) fn new(count: usize, weights: Option<&[f64]>) -> Result<Self, RansacError> {
        let Some(weights) = weights else {
            let cumulative = (1..=count).map(|i| i as f64 / count as f64).collect();
            return Ok(Self {
                cumulative,
                selectable: count,
            });
        };

        if weights.len() != count {
            return Err(RansacError::WeightsLengthMismatch {
                weights: weights.len(),
                tie_points: count,
            });
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(RansacError::InvalidWeights);
        }
        let sum: f64 = weights.iter().sum();
        if sum <= 0.0 {
            return Err(RansacError::InvalidWeights);
        }

        let mut cumulative = Vec::with_capacity(count);
        let mut acc = 0.0;
        for w in weights {
            acc += w / sum;
            cumulative.push(acc);
        }
        // Rounding must not leave a gap below 1 after the last selectable point.
        if let Some(last) = weights.iter().rposition(|&w| w > 0.0) {
            cumulative[last..].fill(1.0);
        }

        let mut previous = 0.0;
        let selectable = cumulative
            .iter()
            .filter(|&&c| {
                let step = c > previous;
                previous = c;
                step
            })
            .count();

        Ok(Self {
            cumulative,
            selectable,
        })
    }

    /// Index selected by `r` in `[0, 1)`.
    #[inline]
    pub(crate) fn select(&self, r: f64) -> usize {
        self.cumulative
            .partition_point(|&c| c <= r)
            .min(self.cumulative.len() - 1)
    }

    /// Draws `count` distinct indices into `out`.
    ///
    /// Returns `false` when the redraw budget runs out first, which happens
    /// when a few heavy weights crowd out the rest.
    pub(crate) fn draw_distinct(
        &self,
        rng: &mut impl Rng,
        count: usize,
        out: &mut Vec<usize>,
    ) -> bool {
        out.clear();
        if count > self.selectable {
            return false;
        }
        let mut attempts = count * MAX_DRAWS_PER_INDEX;
        while out.len() < count {
            if attempts == 0 {
                return false;
            }
            attempts -= 1;
            let idx = self.select(rng.random::<f64>());
            if !out.contains(&idx) {
                out.push(idx);
            }
        }
        true
    }
}

// ============================================================================
// Search
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct Rank {
    inliers: usize,
    hull_area: f64,
    max_direct_error: f64,
    max_inverse_error: f64,
}

impl Rank {
    fn beats(&self, other: &Rank) -> bool {
        self.inliers > other.inliers
            || (self.inliers == other.inliers
                && (self.hull_area > other.hull_area
                    || (self.hull_area == other.hull_area
                        && self.max_direct_error < other.max_direct_error
                        && self.max_inverse_error < other.max_inverse_error)))
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    params: GTParameters,
    inliers: Vec<usize>,
    rank: Rank,
}

/// State shared by all workers of one filter run.
struct Search<'a> {
    model: &'a dyn TransformModel,
    tie_points: &'a [TiePoint],
    sampling: &'a SamplingMap,
    required: usize,
    workers: usize,
    assurance: f64,
    max_direct_error: f64,
    max_inverse_error: f64,
    dynamic: bool,
    seed: Option<u64>,
    keep_running: AtomicBool,
    global_max_iterations: AtomicUsize,
    best: Mutex<Option<Candidate>>,
}

impl Search<'_> {
    /// Runs one worker to completion and returns its iteration count.
    fn run_worker(&self, worker_index: usize) -> usize {
        let mut rng = match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed.wrapping_add(worker_index as u64)),
            None => ChaCha8Rng::from_os_rng(),
        };

        let total = self.tie_points.len();
        let mut local: Option<Candidate> = None;
        let mut local_rank = Rank {
            inliers: 0,
            hull_area: -1.0,
            max_direct_error: self.max_direct_error,
            max_inverse_error: self.max_inverse_error,
        };

        let mut sample = Vec::with_capacity(self.required);
        let mut params = GTParameters::default();
        let mut inliers = Vec::with_capacity(total);
        let mut hull_points = Vec::with_capacity(total);

        let mut max_iterations = self.global_max_iterations.load(Ordering::Acquire);
        let mut max_invalid = max_invalid_iterations(self.assurance, max_iterations);
        let mut iteration = 0;
        let mut sync_iteration = 0;
        let mut consecutive_invalid = 0;

        while self.keep_running.load(Ordering::Acquire)
            && iteration < max_iterations
            && consecutive_invalid < max_invalid
        {
            let drawn = self
                .sampling
                .draw_distinct(&mut rng, self.required, &mut sample);
            params.reset();
            params
                .tie_points
                .extend(sample.iter().map(|&i| self.tie_points[i]));

            let accepted = drawn && self.model.compute_parameters(&mut params).is_ok() && {
                let rank = self.consensus(&params, &mut inliers, &mut hull_points);
                if rank.inliers >= self.required && rank.beats(&local_rank) {
                    local_rank = rank;
                    local = Some(Candidate {
                        params: params.clone(),
                        inliers: inliers.clone(),
                        rank,
                    });
                    true
                } else {
                    false
                }
            };

            if accepted {
                consecutive_invalid = 0;
            } else {
                consecutive_invalid += 1;
            }

            if self.dynamic && iteration != 0 {
                if local_rank.inliers == total {
                    self.keep_running.store(false, Ordering::Release);
                    break;
                } else if local_rank.inliers > 0 {
                    let estimate = estimate_max_iterations(
                        local_rank.inliers,
                        total,
                        self.required,
                        self.workers,
                        self.assurance,
                    );
                    if estimate < max_iterations {
                        max_iterations -= (max_iterations - estimate) / 2;
                        max_invalid = max_invalid_iterations(self.assurance, max_iterations);
                    }

                    let global = self.global_max_iterations.load(Ordering::Acquire);
                    if global < max_iterations {
                        max_iterations = global;
                        max_invalid = max_invalid_iterations(self.assurance, max_iterations);
                    }
                }
            }

            if sync_iteration >= self.workers
                || iteration >= max_iterations
                || consecutive_invalid >= max_invalid
            {
                sync_iteration = 0;
                self.sync(local.as_ref(), max_iterations);
            }

            sync_iteration += 1;
            iteration += 1;
        }

        self.sync(local.as_ref(), max_iterations);

        tracing::debug!(
            worker = worker_index,
            iterations = iteration,
            inliers = local_rank.inliers,
            "RANSAC worker finished"
        );

        iteration
    }

    /// Collects the consensus set of `params` into `inliers`.
    fn consensus(
        &self,
        params: &GTParameters,
        inliers: &mut Vec<usize>,
        hull_points: &mut Vec<DVec2>,
    ) -> Rank {
        inliers.clear();
        hull_points.clear();
        let mut max_direct_error = 0.0f64;
        let mut max_inverse_error = 0.0f64;

        for (idx, tp) in self.tie_points.iter().enumerate() {
            let direct = self.model.direct_mapping_error(tp, params);
            let inverse = self.model.inverse_mapping_error(tp, params);
            if direct <= self.max_direct_error && inverse <= self.max_inverse_error {
                inliers.push(idx);
                hull_points.push(tp.pt1);
                max_direct_error = max_direct_error.max(direct);
                max_inverse_error = max_inverse_error.max(inverse);
            }
        }

        Rank {
            inliers: inliers.len(),
            hull_area: convex_hull_area(hull_points),
            max_direct_error,
            max_inverse_error,
        }
    }

    /// Merges a worker's best into the shared best and publishes its bound.
    fn sync(&self, local: Option<&Candidate>, max_iterations: usize) {
        let mut best = self.best.lock();
        if let Some(candidate) = local {
            let replace = match best.as_ref() {
                None => true,
                Some(current) => candidate.rank.beats(&current.rank),
            };
            if replace {
                *best = Some(candidate.clone());
            }
        }
        self.global_max_iterations
            .fetch_min(max_iterations, Ordering::AcqRel);
    }
}
