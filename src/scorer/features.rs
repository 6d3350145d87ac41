//! Feature extraction over a window of statistics entries
//!
//! A window of up to 5 entries becomes one dense, normalized vector: the
//! newest entry's 15 features, the per-feature window means, and the
//! per-feature window standard deviations. NaN values are replaced by the
//! window mean (or the training mean when a feature is missing from the
//! whole window) before the standard deviations are computed; the
//! classifier contract assumes a fully populated vector.

use std::collections::VecDeque;

use crate::scorer::stats::{StatsEntry, NUM_FEATURES_PER_ENTRY};

/// Length of the final feature vector: last entry + means + stds.
pub const FEATURE_VECTOR_LEN: usize = 3 * NUM_FEATURES_PER_ENTRY;

/// Training-time normalization parameters, loaded with the model and
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    means: Vec<f64>,
    stds: Vec<f64>,
}

impl Normalization {
    pub fn new(means: Vec<f64>, stds: Vec<f64>) -> Self {
        debug_assert_eq!(means.len(), FEATURE_VECTOR_LEN);
        debug_assert_eq!(stds.len(), FEATURE_VECTOR_LEN);
        Self { means, stds }
    }

    pub fn means(&self) -> &[f64] {
        &self.means
    }

    pub fn stds(&self) -> &[f64] {
        &self.stds
    }

    /// Training mean of the CCA busy ratio feature.
    pub fn mean_cca_busy_ratio(&self) -> f64 {
        self.means[3]
    }
}

/// Transform a window of entries into the normalized feature vector.
pub fn extract_features(window: &VecDeque<StatsEntry>, norm: &Normalization) -> Vec<f64> {
    let mut data: Vec<[f64; NUM_FEATURES_PER_ENTRY]> =
        window.iter().map(StatsEntry::features_as_array).collect();

    let means = compute_means(&data, norm);
    replace_nans(&mut data, &means);
    let stds = compute_stds(&data, &means);

    let mut features = vec![0.0; FEATURE_VECTOR_LEN];
    let newest = &data[data.len() - 1];
    for i in 0..NUM_FEATURES_PER_ENTRY {
        features[i] = newest[i];
        features[i + NUM_FEATURES_PER_ENTRY] = means[i];
        features[i + 2 * NUM_FEATURES_PER_ENTRY] = stds[i];
    }
    normalize(&features, norm)
}

/// Per-feature means over the window, ignoring NaN entries. A feature that
/// is NaN across the whole window falls back to its training mean.
fn compute_means(
    data: &[[f64; NUM_FEATURES_PER_ENTRY]],
    norm: &Normalization,
) -> [f64; NUM_FEATURES_PER_ENTRY] {
    let mut means = [0.0; NUM_FEATURES_PER_ENTRY];
    for (feature_idx, mean) in means.iter_mut().enumerate() {
        let mut count = 0usize;
        for entry in data {
            if !entry[feature_idx].is_nan() {
                *mean += entry[feature_idx];
                count += 1;
            }
        }
        if count > 0 {
            *mean /= count as f64;
        } else {
            *mean = norm.means()[feature_idx];
        }
    }
    means
}

fn compute_stds(
    data: &[[f64; NUM_FEATURES_PER_ENTRY]],
    means: &[f64; NUM_FEATURES_PER_ENTRY],
) -> [f64; NUM_FEATURES_PER_ENTRY] {
    let mut stds = [0.0; NUM_FEATURES_PER_ENTRY];
    for (feature_idx, std) in stds.iter_mut().enumerate() {
        for entry in data {
            let diff = entry[feature_idx] - means[feature_idx];
            *std += diff * diff;
        }
        *std /= data.len() as f64;
        *std = std.sqrt();
    }
    stds
}

fn replace_nans(data: &mut [[f64; NUM_FEATURES_PER_ENTRY]], means: &[f64; NUM_FEATURES_PER_ENTRY]) {
    for entry in data {
        for (feature_idx, value) in entry.iter_mut().enumerate() {
            if value.is_nan() {
                *value = means[feature_idx];
            }
        }
    }
}

fn normalize(data: &[f64], norm: &Normalization) -> Vec<f64> {
    data.iter()
        .zip(norm.means().iter().zip(norm.stds().iter()))
        .map(|(value, (mean, std))| (value - mean) / std)
        .collect()
}
