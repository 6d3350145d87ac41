//! Random-forest usability classifier
//!
//! The model is a packaged JSON resource: a list of decision trees plus the
//! training-time normalization means and standard deviations, ordered to
//! match the feature-vector layout. It is loaded once, validated, and never
//! mutated afterwards, so classifiers are safe to share across threads.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::scorer::features::{extract_features, Normalization, FEATURE_VECTOR_LEN};
use crate::scorer::stats::StatsEntry;

pub const RANDOM_FOREST_MODEL_ID: u32 = 7;
pub const LOGISTIC_REGRESSION_MODEL_ID: u32 = 1;

const ROOT_NODE: usize = 0;
/// Child index marking a leaf.
const NONEXISTENT_NODE: i32 = -1;

/// One tree node: either a split (both children set) or a leaf (both -1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub split_feature: usize,
    pub split_threshold: f64,
    pub left_child: i32,
    pub right_child: i32,
    pub positive_probability: f64,
}

impl TreeNode {
    /// Leaf with the given probability of imminent degradation.
    pub fn leaf(positive_probability: f64) -> Self {
        Self {
            split_feature: 0,
            split_threshold: 0.0,
            left_child: NONEXISTENT_NODE,
            right_child: NONEXISTENT_NODE,
            positive_probability,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTreeModel {
    pub nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForestModel {
    pub decision_trees: Vec<DecisionTreeModel>,
    pub feature_norm_means: Vec<f64>,
    pub feature_norm_stds: Vec<f64>,
}

impl RandomForestModel {
    /// Load and validate a model resource. Failure yields `None`; the caller
    /// treats the model as unavailable.
    pub fn load(path: &Path) -> Option<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                error!(path = %path.display(), "could not open model resource: {e}");
                return None;
            }
        };
        Self::from_reader(file)
    }

    pub fn from_reader(reader: impl Read) -> Option<Self> {
        let model: Self = match serde_json::from_reader(reader) {
            Ok(model) => model,
            Err(e) => {
                error!("could not parse model resource: {e}");
                return None;
            }
        };
        if let Err(reason) = model.validate() {
            error!(%reason, "model resource failed validation");
            return None;
        }
        Some(model)
    }

    /// Structural invariants: a non-empty forest of well-formed trees
    /// (every non-leaf has exactly two in-range children, every path ends
    /// in a leaf) and normalization vectors matching the feature layout.
    pub fn validate(&self) -> Result<(), String> {
        if self.decision_trees.is_empty() {
            return Err("model contains no trees".to_string());
        }
        if self.feature_norm_means.len() != FEATURE_VECTOR_LEN
            || self.feature_norm_stds.len() != FEATURE_VECTOR_LEN
        {
            return Err(format!(
                "normalization vectors must have {FEATURE_VECTOR_LEN} entries, got {} / {}",
                self.feature_norm_means.len(),
                self.feature_norm_stds.len()
            ));
        }
        for (tree_idx, tree) in self.decision_trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(format!("tree {tree_idx} has no nodes"));
            }
            let node_count = tree.nodes.len() as i32;
            for (node_idx, node) in tree.nodes.iter().enumerate() {
                let is_leaf = node.left_child == NONEXISTENT_NODE;
                if is_leaf {
                    if node.right_child != NONEXISTENT_NODE {
                        return Err(format!(
                            "tree {tree_idx} node {node_idx} is half-leaf"
                        ));
                    }
                } else {
                    if node.right_child == NONEXISTENT_NODE {
                        return Err(format!(
                            "tree {tree_idx} node {node_idx} is half-leaf"
                        ));
                    }
                    if node.left_child < 0
                        || node.left_child >= node_count
                        || node.right_child < 0
                        || node.right_child >= node_count
                    {
                        return Err(format!(
                            "tree {tree_idx} node {node_idx} has out-of-range children"
                        ));
                    }
                    if node.split_feature >= FEATURE_VECTOR_LEN {
                        return Err(format!(
                            "tree {tree_idx} node {node_idx} splits on feature {}",
                            node.split_feature
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn normalization(&self) -> Normalization {
        Normalization::new(
            self.feature_norm_means.clone(),
            self.feature_norm_stds.clone(),
        )
    }
}

/// Walks one decision tree over a dense feature vector.
pub struct DecisionTreeClassifier {
    params: DecisionTreeModel,
}

impl DecisionTreeClassifier {
    pub fn new(params: DecisionTreeModel) -> Self {
        Self { params }
    }

    pub fn predict_probability(&self, features: &[f64]) -> f64 {
        let mut node = &self.params.nodes[ROOT_NODE];
        loop {
            if node.left_child == NONEXISTENT_NODE {
                return node.positive_probability;
            }
            node = if features[node.split_feature] <= node.split_threshold {
                &self.params.nodes[node.left_child as usize]
            } else {
                &self.params.nodes[node.right_child as usize]
            };
        }
    }
}

/// A usability model: turns a window of statistics entries into a score.
pub trait UsabilityClassifier: Send + Sync {
    /// Score in [0, 100], higher meaning more usable.
    fn calculate_score(&self, window: &VecDeque<StatsEntry>) -> f64;
    fn model_id(&self) -> u32;
    fn normalization(&self) -> &Normalization;
}

/// Ensemble of decision trees voting on the probability of an imminent
/// usability degradation.
pub struct RandomForestClassifier {
    trees: Vec<DecisionTreeClassifier>,
    normalization: Normalization,
}

impl RandomForestClassifier {
    pub fn new(model: RandomForestModel) -> Self {
        let normalization = model.normalization();
        let trees = model
            .decision_trees
            .into_iter()
            .map(DecisionTreeClassifier::new)
            .collect();
        Self {
            trees,
            normalization,
        }
    }

    fn predict_probability(&self, features: &[f64]) -> f64 {
        let sum: f64 = self
            .trees
            .iter()
            .map(|tree| tree.predict_probability(features))
            .sum();
        sum / self.trees.len() as f64
    }
}

impl UsabilityClassifier for RandomForestClassifier {
    /// The ensemble estimates the probability of degradation; the exposed
    /// score is its complement scaled to 0-100.
    fn calculate_score(&self, window: &VecDeque<StatsEntry>) -> f64 {
        let features = extract_features(window, &self.normalization);
        100.0 * (1.0 - self.predict_probability(&features))
    }

    fn model_id(&self) -> u32 {
        RANDOM_FOREST_MODEL_ID
    }

    fn normalization(&self) -> &Normalization {
        &self.normalization
    }
}

/// Dispatch on model id. Unknown ids and load failures yield `None`; the
/// caller falls back to running without a score.
pub fn classifier_for_model(model_id: u32, model_path: &Path) -> Option<Box<dyn UsabilityClassifier>> {
    match model_id {
        RANDOM_FOREST_MODEL_ID => RandomForestModel::load(model_path)
            .map(|model| Box::new(RandomForestClassifier::new(model)) as Box<dyn UsabilityClassifier>),
        other => {
            error!(model_id = other, "no classifier available for model id");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::stats::LinkStats;

    fn single_leaf_model(probability: f64) -> RandomForestModel {
        RandomForestModel {
            decision_trees: vec![DecisionTreeModel {
                nodes: vec![TreeNode::leaf(probability)],
            }],
            feature_norm_means: vec![0.0; FEATURE_VECTOR_LEN],
            feature_norm_stds: vec![1.0; FEATURE_VECTOR_LEN],
        }
    }

    fn split_tree() -> DecisionTreeModel {
        // Root splits on feature 2 at 0.0: left leaf 0.1, right leaf 0.9
        DecisionTreeModel {
            nodes: vec![
                TreeNode {
                    split_feature: 2,
                    split_threshold: 0.0,
                    left_child: 1,
                    right_child: 2,
                    positive_probability: 0.0,
                },
                TreeNode::leaf(0.1),
                TreeNode::leaf(0.9),
            ],
        }
    }

    #[test]
    fn test_tree_walk() {
        let tree = DecisionTreeClassifier::new(split_tree());
        let mut features = vec![0.0; FEATURE_VECTOR_LEN];
        features[2] = -1.0;
        assert_eq!(tree.predict_probability(&features), 0.1);
        features[2] = 1.0;
        assert_eq!(tree.predict_probability(&features), 0.9);
    }

    #[test]
    fn test_single_leaf_forest_score() {
        let classifier = RandomForestClassifier::new(single_leaf_model(0.2));
        let mut window = VecDeque::new();
        window.push_back(StatsEntry::new(LinkStats::default()));
        // Any input maps to 100 * (1 - 0.2)
        assert!((classifier.calculate_score(&window) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_forest_averages_trees() {
        let model = RandomForestModel {
            decision_trees: vec![
                DecisionTreeModel {
                    nodes: vec![TreeNode::leaf(0.2)],
                },
                DecisionTreeModel {
                    nodes: vec![TreeNode::leaf(0.6)],
                },
            ],
            feature_norm_means: vec![0.0; FEATURE_VECTOR_LEN],
            feature_norm_stds: vec![1.0; FEATURE_VECTOR_LEN],
        };
        let classifier = RandomForestClassifier::new(model);
        assert!((classifier.predict_probability(&vec![0.0; FEATURE_VECTOR_LEN]) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_out_of_range_children() {
        let mut model = single_leaf_model(0.5);
        model.decision_trees[0].nodes[0].left_child = 5;
        model.decision_trees[0].nodes[0].right_child = 6;
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_half_leaf() {
        let mut model = single_leaf_model(0.5);
        model.decision_trees[0].nodes[0].right_child = 0;
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_norm_length() {
        let mut model = single_leaf_model(0.5);
        model.feature_norm_means.pop();
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let model = single_leaf_model(0.25);
        let json = serde_json::to_string(&model).unwrap();
        let loaded = RandomForestModel::from_reader(json.as_bytes()).unwrap();
        assert_eq!(loaded, model);
    }

    #[test]
    fn test_corrupt_resource_is_unavailable() {
        assert!(RandomForestModel::from_reader("not json".as_bytes()).is_none());
        assert!(RandomForestModel::load(Path::new("/nonexistent/model.json")).is_none());
    }

    #[test]
    fn test_unknown_model_id() {
        assert!(classifier_for_model(42, Path::new("/nonexistent")).is_none());
    }
}
