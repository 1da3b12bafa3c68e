use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

pub trait Classifier: Send + Sync {
    fn predict_proba(&self, row: &[f64]) -> Result<f64>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierArtifact {
    Logistic(LogisticModel),
    GradientBoostedTrees(TreeEnsemble),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    #[serde(default)]
    pub feature_names: Vec<String>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    #[serde(default)]
    pub feature_means: Vec<f64>,
    #[serde(default)]
    pub feature_scales: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEnsemble {
    #[serde(default)]
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub base_margin: f64,
    pub trees: Vec<RegressionTree>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionTree {
    pub nodes: Vec<TreeNode>,
}

/// Node 0 is the root. Rows with `x < threshold` go left.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        #[serde(default)]
        missing_left: bool,
    },
    Leaf {
        leaf: f64,
    },
}

impl ClassifierArtifact {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read classifier artifact {}", path.display()))?;
        serde_json::from_str::<ClassifierArtifact>(&raw)
            .with_context(|| format!("parse classifier artifact {}", path.display()))
    }

    /// Checks the artifact was trained against `schema` (same width and, when
    /// the artifact records names, the same order).
    pub fn validate(&self, schema: &[String]) -> Result<()> {
        match self {
            ClassifierArtifact::Logistic(m) => m.validate(schema),
            ClassifierArtifact::GradientBoostedTrees(m) => m.validate(schema),
        }
    }
}

impl Classifier for ClassifierArtifact {
    fn predict_proba(&self, row: &[f64]) -> Result<f64> {
        match self {
            ClassifierArtifact::Logistic(m) => m.predict_proba(row),
            ClassifierArtifact::GradientBoostedTrees(m) => m.predict_proba(row),
        }
    }
}

impl LogisticModel {
    fn validate(&self, schema: &[String]) -> Result<()> {
        check_names(&self.feature_names, schema)?;
        let n = schema.len();
        if self.coefficients.len() != n {
            bail!(
                "logistic model has {} coefficients, schema has {} features",
                self.coefficients.len(),
                n
            );
        }
        if !self.feature_means.is_empty() && self.feature_means.len() != n {
            bail!("feature_means length {} != {}", self.feature_means.len(), n);
        }
        if !self.feature_scales.is_empty() {
            if self.feature_scales.len() != n {
                bail!("feature_scales length {} != {}", self.feature_scales.len(), n);
            }
            if let Some(idx) = self.feature_scales.iter().position(|s| *s == 0.0) {
                bail!("feature_scales[{idx}] is zero");
            }
        }
        Ok(())
    }
}

impl Classifier for LogisticModel {
    fn predict_proba(&self, row: &[f64]) -> Result<f64> {
        if row.len() != self.coefficients.len() {
            bail!(
                "row has {} values, model expects {}",
                row.len(),
                self.coefficients.len()
            );
        }
        let mut z = self.intercept;
        for (idx, (x, c)) in row.iter().zip(&self.coefficients).enumerate() {
            let mean = self.feature_means.get(idx).copied().unwrap_or(0.0);
            let scale = self.feature_scales.get(idx).copied().unwrap_or(1.0);
            z += c * (x - mean) / scale;
        }
        finite_probability(sigmoid(z))
    }
}

impl TreeEnsemble {
    fn validate(&self, schema: &[String]) -> Result<()> {
        check_names(&self.feature_names, schema)?;
        if self.trees.is_empty() {
            bail!("tree ensemble has no trees");
        }
        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                bail!("tree {t} has no nodes");
            }
            for (idx, node) in tree.nodes.iter().enumerate() {
                if let TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } = node
                {
                    if *feature >= schema.len() {
                        bail!("tree {t} node {idx} splits on feature {feature} outside schema");
                    }
                    // Children must come after their parent, which rules out cycles.
                    for child in [*left, *right] {
                        if child <= idx || child >= tree.nodes.len() {
                            bail!("tree {t} node {idx} has invalid child {child}");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Classifier for TreeEnsemble {
    fn predict_proba(&self, row: &[f64]) -> Result<f64> {
        let mut margin = self.base_margin;
        for tree in &self.trees {
            margin += tree.evaluate(row)?;
        }
        finite_probability(sigmoid(margin))
    }
}

impl RegressionTree {
    fn evaluate(&self, row: &[f64]) -> Result<f64> {
        let mut idx = 0usize;
        for _ in 0..self.nodes.len() {
            match self.nodes.get(idx) {
                Some(TreeNode::Leaf { leaf }) => return Ok(*leaf),
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    missing_left,
                }) => {
                    let x = *row
                        .get(*feature)
                        .ok_or_else(|| anyhow!("row has no feature index {feature}"))?;
                    idx = if x.is_nan() {
                        if *missing_left { *left } else { *right }
                    } else if x < *threshold {
                        *left
                    } else {
                        *right
                    };
                }
                None => bail!("tree walked to missing node {idx}"),
            }
        }
        Err(anyhow!("tree did not reach a leaf"))
    }
}

fn check_names(names: &[String], schema: &[String]) -> Result<()> {
    if names.is_empty() || names == schema {
        return Ok(());
    }
    let first_diff = names
        .iter()
        .zip(schema)
        .position(|(a, b)| a != b)
        .unwrap_or(names.len().min(schema.len()));
    bail!(
        "artifact feature names differ from schema at position {first_diff} ({} vs {} features)",
        names.len(),
        schema.len()
    )
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn finite_probability(p: f64) -> Result<f64> {
    if p.is_finite() {
        Ok(p.clamp(0.0, 1.0))
    } else {
        Err(anyhow!("classifier produced a non-finite probability"))
    }
}
