use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, VisionError};

/// ClassDistribution の合計値に許す誤差
pub const DISTRIBUTION_TOLERANCE: f32 = 1e-3;

/// 熟度ラベルの既定値（クラスインデックス順）
pub const RIPENESS_LABELS: [&str; 4] = ["Unripe", "Semi-ripe", "Ripe", "Overripe"];

/// バックボーンが出力する固定長の特徴ベクトル
///
/// 生成後は変更しません。
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Array1<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values: Array1::from_vec(values),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        // Array1::from_vec は常に連続メモリ
        self.values.as_slice().unwrap_or(&[])
    }

    pub fn as_array(&self) -> &Array1<f32> {
        &self.values
    }

    /// ユークリッド距離。長さが異なる場合は ShapeMismatch
    pub fn euclidean_distance(&self, other: &FeatureVector) -> Result<f32> {
        if self.len() != other.len() {
            return Err(VisionError::ShapeMismatch(format!(
                "feature length {} does not match {}",
                self.len(),
                other.len()
            )));
        }
        let diff = &self.values - &other.values;
        Ok(diff.mapv(|x| x * x).sum().sqrt())
    }
}

impl From<Array1<f32>> for FeatureVector {
    fn from(values: Array1<f32>) -> Self {
        Self { values }
    }
}

/// 画像パスとクラスラベルの組
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledSample {
    pub path: PathBuf,
    pub label: String,
}

impl LabeledSample {
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
        }
    }
}

/// 順序付きのクラスラベル集合
///
/// インデックスはヘッド出力の列番号と一致します。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<String>,
}

impl LabelSet {
    /// ラベル一覧から作成（空、空文字、重複は ConfigurationError）
    pub fn new<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Result<Self> {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();

        if labels.is_empty() {
            return Err(VisionError::Configuration("label set cannot be empty".into()));
        }
        if let Some(pos) = labels.iter().position(|l| l.trim().is_empty()) {
            return Err(VisionError::Configuration(format!(
                "label {} is empty",
                pos
            )));
        }
        for (i, label) in labels.iter().enumerate() {
            if labels[..i].contains(label) {
                return Err(VisionError::Configuration(format!(
                    "duplicate label '{}'",
                    label
                )));
            }
        }

        Ok(Self { labels })
    }

    /// Unripe / Semi-ripe / Ripe / Overripe
    pub fn ripeness() -> Self {
        Self {
            labels: RIPENESS_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index_of(label).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.labels
    }
}

/// クラスごとの確率（クラスインデックス順、合計1）
///
/// 推論1回ごとに生成され、すぐに消費されます。
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDistribution {
    entries: Vec<(String, f32)>,
}

impl ClassDistribution {
    /// 確率の列から作成
    ///
    /// 長さがラベル数と異なれば ShapeMismatch、[0,1] を外れる値や
    /// 合計が1から離れている場合は InvalidDistribution になります。
    pub fn from_probabilities(labels: &LabelSet, probabilities: &[f32]) -> Result<Self> {
        if probabilities.len() != labels.len() {
            return Err(VisionError::ShapeMismatch(format!(
                "{} probabilities for {} classes",
                probabilities.len(),
                labels.len()
            )));
        }
        if let Some(p) = probabilities
            .iter()
            .find(|p| !p.is_finite() || **p < 0.0 || **p > 1.0)
        {
            return Err(VisionError::InvalidDistribution(format!(
                "probability {} outside [0, 1]",
                p
            )));
        }
        let sum: f32 = probabilities.iter().sum();
        if (sum - 1.0).abs() > DISTRIBUTION_TOLERANCE {
            return Err(VisionError::InvalidDistribution(format!(
                "probabilities sum to {}",
                sum
            )));
        }

        Ok(Self {
            entries: labels
                .iter()
                .map(str::to_string)
                .zip(probabilities.iter().copied())
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn probability(&self, label: &str) -> Option<f32> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, p)| *p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.entries.iter().map(|(l, p)| (l.as_str(), *p))
    }

    /// 最大確率のインデックス。同値の場合は小さいインデックスを優先
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (i, (_, p)) in self.entries.iter().enumerate() {
            match best {
                Some((_, best_p)) if *p <= best_p => {}
                _ => best = Some((i, *p)),
            }
        }
        best.map(|(i, _)| i)
    }

    pub(crate) fn entry(&self, index: usize) -> Option<(&str, f32)> {
        self.entries.get(index).map(|(l, p)| (l.as_str(), *p))
    }
}
