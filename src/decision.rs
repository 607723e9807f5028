//! 推論結果の最終判定
//!
//! クラス分布（多クラス分類）と照合結果（最近傍照合）のどちらからも、
//! 同じ形の (ラベル, 信頼度) を作ります。

use serde::Serialize;

use crate::matching::{MatchResult, UNKNOWN_LABEL};
use crate::types::ClassDistribution;

/// 最終判定
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    /// [0, 1]
    pub confidence: f32,
    /// 照合モードのときの最近傍距離
    pub distance: Option<f32>,
}

impl Prediction {
    pub fn is_unknown(&self) -> bool {
        self.label == UNKNOWN_LABEL
    }
}

pub trait Decide {
    fn decide(&self) -> Prediction;
}

impl Decide for ClassDistribution {
    /// 最大確率のラベル（同値なら小さいクラスインデックス）
    fn decide(&self) -> Prediction {
        match self.argmax().and_then(|i| self.entry(i)) {
            Some((label, probability)) => Prediction {
                label: label.to_string(),
                confidence: probability.clamp(0.0, 1.0),
                distance: None,
            },
            // 空の分布は構築できない
            None => Prediction {
                label: UNKNOWN_LABEL.to_string(),
                confidence: 0.0,
                distance: None,
            },
        }
    }
}

impl Decide for MatchResult {
    /// 受理時の信頼度は 1 - 距離/受理半径
    fn decide(&self) -> Prediction {
        if self.accepted {
            let normalized = self.distance / self.acceptance_radius;
            Prediction {
                label: self.label.clone(),
                confidence: (1.0 - normalized).clamp(0.0, 1.0),
                distance: Some(self.distance),
            }
        } else {
            Prediction {
                label: UNKNOWN_LABEL.to_string(),
                confidence: 0.0,
                distance: Some(self.distance),
            }
        }
    }
}
