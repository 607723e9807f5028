//! モデルメタデータの定義
//!
//! アーティファクト内の metadata.json に保存され、推論時の整合性チェックに使われます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backbone::BackboneKind;
use crate::types::LabelSet;

/// モデルメタデータ
///
/// 分類ヘッドはバックボーンの出力次元とラベル数に依存するため、
/// 読み込み時に両方を照合できるよう記録しておきます。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラスラベル（ヘッド出力の列順）
    pub labels: Vec<String>,

    /// 学習に使ったバックボーン
    pub backbone: BackboneKind,

    /// 特徴ベクトルの長さ（ヘッド入力次元）
    pub feature_len: usize,

    /// 中間層のユニット数
    pub hidden_size: usize,

    /// バックボーン入力サイズ（正方形）
    pub input_size: u32,

    /// 画素値を [0, 1] に縮めて学習したか
    #[serde(default = "default_rescale")]
    pub rescale: bool,

    /// 学習エポック数
    pub num_epochs: u32,

    /// 最終エポックの検証精度
    #[serde(default)]
    pub final_val_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

fn default_rescale() -> bool {
    true
}

impl ModelMetadata {
    /// 新しいメタデータを作成（学習時刻は現在時刻）
    pub fn new(
        labels: &LabelSet,
        backbone: BackboneKind,
        feature_len: usize,
        hidden_size: usize,
        rescale: bool,
        num_epochs: u32,
        final_val_accuracy: Option<f64>,
    ) -> Self {
        Self {
            labels: labels.as_slice().to_vec(),
            backbone,
            feature_len,
            hidden_size,
            input_size: backbone.input_size(),
            rescale,
            num_epochs,
            final_val_accuracy,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn class_count(&self) -> usize {
        self.labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
