//! エラー定義
//!
//! 判定コア全体で共有するエラー型です。どのエラーも呼び出し元へ同期的に返され、
//! 内部でリトライすることはありません。

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    /// 画像を読み込めない、またはサイズが0
    #[error("Invalid image {path}: {reason}")]
    InvalidImage { path: String, reason: String },

    /// モデルアーティファクトと設定の形状が一致しない
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// 宣言されたクラスにサンプルが1枚もない
    #[error("Class '{0}' has no samples")]
    EmptyClass(String),

    /// バッチを構成できない
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// 設定値が不正（空のギャラリー、範囲外の値など）
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 確率分布として成立していない
    #[error("Invalid class distribution: {0}")]
    InvalidDistribution(String),

    /// バックボーン（ONNX Runtime）の実行エラー
    #[error("Backbone error: {0}")]
    Backbone(String),

    /// モデルアーティファクトの読み書きエラー
    #[error("Model artifact error: {0}")]
    Artifact(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VisionError {
    pub fn invalid_image(path: &Path, reason: impl ToString) -> Self {
        VisionError::InvalidImage {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<ort::Error> for VisionError {
    fn from(err: ort::Error) -> Self {
        VisionError::Backbone(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VisionError>;
