//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、バックボーン、学習・照合のパラメータをJSON形式で保存・読み込みします。

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::backbone::{BackboneKind, TensorLayout};
use crate::error::VisionError;
use crate::types::{LabelSet, RIPENESS_LABELS};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// バックボーン設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneSettings {
    /// 使用するバックボーン
    pub kind: BackboneKind,
    /// ONNXファイルのパス
    pub model_path: String,
    /// 入力テンソルの軸順
    #[serde(default)]
    pub layout: TensorLayout,
    /// ONNX Runtime のスレッド数（0は自動）
    #[serde(default)]
    pub intra_threads: usize,
}

impl Default for BackboneSettings {
    fn default() -> Self {
        Self {
            kind: BackboneKind::Vgg19,
            model_path: "models/vgg19_notop.onnx".to_string(),
            layout: TensorLayout::Nchw,
            intra_threads: 0,
        }
    }
}

/// 分類ヘッド設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 使用するモデルファイルのパス
    pub model_path: String,
    /// クラスラベル（出力の列順）
    pub labels: Vec<String>,
    /// 分類クラス数
    pub class_count: usize,
    /// 中間層のユニット数
    pub hidden_size: usize,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "models/coffee_ripeness.tar.gz".to_string(),
            labels: RIPENESS_LABELS.iter().map(|s| s.to_string()).collect(),
            class_count: RIPENESS_LABELS.len(),
            hidden_size: 512,
            dropout: 0.5,
        }
    }
}

/// 最適化手法
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum OptimizerKind {
    /// モーメンタム付きSGD
    #[default]
    Sgd,
    Adam,
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// モーメンタム（SGDのみ）
    pub momentum: f64,
    /// 最適化手法
    #[serde(default)]
    pub optimizer: OptimizerKind,
    /// ランダムシード
    pub seed: u64,
    /// トレーニングデータの割合
    pub train_ratio: f32,
    /// 1エポックあたりのステップ数の上限
    #[serde(default)]
    pub steps_per_epoch: Option<usize>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 32,
            learning_rate: 1e-4,
            momentum: 0.9,
            optimizer: OptimizerKind::Sgd,
            seed: 42,
            train_ratio: 0.8,
            steps_per_epoch: None,
        }
    }
}

/// 学習時のデータ拡張設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationSettings {
    /// 回転範囲（度）
    pub rotation_range: f32,
    /// ズーム範囲（0.2 なら 0.8〜1.2倍）
    pub zoom_range: f32,
    /// せん断範囲（度）
    pub shear_range: f32,
    /// 左右反転
    pub horizontal_flip: bool,
    /// 画素値を [0, 1] に縮める
    pub rescale: bool,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rotation_range: 20.0,
            zoom_range: 0.2,
            shear_range: 0.2,
            horizontal_flip: true,
            rescale: true,
        }
    }
}

/// 顔照合の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingSettings {
    /// 受理半径（ユークリッド距離）
    pub acceptance_radius: f32,
    /// 登録済み画像のフォルダ
    pub gallery_dir: String,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            acceptance_radius: 0.6,
            gallery_dir: "gallery".to_string(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// バックボーン設定
    #[serde(default)]
    pub backbone: BackboneSettings,
    /// 分類ヘッド設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データ拡張設定
    #[serde(default)]
    pub augmentation: AugmentationSettings,
    /// 照合設定
    #[serde(default)]
    pub matching: MatchingSettings,
    /// 学習データの出力先（<root>/train, <root>/validation）
    #[serde(default = "default_dataset_root")]
    pub dataset_root: String,
}

fn default_dataset_root() -> String {
    "dataset".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            backbone: BackboneSettings::default(),
            model: ModelSettings::default(),
            training: TrainingSettings::default(),
            augmentation: AugmentationSettings::default(),
            matching: MatchingSettings::default(),
            dataset_root: default_dataset_root(),
        }
    }
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// ラベル集合を作成
    pub fn label_set(&self) -> crate::error::Result<LabelSet> {
        LabelSet::new(self.model.labels.iter().cloned())
    }

    /// 設定値を検証する（不正な値は ConfigurationError）
    pub fn validate(&self) -> crate::error::Result<()> {
        let labels = self.label_set()?;
        if labels.len() != self.model.class_count {
            return Err(config_error(format!(
                "class_count is {} but {} labels are configured",
                self.model.class_count,
                labels.len()
            )));
        }
        if self.model.hidden_size == 0 {
            return Err(config_error("hidden_size must be positive"));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(config_error(format!(
                "dropout {} must be in [0, 1)",
                self.model.dropout
            )));
        }

        let training = &self.training;
        if !(training.train_ratio > 0.0 && training.train_ratio < 1.0) {
            return Err(config_error(format!(
                "train_ratio {} must be in (0, 1)",
                training.train_ratio
            )));
        }
        if training.batch_size == 0 {
            return Err(config_error("batch_size must be positive"));
        }
        if !(training.learning_rate.is_finite() && training.learning_rate > 0.0) {
            return Err(config_error(format!(
                "learning_rate {} must be positive",
                training.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&training.momentum) {
            return Err(config_error(format!(
                "momentum {} must be in [0, 1)",
                training.momentum
            )));
        }
        if training.steps_per_epoch == Some(0) {
            return Err(config_error("steps_per_epoch must be positive when set"));
        }

        let aug = &self.augmentation;
        if !(aug.rotation_range >= 0.0 && aug.shear_range >= 0.0 && aug.zoom_range >= 0.0) {
            return Err(config_error("augmentation ranges must be non-negative"));
        }
        if aug.zoom_range >= 1.0 {
            return Err(config_error(format!(
                "zoom_range {} must be below 1",
                aug.zoom_range
            )));
        }

        let radius = self.matching.acceptance_radius;
        if !(radius.is_finite() && radius > 0.0) {
            return Err(config_error(format!(
                "acceptance_radius {} must be a positive number",
                radius
            )));
        }

        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("バックボーン: {} ({})", self.backbone.kind, self.backbone.model_path);
        println!("モデルパス: {}", self.model.model_path);
        println!("クラス: {}", self.model.labels.join(", "));
        println!("ドロップアウト率: {}", self.model.dropout);
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("最適化手法: {:?}", self.training.optimizer);
        println!("分割比率: {}", self.training.train_ratio);
        println!("\n--- 照合設定 ---");
        println!("受理半径: {}", self.matching.acceptance_radius);
        println!("ギャラリー: {}", self.matching.gallery_dir);
        println!("========================\n");
    }
}

fn config_error(message: impl Into<String>) -> VisionError {
    VisionError::Configuration(message.into())
}
