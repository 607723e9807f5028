//! 学習済みヘッドによる推論

use burn::tensor::{backend::Backend, Tensor};
use image::DynamicImage;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backbone::{load_image, FeatureExtractor};
use crate::decision::{Decide, Prediction};
use crate::error::{Result, VisionError};
use crate::ml::ml_model::{head_from_bytes, ClassificationHead, HeadConfig};
use crate::model::{load_model_with_metadata, ModelMetadata};
use crate::types::{ClassDistribution, FeatureVector, LabelSet};

/// 推論エンジン
///
/// 読み込み後の重みは変更しないため、複数の呼び出し元から共有できます。
pub struct InferenceEngine<B: Backend> {
    head: ClassificationHead<B>,
    labels: LabelSet,
    extractor: Arc<dyn FeatureExtractor>,
    metadata: Option<ModelMetadata>,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// アーティファクトを読み込んで推論エンジンを初期化
    ///
    /// アーティファクトのクラス数がラベル集合と異なる場合、特徴次元や
    /// バックボーンの種類が抽出器と異なる場合は ShapeMismatch です。
    /// リスケール設定が学習時と異なる場合は Configuration です。
    pub fn load(
        model_path: &Path,
        labels: &LabelSet,
        extractor: Arc<dyn FeatureExtractor>,
        device: B::Device,
    ) -> Result<Self> {
        let (metadata, binary) = load_model_with_metadata(model_path)
            .map_err(|e| VisionError::Artifact(format!("{:#}", e)))?;

        if metadata.class_count() != labels.len() {
            return Err(VisionError::ShapeMismatch(format!(
                "artifact was trained for {} classes, {} labels are configured",
                metadata.class_count(),
                labels.len()
            )));
        }
        if metadata.feature_len != extractor.feature_len() {
            return Err(VisionError::ShapeMismatch(format!(
                "artifact expects {} features ({}), backbone produces {}",
                metadata.feature_len,
                metadata.backbone,
                extractor.feature_len()
            )));
        }
        if let Some(kind) = extractor.backbone() {
            if kind != metadata.backbone {
                return Err(VisionError::ShapeMismatch(format!(
                    "artifact was trained on {}, extractor is {}",
                    metadata.backbone, kind
                )));
            }
        }
        if let Some(rescale) = extractor.rescale() {
            if rescale != metadata.rescale {
                return Err(VisionError::Configuration(format!(
                    "artifact was trained with rescale={}, extractor uses rescale={}",
                    metadata.rescale, rescale
                )));
            }
        }
        if metadata.labels.as_slice() != labels.as_slice() {
            warn!(
                "ラベル名が学習時と異なります: 学習時 [{}], 設定 [{}]",
                metadata.labels.join(", "),
                labels.as_slice().join(", ")
            );
        }

        let config = HeadConfig::new(metadata.feature_len, metadata.class_count())
            .with_hidden_size(metadata.hidden_size)
            .with_dropout(0.0);
        let head = head_from_bytes::<B>(binary, &config, &device)?;

        info!(
            "モデルを読み込みました: {} ({} クラス, {})",
            model_path.display(),
            labels.len(),
            metadata.backbone
        );

        Ok(Self {
            head,
            labels: labels.clone(),
            extractor,
            metadata: Some(metadata),
            device,
        })
    }

    /// 学習直後のヘッドから作成
    pub fn from_head(
        head: ClassificationHead<B>,
        labels: LabelSet,
        extractor: Arc<dyn FeatureExtractor>,
        device: B::Device,
    ) -> Result<Self> {
        if head.num_classes() != labels.len() {
            return Err(VisionError::ShapeMismatch(format!(
                "head has {} classes, {} labels are configured",
                head.num_classes(),
                labels.len()
            )));
        }
        if head.feature_len() != extractor.feature_len() {
            return Err(VisionError::ShapeMismatch(format!(
                "head expects {} features, backbone produces {}",
                head.feature_len(),
                extractor.feature_len()
            )));
        }
        Ok(Self {
            head,
            labels,
            extractor,
            metadata: None,
            device,
        })
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn metadata(&self) -> Option<&ModelMetadata> {
        self.metadata.as_ref()
    }

    /// 特徴ベクトルからクラス分布を求める
    pub fn distribution(&self, features: &FeatureVector) -> Result<ClassDistribution> {
        if features.len() != self.head.feature_len() {
            return Err(VisionError::ShapeMismatch(format!(
                "feature length {} does not match head input {}",
                features.len(),
                self.head.feature_len()
            )));
        }

        let input = Tensor::<B, 1>::from_floats(features.as_slice(), &self.device)
            .reshape([1, features.len()]);
        let probabilities: Vec<f32> = self
            .head
            .forward_distribution(input)
            .into_data()
            .iter::<f32>()
            .collect();

        ClassDistribution::from_probabilities(&self.labels, &probabilities)
    }

    /// 単一画像を分類
    pub fn classify(&self, image: &DynamicImage) -> Result<Prediction> {
        let features = self.extractor.extract(image)?;
        Ok(self.distribution(&features)?.decide())
    }

    pub fn classify_path(&self, path: &Path) -> Result<Prediction> {
        self.classify(&load_image(path)?)
    }

    /// 複数画像を分類（読めない画像はその画像だけエラー）
    pub fn classify_batch(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Result<Prediction>)> {
        paths
            .iter()
            .map(|path| (path.clone(), self.classify_path(path)))
            .collect()
    }
}
