//! ONNX Runtime で動かす事前学習済みバックボーン
//!
//! 分類層を除いたネットワーク（include_top=False 相当）をONNXで書き出したものを想定します。
//! 出力が特徴マップ [1, C, H, W] / [1, H, W, C] の場合は Global Average Pooling で
//! ベクトルにまとめ、[1, D] の場合はそのまま使います。

use image::DynamicImage;
use log::info;
use ndarray::{ArrayD, Axis};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, VisionError};
use crate::model::config::BackboneSettings;
use crate::types::FeatureVector;

use super::{BackboneKind, FeatureExtractor, Preprocessor, TensorLayout};

pub struct OnnxBackbone {
    kind: BackboneKind,
    session: Session,
    input_name: String,
    preprocessor: Preprocessor,
}

impl OnnxBackbone {
    /// 設定に従ってONNXモデルを読み込む
    pub fn load(settings: &BackboneSettings, rescale: bool) -> Result<Self> {
        let model_path = Path::new(&settings.model_path);
        if !model_path.exists() {
            return Err(VisionError::Configuration(format!(
                "Backbone model file not found: {}",
                settings.model_path
            )));
        }

        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?;
        if settings.intra_threads > 0 {
            builder = builder.with_intra_threads(settings.intra_threads)?;
        }
        let session = builder.commit_from_file(model_path)?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| VisionError::Backbone("Backbone model has no inputs".into()))?;
        if session.outputs.is_empty() {
            return Err(VisionError::Backbone("Backbone model has no outputs".into()));
        }

        info!(
            "バックボーン {} を読み込みました: {} (入力: {})",
            settings.kind, settings.model_path, input_name
        );

        Ok(Self {
            kind: settings.kind,
            session,
            input_name,
            preprocessor: Preprocessor::for_backbone(settings.kind, settings.layout, rescale),
        })
    }

    pub fn kind(&self) -> BackboneKind {
        self.kind
    }

    /// 出力テンソルを特徴ベクトルにまとめる
    fn pool(&self, output: ArrayD<f32>) -> Result<Vec<f32>> {
        if output.ndim() == 0 || output.shape()[0] == 0 {
            return Err(VisionError::ShapeMismatch(format!(
                "Backbone output has no batch axis: {:?}",
                output.shape()
            )));
        }
        let sample = output.index_axis(Axis(0), 0);
        let pooled = match (sample.ndim(), self.preprocessor.layout) {
            (1, _) => Some(sample.to_owned()),
            (3, TensorLayout::Nchw) => sample
                .mean_axis(Axis(2))
                .and_then(|a| a.mean_axis(Axis(1))),
            (3, TensorLayout::Nhwc) => sample
                .mean_axis(Axis(1))
                .and_then(|a| a.mean_axis(Axis(0))),
            (ndim, _) => {
                return Err(VisionError::ShapeMismatch(format!(
                    "Unexpected backbone output rank {}",
                    ndim + 1
                )))
            }
        };

        pooled
            .map(|a| a.iter().copied().collect())
            .ok_or_else(|| VisionError::Backbone("Backbone output is empty".into()))
    }
}

impl FeatureExtractor for OnnxBackbone {
    fn feature_len(&self) -> usize {
        self.kind.feature_len()
    }

    fn input_size(&self) -> u32 {
        self.preprocessor.input_size
    }

    fn backbone(&self) -> Option<BackboneKind> {
        Some(self.kind)
    }

    fn rescale(&self) -> Option<bool> {
        Some(self.preprocessor.rescale)
    }

    fn extract(&self, image: &DynamicImage) -> Result<FeatureVector> {
        let input_dyn = self.preprocessor.to_array(image)?.into_dyn();
        let input = input_dyn.as_standard_layout();

        let mut input_tensors = HashMap::new();
        input_tensors.insert(
            self.input_name.as_str(),
            Tensor::from_array(&input)
                .map_err(|e| VisionError::Backbone(format!("Failed to create input tensor: {}", e)))?,
        );

        let outputs = self
            .session
            .run(input_tensors)
            .map_err(|e| VisionError::Backbone(format!("Failed to run backbone: {}", e)))?;
        let output = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::Backbone(format!("Failed to extract output tensor: {}", e)))?
            .to_owned();

        let features = self.pool(output)?;
        if features.len() != self.feature_len() {
            return Err(VisionError::ShapeMismatch(format!(
                "{} produced {} features, expected {}",
                self.kind,
                features.len(),
                self.feature_len()
            )));
        }

        Ok(FeatureVector::new(features))
    }
}
