//! 特徴抽出アダプタ
//!
//! 事前学習済みバックボーン（重みは凍結）を「画像 → 固定長特徴ベクトル」という
//! 共通の契約の裏に隠します。バックボーンは設定時に一度だけ選択されます。

pub mod onnx;
pub mod preprocess;

pub use onnx::OnnxBackbone;
pub use preprocess::{Normalization, Preprocessor, TensorLayout};

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, VisionError};
use crate::types::FeatureVector;

/// 選択可能なバックボーン
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackboneKind {
    Vgg19,
    ResNet50,
    InceptionV3,
    MobileNetV2,
}

impl BackboneKind {
    pub const ALL: [BackboneKind; 4] = [
        BackboneKind::Vgg19,
        BackboneKind::ResNet50,
        BackboneKind::InceptionV3,
        BackboneKind::MobileNetV2,
    ];

    /// Global Average Pooling 後の特徴次元
    pub fn feature_len(self) -> usize {
        match self {
            BackboneKind::Vgg19 => 512,
            BackboneKind::ResNet50 => 2048,
            BackboneKind::InceptionV3 => 2048,
            BackboneKind::MobileNetV2 => 1280,
        }
    }

    /// 入力画像サイズ（正方形）
    pub fn input_size(self) -> u32 {
        match self {
            BackboneKind::InceptionV3 => 299,
            _ => 224,
        }
    }

    /// 学習時の分布に合わせたチャネル正規化
    pub fn normalization(self) -> Normalization {
        match self {
            BackboneKind::Vgg19 | BackboneKind::ResNet50 => Normalization::ImageNet,
            BackboneKind::InceptionV3 | BackboneKind::MobileNetV2 => Normalization::Symmetric,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackboneKind::Vgg19 => "VGG19",
            BackboneKind::ResNet50 => "ResNet50",
            BackboneKind::InceptionV3 => "InceptionV3",
            BackboneKind::MobileNetV2 => "MobileNetV2",
        }
    }
}

impl std::fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for BackboneKind {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self> {
        BackboneKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                VisionError::Configuration(format!(
                    "Invalid backbone '{}'. Supported backbones are VGG19, ResNet50, InceptionV3 and MobileNetV2",
                    s
                ))
            })
    }
}

/// 画像 → 特徴ベクトルの契約
///
/// バックボーンの読み込み後は副作用のない純粋な関数として振る舞い、
/// 複数スレッドから同時に呼び出せます。
pub trait FeatureExtractor: Send + Sync {
    /// 出力ベクトルの長さ（設定ごとに一定）
    fn feature_len(&self) -> usize;

    /// 前処理後の入力サイズ
    fn input_size(&self) -> u32;

    fn extract(&self, image: &DynamicImage) -> Result<FeatureVector>;

    /// 事前学習済みネットワークの種類（不明なら None）
    fn backbone(&self) -> Option<BackboneKind> {
        None
    }

    /// 前処理で画素を [0, 1] にスケールするか（不明なら None）
    fn rescale(&self) -> Option<bool> {
        None
    }

    fn extract_path(&self, path: &Path) -> Result<FeatureVector> {
        let image = load_image(path)?;
        self.extract(&image)
    }
}

/// 画像ファイルを読み込む（デコード失敗、面積0は InvalidImage）
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    let image = image::open(path).map_err(|e| VisionError::invalid_image(path, e))?;
    if image.width() == 0 || image.height() == 0 {
        return Err(VisionError::invalid_image(path, "image has zero area"));
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backbone_from_str() {
        assert_eq!("vgg19".parse::<BackboneKind>().unwrap(), BackboneKind::Vgg19);
        assert_eq!("MobileNetV2".parse::<BackboneKind>().unwrap(), BackboneKind::MobileNetV2);
        assert!(matches!(
            "AlexNet".parse::<BackboneKind>(),
            Err(VisionError::Configuration(_))
        ));
    }

    #[test]
    fn test_backbone_shapes() {
        assert_eq!(BackboneKind::Vgg19.feature_len(), 512);
        assert_eq!(BackboneKind::InceptionV3.input_size(), 299);
        assert_eq!(BackboneKind::ResNet50.normalization(), Normalization::ImageNet);
    }

    #[test]
    fn test_load_image_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(matches!(load_image(&path), Err(VisionError::InvalidImage { .. })));
        assert!(matches!(
            load_image(&dir.path().join("missing.png")),
            Err(VisionError::InvalidImage { .. })
        ));
    }
}
