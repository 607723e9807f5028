//! バックボーン入力の前処理
//!
//! リサイズ → RGB化 → チャネル正規化 → 4次元配列化を行います。

use image::{imageops::FilterType, DynamicImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VisionError};

use super::BackboneKind;

// ImageNetの平均と標準偏差
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// テンソルの軸順
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TensorLayout {
    /// [batch, channel, height, width]
    #[default]
    Nchw,
    /// [batch, height, width, channel]
    Nhwc,
}

/// チャネル正規化の方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// ImageNetの平均と標準偏差
    ImageNet,
    /// [-1, 1] へのスケーリング
    Symmetric,
}

impl Normalization {
    /// 画素値 [0, 255] を正規化
    ///
    /// `rescale` が有効なら [0, 1] に縮めてから正規化し、
    /// 無効なら画素値のスケールのまま平均だけを引きます。
    pub fn apply(self, channel: usize, value: u8, rescale: bool) -> f32 {
        let value = value as f32;
        match (self, rescale) {
            (Normalization::ImageNet, true) => {
                (value / 255.0 - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel]
            }
            (Normalization::ImageNet, false) => value - IMAGENET_MEAN[channel] * 255.0,
            (Normalization::Symmetric, true) => value / 127.5 - 1.0,
            (Normalization::Symmetric, false) => value - 127.5,
        }
    }
}

/// 画像をバックボーン入力の配列に変換する
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preprocessor {
    pub input_size: u32,
    pub normalization: Normalization,
    pub layout: TensorLayout,
    pub rescale: bool,
}

impl Preprocessor {
    pub fn for_backbone(kind: BackboneKind, layout: TensorLayout, rescale: bool) -> Self {
        Self {
            input_size: kind.input_size(),
            normalization: kind.normalization(),
            layout,
            rescale,
        }
    }

    /// 1枚の画像を [1, 3, S, S] または [1, S, S, 3] に変換
    pub fn to_array(&self, image: &DynamicImage) -> Result<Array4<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(VisionError::InvalidImage {
                path: "<memory>".to_string(),
                reason: "image has zero area".to_string(),
            });
        }

        let size = self.input_size as usize;
        let rgb = image
            .resize_exact(self.input_size, self.input_size, FilterType::Triangle)
            .to_rgb8();

        let mut array = match self.layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, size, size)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, size, size, 3)),
        };

        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for channel in 0..3 {
                let value = self.normalization.apply(channel, pixel[channel], self.rescale);
                match self.layout {
                    TensorLayout::Nchw => array[[0, channel, y, x]] = value,
                    TensorLayout::Nhwc => array[[0, y, x, channel]] = value,
                }
            }
        }

        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_normalization_values() {
        assert_relative_eq!(Normalization::Symmetric.apply(0, 255, true), 1.0);
        assert_relative_eq!(Normalization::Symmetric.apply(0, 0, true), -1.0);
        assert_relative_eq!(
            Normalization::ImageNet.apply(1, 0, true),
            -0.456 / 0.224,
            epsilon = 1e-5
        );
        assert_relative_eq!(Normalization::Symmetric.apply(2, 200, false), 72.5);
    }

    #[test]
    fn test_to_array_shape_and_layout() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 6, Rgb([255, 0, 0])));

        let mut preprocessor = Preprocessor::for_backbone(BackboneKind::MobileNetV2, TensorLayout::Nchw, true);
        preprocessor.input_size = 8;
        let nchw = preprocessor.to_array(&image).unwrap();
        assert_eq!(nchw.shape(), &[1, 3, 8, 8]);
        assert_relative_eq!(nchw[[0, 0, 3, 3]], 1.0);
        assert_relative_eq!(nchw[[0, 2, 3, 3]], -1.0);

        preprocessor.layout = TensorLayout::Nhwc;
        let nhwc = preprocessor.to_array(&image).unwrap();
        assert_eq!(nhwc.shape(), &[1, 8, 8, 3]);
        assert_relative_eq!(nhwc[[0, 3, 3, 0]], 1.0);
    }

    #[test]
    fn test_zero_area_is_invalid() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        let preprocessor = Preprocessor::for_backbone(BackboneKind::Vgg19, TensorLayout::Nchw, true);
        assert!(matches!(
            preprocessor.to_array(&image),
            Err(VisionError::InvalidImage { .. })
        ));
    }
}
