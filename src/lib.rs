//! コーヒーチェリーの熟度判定と顔照合のための判定コア
//!
//! 凍結した事前学習済みバックボーンで特徴ベクトルを作り、
//! 学習した分類ヘッド（多クラス分類）または登録済みギャラリー（最近傍照合）で
//! ラベルと信頼度を決めます。

pub mod backbone;
pub mod dataset;
pub mod decision;
pub mod error;
pub mod matching;
pub mod model;
pub mod types;
#[cfg(feature = "ml")]
pub mod ml;

#[cfg(test)]
pub(crate) mod test_support;

pub use backbone::{BackboneKind, FeatureExtractor, OnnxBackbone};
pub use decision::{Decide, Prediction};
pub use error::{Result, VisionError};
pub use matching::{Gallery, GalleryEntry, GalleryStore, MatchResult};
pub use types::{ClassDistribution, FeatureVector, LabelSet, LabeledSample};
