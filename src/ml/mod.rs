pub mod ml_model;
pub mod training;
pub mod inference;

pub use ml_model::{head_from_bytes, head_to_bytes, ClassificationHead, HeadConfig};
pub use training::{EpochMetrics, TrainingController, TrainingEvent, TrainingReport};
pub use inference::InferenceEngine;

/// CPU (NdArray) バックエンド
pub type CpuBackend = burn_ndarray::NdArray<f32>;
/// 学習用 CPU バックエンド
pub type CpuAutodiff = burn_autodiff::Autodiff<CpuBackend>;
/// GPU (WGPU) バックエンド
pub type GpuBackend = burn::backend::Wgpu;
/// 学習用 GPU バックエンド
pub type GpuAutodiff = burn::backend::Autodiff<GpuBackend>;
