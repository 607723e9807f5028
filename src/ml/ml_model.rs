//! 分類ヘッドの定義
//!
//! バックボーンの特徴ベクトルをクラス確率に写す小さな全結合ネットワークです。
//! 学習されるのはこのヘッドの重みだけで、バックボーンは凍結されています。

use burn::{
    config::Config,
    module::Module,
    nn::{loss::CrossEntropyLossConfig, Dropout, DropoutConfig, Linear, LinearConfig, Relu},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
};

use crate::error::VisionError;

/// ヘッド設定
#[derive(Config, Debug)]
pub struct HeadConfig {
    /// 入力（特徴ベクトル）の次元
    pub feature_len: usize,
    /// 分類クラス数
    pub num_classes: usize,
    /// 中間層のユニット数
    #[config(default = 512)]
    pub hidden_size: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl HeadConfig {
    /// ヘッドを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassificationHead<B> {
        log::debug!(
            "[Head] FC1: {} -> {}, FC2: {} -> {}, dropout={}",
            self.feature_len,
            self.hidden_size,
            self.hidden_size,
            self.num_classes,
            self.dropout
        );

        ClassificationHead {
            fc1: LinearConfig::new(self.feature_len, self.hidden_size).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// 分類ヘッド
///
/// # アーキテクチャ
/// - FC: feature_len -> hidden + ReLU
/// - Dropout
/// - FC: hidden -> num_classes
/// - Softmax (分類時)
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ClassificationHead<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `features`: 特徴ベクトルのバッチ [batch_size, feature_len]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.fc1.forward(features);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]（各行の合計は1）
    pub fn forward_distribution(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        softmax(self.forward(features), 1)
    }

    /// 順伝播と交差エントロピー損失（ロジット, 損失）
    pub fn forward_loss(
        &self,
        features: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let logits = self.forward(features);
        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), targets);
        (logits, loss)
    }

    pub fn feature_len(&self) -> usize {
        self.fc1.weight.val().dims()[0]
    }

    pub fn num_classes(&self) -> usize {
        self.fc2.weight.val().dims()[1]
    }
}

/// ヘッドの重みをバイト列に変換
pub fn head_to_bytes<B: Backend>(head: &ClassificationHead<B>) -> crate::error::Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(head.clone().into_record(), ())
        .map_err(|e| VisionError::Artifact(format!("モデル重みの書き出しエラー: {:?}", e)))
}

/// バイト列からヘッドの重みを復元
///
/// 記録された形状が設定（特徴次元、中間層、クラス数）と異なる場合は ShapeMismatch です。
pub fn head_from_bytes<B: Backend>(
    bytes: Vec<u8>,
    config: &HeadConfig,
    device: &B::Device,
) -> crate::error::Result<ClassificationHead<B>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record: ClassificationHeadRecord<B> = recorder
        .load(bytes, device)
        .map_err(|e| VisionError::Artifact(format!("モデル重みの読み込みエラー: {:?}", e)))?;

    let [feature_len, hidden] = record.fc1.weight.val().dims();
    let [hidden_out, num_classes] = record.fc2.weight.val().dims();
    if num_classes != config.num_classes {
        return Err(VisionError::ShapeMismatch(format!(
            "artifact has {} classes, configured label set has {}",
            num_classes, config.num_classes
        )));
    }
    if feature_len != config.feature_len {
        return Err(VisionError::ShapeMismatch(format!(
            "artifact expects {} features, backbone produces {}",
            feature_len, config.feature_len
        )));
    }
    if hidden != config.hidden_size || hidden_out != config.hidden_size {
        return Err(VisionError::ShapeMismatch(format!(
            "artifact hidden size {} does not match {}",
            hidden, config.hidden_size
        )));
    }

    Ok(config.init::<B>(device).load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_head_shapes_and_distribution() {
        let device = NdArrayDevice::Cpu;
        let head = HeadConfig::new(6, 4).with_hidden_size(8).init::<TestBackend>(&device);
        assert_eq!(head.feature_len(), 6);
        assert_eq!(head.num_classes(), 4);

        let features = Tensor::<TestBackend, 2>::ones([3, 6], &device);
        let probs = head.forward_distribution(features);
        assert_eq!(probs.dims(), [3, 4]);

        let sums: Vec<f32> = probs.sum_dim(1).into_data().iter::<f32>().collect();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_forward_loss_is_finite() {
        let device = NdArrayDevice::Cpu;
        let head = HeadConfig::new(3, 2).with_hidden_size(4).init::<TestBackend>(&device);
        let features = Tensor::<TestBackend, 2>::zeros([2, 3], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);
        let (logits, loss) = head.forward_loss(features, targets);
        assert_eq!(logits.dims(), [2, 2]);
        let loss: f32 = loss.into_data().iter::<f32>().next().unwrap();
        assert!(loss.is_finite());
    }

    #[test]
    fn test_bytes_round_trip_and_mismatch() {
        let device = NdArrayDevice::Cpu;
        let config = HeadConfig::new(5, 4).with_hidden_size(6);
        let head = config.init::<TestBackend>(&device);
        let bytes = head_to_bytes(&head).unwrap();

        let features = Tensor::<TestBackend, 2>::ones([1, 5], &device);
        let expected: Vec<f32> = head.forward(features.clone()).into_data().iter::<f32>().collect();
        let restored = head_from_bytes::<TestBackend>(bytes.clone(), &config, &device).unwrap();
        let actual: Vec<f32> = restored.forward(features).into_data().iter::<f32>().collect();
        assert_eq!(expected, actual);

        let three_classes = HeadConfig::new(5, 3).with_hidden_size(6);
        assert!(matches!(
            head_from_bytes::<TestBackend>(bytes.clone(), &three_classes, &device),
            Err(VisionError::ShapeMismatch(_))
        ));
        let other_backbone = HeadConfig::new(7, 4).with_hidden_size(6);
        assert!(matches!(
            head_from_bytes::<TestBackend>(bytes, &other_backbone, &device),
            Err(VisionError::ShapeMismatch(_))
        ));
    }
}
