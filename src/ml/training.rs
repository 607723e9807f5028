//! 分類ヘッドの学習
//!
//! 整理済みの学習データをバックボーンに通し、ヘッドの重みだけを更新します。
//! 進捗はログとイベントで通知し、エポックごとの指標を [`TrainingReport`] に残します。

use burn::{
    module::AutodiffModule,
    optim::{momentum::MomentumConfig, AdamConfig, GradientsParams, Optimizer, SgdConfig},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backbone::{load_image, BackboneKind, FeatureExtractor};
use crate::dataset::{AugmentationPolicy, TrainValSplit};
use crate::error::{Result, VisionError};
use crate::ml::ml_model::{head_to_bytes, ClassificationHead, HeadConfig};
use crate::model::config::{AppConfig, OptimizerKind, TrainingSettings};
use crate::model::{save_model_with_metadata, ModelMetadata};
use crate::types::{FeatureVector, LabelSet, LabeledSample};

/// 1エポック分の指標
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochMetrics {
    /// 1始まり
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// 学習結果（エポック順の指標）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochMetrics>,
    /// 途中で止まった場合の理由
    pub interrupted: Option<String>,
}

impl TrainingReport {
    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    pub fn final_val_accuracy(&self) -> Option<f64> {
        self.last().map(|m| m.val_accuracy)
    }
}

/// 学習中に通知するイベント
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    EpochStarted { epoch: usize, total: usize },
    StepCompleted { epoch: usize, step: usize, steps: usize, loss: f64 },
    EpochCompleted(EpochMetrics),
    Interrupted { epoch: usize, reason: String },
    Finished { epochs: usize },
}

/// 学習ループの制御
///
/// 1つのヘッドに対して同時に走らせる学習は1つだけです。
pub struct TrainingController<B: AutodiffBackend> {
    settings: TrainingSettings,
    labels: LabelSet,
    backbone: BackboneKind,
    hidden_size: usize,
    extractor: Arc<dyn FeatureExtractor>,
    head: ClassificationHead<B>,
    policy: AugmentationPolicy,
    device: B::Device,
    report: TrainingReport,
}

/// 特徴量とラベルインデックスのバッチ
struct FeatureBatch {
    features: Vec<f32>,
    targets: Vec<i64>,
}

impl FeatureBatch {
    fn with_capacity(n: usize, feature_len: usize) -> Self {
        Self {
            features: Vec::with_capacity(n * feature_len),
            targets: Vec::with_capacity(n),
        }
    }

    fn len(&self) -> usize {
        self.targets.len()
    }
}

impl<B: AutodiffBackend> TrainingController<B> {
    /// 設定から新しいヘッドを初期化
    pub fn new(config: &AppConfig, extractor: Arc<dyn FeatureExtractor>, device: B::Device) -> Result<Self> {
        config.validate()?;
        let labels = config.label_set()?;

        let head = HeadConfig::new(extractor.feature_len(), labels.len())
            .with_hidden_size(config.model.hidden_size)
            .with_dropout(config.model.dropout)
            .init::<B>(&device);

        Ok(Self {
            settings: config.training.clone(),
            labels,
            backbone: config.backbone.kind,
            hidden_size: config.model.hidden_size,
            extractor,
            head,
            policy: AugmentationPolicy::from_settings(&config.augmentation),
            device,
            report: TrainingReport::default(),
        })
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn head(&self) -> &ClassificationHead<B> {
        &self.head
    }

    /// 直近の学習結果
    pub fn report(&self) -> &TrainingReport {
        &self.report
    }

    pub fn train(&mut self, split: &TrainValSplit, epochs: usize) -> Result<TrainingReport> {
        self.train_with_events(split, epochs, |_| {})
    }

    /// 学習を実行し、イベントを `on_event` に通知する
    ///
    /// 最初のエポックで失敗した場合はエラーを返します。2エポック目以降の失敗では
    /// ヘッドを直前のエポック終了時の重みに戻し、`interrupted` 付きの結果を返します。
    pub fn train_with_events<F>(&mut self, split: &TrainValSplit, epochs: usize, mut on_event: F) -> Result<TrainingReport>
    where
        F: FnMut(&TrainingEvent),
    {
        self.report = TrainingReport::default();
        if epochs == 0 {
            info!("エポック数が0のため学習を行いません");
            on_event(&TrainingEvent::Finished { epochs: 0 });
            return Ok(self.report.clone());
        }

        if split.train.is_empty() {
            return Err(VisionError::InsufficientData("training split has no samples".into()));
        }
        if split.validation.is_empty() {
            return Err(VisionError::InsufficientData("validation split has no samples".into()));
        }

        match self.settings.optimizer {
            OptimizerKind::Sgd => {
                let momentum = MomentumConfig::new()
                    .with_momentum(self.settings.momentum)
                    .with_dampening(0.0);
                let mut optim = SgdConfig::new()
                    .with_momentum(Some(momentum))
                    .init::<B, ClassificationHead<B>>();
                self.run(split, epochs, &mut optim, &mut on_event)
            }
            OptimizerKind::Adam => {
                let mut optim = AdamConfig::new().init::<B, ClassificationHead<B>>();
                self.run(split, epochs, &mut optim, &mut on_event)
            }
        }
    }

    fn run<O, F>(&mut self, split: &TrainValSplit, epochs: usize, optim: &mut O, on_event: &mut F) -> Result<TrainingReport>
    where
        O: Optimizer<ClassificationHead<B>, B>,
        F: FnMut(&TrainingEvent),
    {
        let train = self.indexed(&split.train)?;
        let validation = self.indexed(&split.validation)?;

        info!(
            "学習を開始します: 学習 {} 枚, 検証 {} 枚, エポック数 {}, バッチサイズ {}",
            train.len(),
            validation.len(),
            epochs,
            self.settings.batch_size
        );

        // 検証側は拡張しないので一度だけ特徴量を計算する
        let validation_features = self.extract_all(&validation, &self.policy.validation())?;
        let train_cache = if self.policy.is_stochastic() {
            None
        } else {
            Some(self.extract_rows(&train, &self.policy)?)
        };

        for epoch in 1..=epochs {
            on_event(&TrainingEvent::EpochStarted { epoch, total: epochs });

            match self.run_epoch(epoch, &train, train_cache.as_ref(), &validation_features, optim, on_event) {
                Ok(metrics) => {
                    info!(
                        "エポック {}/{}: loss={:.4} acc={:.3} val_loss={:.4} val_acc={:.3}",
                        epoch,
                        epochs,
                        metrics.train_loss,
                        metrics.train_accuracy,
                        metrics.val_loss,
                        metrics.val_accuracy
                    );
                    on_event(&TrainingEvent::EpochCompleted(metrics.clone()));
                    self.report.epochs.push(metrics);
                }
                Err(e) if epoch == 1 => return Err(e),
                Err(e) => {
                    warn!("エポック {} で学習を中断しました: {}", epoch, e);
                    let reason = e.to_string();
                    on_event(&TrainingEvent::Interrupted {
                        epoch,
                        reason: reason.clone(),
                    });
                    self.report.interrupted = Some(reason);
                    return Ok(self.report.clone());
                }
            }
        }

        on_event(&TrainingEvent::Finished { epochs });
        Ok(self.report.clone())
    }

    /// 1エポック分の学習と検証
    ///
    /// 更新はヘッドの複製に対して行い、成功したときだけ差し替えます。
    fn run_epoch<O, F>(
        &mut self,
        epoch: usize,
        train: &[(PathBuf, usize)],
        train_cache: Option<&Vec<Vec<f32>>>,
        validation: &FeatureBatch,
        optim: &mut O,
        on_event: &mut F,
    ) -> Result<EpochMetrics>
    where
        O: Optimizer<ClassificationHead<B>, B>,
        F: FnMut(&TrainingEvent),
    {
        let batch_size = self.settings.batch_size;
        let feature_len = self.extractor.feature_len();
        let mut rng = StdRng::seed_from_u64(self.settings.seed.wrapping_add(epoch as u64));

        let mut order: Vec<usize> = (0..train.len()).collect();
        order.shuffle(&mut rng);

        let mut steps = train.len().div_ceil(batch_size);
        if let Some(limit) = self.settings.steps_per_epoch {
            steps = steps.min(limit);
        }

        let mut model = self.head.clone();
        let mut loss_sum = 0.0;
        let mut correct = 0usize;
        let mut seen = 0usize;

        for step in 0..steps {
            let chunk = &order[step * batch_size..((step + 1) * batch_size).min(order.len())];
            let mut batch = FeatureBatch::with_capacity(chunk.len(), feature_len);
            for &index in chunk {
                let (path, label) = &train[index];
                match train_cache {
                    Some(cache) => batch.features.extend_from_slice(&cache[index]),
                    None => {
                        let features = self.extract_with(path, &self.policy, &mut rng)?;
                        batch.features.extend_from_slice(features.as_slice());
                    }
                }
                batch.targets.push(*label as i64);
            }

            let n = batch.len();
            let features = Tensor::<B, 1>::from_floats(batch.features.as_slice(), &self.device)
                .reshape([n, feature_len]);
            let targets = Tensor::<B, 1, Int>::from_ints(batch.targets.as_slice(), &self.device);

            let (logits, loss) = model.forward_loss(features, targets);
            let step_loss = loss.clone().into_scalar().elem::<f64>();
            correct += count_correct(logits, &batch.targets);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(self.settings.learning_rate, model, grads);

            loss_sum += step_loss * n as f64;
            seen += n;
            on_event(&TrainingEvent::StepCompleted {
                epoch,
                step: step + 1,
                steps,
                loss: step_loss,
            });
        }

        let (val_loss, val_accuracy) = self.evaluate(&model.valid(), validation);
        self.head = model;

        Ok(EpochMetrics {
            epoch,
            train_loss: loss_sum / seen.max(1) as f64,
            train_accuracy: correct as f64 / seen.max(1) as f64,
            val_loss,
            val_accuracy,
        })
    }

    /// 重みを更新せずに損失と精度を求める
    fn evaluate(&self, model: &ClassificationHead<B::InnerBackend>, data: &FeatureBatch) -> (f64, f64) {
        let feature_len = self.extractor.feature_len();
        let batch_size = self.settings.batch_size;
        let mut loss_sum = 0.0;
        let mut correct = 0usize;

        for (features, targets) in data
            .features
            .chunks(batch_size * feature_len)
            .zip(data.targets.chunks(batch_size))
        {
            let n = targets.len();
            let features = Tensor::<B::InnerBackend, 1>::from_floats(features, &self.device)
                .reshape([n, feature_len]);
            let target_tensor = Tensor::<B::InnerBackend, 1, Int>::from_ints(targets, &self.device);

            let (logits, loss) = model.forward_loss(features, target_tensor);
            loss_sum += loss.into_scalar().elem::<f64>() * n as f64;
            correct += count_correct(logits, targets);
        }

        let total = data.len().max(1) as f64;
        (loss_sum / total, correct as f64 / total)
    }

    /// ラベル名をインデックスに変換
    fn indexed(&self, samples: &[LabeledSample]) -> Result<Vec<(PathBuf, usize)>> {
        samples
            .iter()
            .map(|sample| {
                self.labels
                    .index_of(&sample.label)
                    .map(|index| (sample.path.clone(), index))
                    .ok_or_else(|| {
                        VisionError::Configuration(format!(
                            "sample {} has undeclared label '{}'",
                            sample.path.display(),
                            sample.label
                        ))
                    })
            })
            .collect()
    }

    /// 画像を読み込み、拡張方針を適用してから特徴量にする
    fn extract_with(&self, path: &Path, policy: &AugmentationPolicy, rng: &mut StdRng) -> Result<FeatureVector> {
        let image = policy.apply(&load_image(path)?, rng);
        self.extractor.extract(&image)
    }

    fn extract_all(&self, samples: &[(PathBuf, usize)], policy: &AugmentationPolicy) -> Result<FeatureBatch> {
        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        let mut batch = FeatureBatch::with_capacity(samples.len(), self.extractor.feature_len());
        for (path, label) in samples {
            batch
                .features
                .extend_from_slice(self.extract_with(path, policy, &mut rng)?.as_slice());
            batch.targets.push(*label as i64);
        }
        Ok(batch)
    }

    /// 各サンプルの特徴量を1行ずつ返す
    fn extract_rows(&self, samples: &[(PathBuf, usize)], policy: &AugmentationPolicy) -> Result<Vec<Vec<f32>>> {
        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        samples
            .iter()
            .map(|(path, _)| Ok(self.extract_with(path, policy, &mut rng)?.as_slice().to_vec()))
            .collect()
    }

    /// ヘッドとメタデータをアーティファクトとして保存し、保存先を返す
    pub fn save(&self, path: &Path) -> Result<PathBuf> {
        let binary = head_to_bytes(&self.head)?;
        let metadata = ModelMetadata::new(
            &self.labels,
            self.extractor.backbone().unwrap_or(self.backbone),
            self.extractor.feature_len(),
            self.hidden_size,
            self.extractor.rescale().unwrap_or(self.policy.rescale),
            self.report.epochs.len() as u32,
            self.report.final_val_accuracy(),
        );
        let saved = save_model_with_metadata(path, &metadata, &binary)
            .map_err(|e| VisionError::Artifact(format!("{:#}", e)))?;
        info!("モデルを保存しました: {}", saved.display());
        Ok(saved)
    }
}

fn count_correct<Bk: Backend>(logits: Tensor<Bk, 2>, targets: &[i64]) -> usize {
    logits
        .argmax(1)
        .into_data()
        .iter::<i64>()
        .zip(targets)
        .filter(|(predicted, target)| predicted == *target)
        .count()
}
