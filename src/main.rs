//! コマンドラインツール
//!
//! 学習データの整理、学習、熟度予測、顔照合を行います。

#![recursion_limit = "256"]

use anyhow::{bail, Context, Result};
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use burn_ndarray::NdArrayDevice;
use burn_wgpu::WgpuDevice;
use clap::{Parser, Subcommand};
use env_logger::{Builder, Env};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use coffee_vision_lib::backbone::{FeatureExtractor, OnnxBackbone};
use coffee_vision_lib::dataset::{curator::count_by_label, DataCurator, Placement, TrainValSplit};
use coffee_vision_lib::matching::{Gallery, GalleryStore};
use coffee_vision_lib::ml::{CpuAutodiff, CpuBackend, GpuAutodiff, GpuBackend, InferenceEngine, TrainingController, TrainingEvent};
use coffee_vision_lib::model::{load_metadata, AppConfig, DeviceType};
use coffee_vision_lib::{Decide, LabeledSample, Prediction};

#[derive(Parser)]
#[command(name = "coffee_vision", version, about = "Coffee berry ripeness grading and face gallery matching")]
struct Cli {
    /// 設定ファイル
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 既定の設定ファイルを書き出す
    ConfigInit {
        /// 既存の設定ファイルを上書きする
        #[arg(long)]
        force: bool,
    },
    /// ラベル付き画像の一覧（JSON）から train/validation フォルダを作る
    Curate {
        /// [{"path": "...", "label": "Ripe"}, ...]
        manifest: PathBuf,
        /// コピーの代わりにハードリンクを張る
        #[arg(long)]
        hard_link: bool,
    },
    /// 整理済みデータで分類ヘッドを学習する
    Train {
        /// エポック数（省略時は設定値）
        #[arg(long)]
        epochs: Option<usize>,
        /// 保存先（省略時は設定の model_path）
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// 画像の熟度を予測する
    Predict {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// 画像をギャラリーと照合する
    Match {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Command::ConfigInit { force } = cli.command {
        return config_init(&cli.config, force);
    }

    let config = load_config(&cli.config)?;
    config.validate()?;

    match cli.command {
        Command::ConfigInit { .. } => Ok(()),
        Command::Curate { manifest, hard_link } => curate(&config, &manifest, hard_link),
        Command::Train { epochs, output } => {
            let epochs = epochs.unwrap_or(config.training.num_epochs);
            let output = output.unwrap_or_else(|| PathBuf::from(&config.model.model_path));
            match config.device_type {
                DeviceType::Cpu => train::<CpuAutodiff>(&config, epochs, &output, NdArrayDevice::Cpu),
                DeviceType::Wgpu => train::<GpuAutodiff>(&config, epochs, &output, WgpuDevice::default()),
            }
        }
        Command::Predict { images } => match config.device_type {
            DeviceType::Cpu => predict::<CpuBackend>(&config, &images, NdArrayDevice::Cpu),
            DeviceType::Wgpu => predict::<GpuBackend>(&config, &images, WgpuDevice::default()),
        },
        Command::Match { images } => match_images(&config, &images),
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        let config = AppConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?;
        info!("設定ファイルを読み込みました: {}", path.display());
        Ok(config)
    } else {
        warn!("設定ファイルが存在しません ({})。デフォルト設定を使用します", path.display());
        Ok(AppConfig::default())
    }
}

fn config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = AppConfig::default();
    config.save(path)?;
    config.display();
    info!("設定ファイルを保存しました: {}", path.display());
    Ok(())
}

fn curate(config: &AppConfig, manifest: &Path, hard_link: bool) -> Result<()> {
    let content = std::fs::read_to_string(manifest)
        .with_context(|| format!("Failed to read manifest: {}", manifest.display()))?;
    let pool: Vec<LabeledSample> =
        serde_json::from_str(&content).context("Manifest must be a JSON array of {path, label}")?;

    let placement = if hard_link { Placement::HardLink } else { Placement::Copy };
    let curator = DataCurator::new(
        &config.dataset_root,
        config.label_set()?,
        config.training.train_ratio,
        config.training.seed,
    )?
    .with_placement(placement);

    let split = curator.curate(&pool)?;
    for (label, train, validation) in split.class_counts() {
        println!("{:<12} 学習 {:>5} 枚 / 検証 {:>5} 枚", label, train, validation);
    }
    Ok(())
}

fn load_backbone(config: &AppConfig, rescale: bool) -> Result<Arc<dyn FeatureExtractor>> {
    let backbone = OnnxBackbone::load(&config.backbone, rescale)?;
    Ok(Arc::new(backbone))
}

fn train<B: AutodiffBackend>(config: &AppConfig, epochs: usize, output: &Path, device: B::Device) -> Result<()> {
    let labels = config.label_set()?;
    let split = TrainValSplit::from_directory(Path::new(&config.dataset_root), &labels)?;
    for (label, count) in count_by_label(&split.train) {
        info!("  クラス '{}': 学習 {} 枚", label, count);
    }

    let extractor = load_backbone(config, config.augmentation.rescale)?;
    info!("計算デバイス: {}", config.device_type);

    let mut trainer = TrainingController::<B>::new(config, Arc::clone(&extractor), device.clone())?;
    let report = trainer.train_with_events(&split, epochs, |event| match event {
        TrainingEvent::EpochStarted { epoch, total } => info!("=== エポック {}/{} ===", epoch, total),
        TrainingEvent::StepCompleted { step, steps, loss, .. } => {
            log::debug!("  ステップ {}/{}: loss={:.4}", step, steps, loss)
        }
        TrainingEvent::EpochCompleted(m) => println!(
            "epoch {:>3}  loss {:.4}  acc {:.3}  val_loss {:.4}  val_acc {:.3}",
            m.epoch, m.train_loss, m.train_accuracy, m.val_loss, m.val_accuracy
        ),
        TrainingEvent::Interrupted { epoch, reason } => warn!("エポック {} で中断: {}", epoch, reason),
        TrainingEvent::Finished { epochs } => info!("学習完了 ({} エポック)", epochs),
    })?;

    if report.is_empty() {
        warn!("完了したエポックがないため保存しません");
        return Ok(());
    }
    trainer.save(output)?;

    // 検証側の1枚目で動作確認
    if let Some(sample) = split.validation.first() {
        let engine = InferenceEngine::<B::InnerBackend>::from_head(
            trainer.head().valid(),
            labels,
            extractor,
            device,
        )?;
        let prediction = engine.classify_path(&sample.path)?;
        info!(
            "確認: {} (正解 {}) -> {} ({:.1}%)",
            sample.path.display(),
            sample.label,
            prediction.label,
            prediction.confidence * 100.0
        );
    }
    Ok(())
}

fn predict<B: burn::tensor::backend::Backend>(config: &AppConfig, images: &[PathBuf], device: B::Device) -> Result<()> {
    let model_path = PathBuf::from(&config.model.model_path);
    let metadata = load_metadata(&model_path)
        .with_context(|| format!("Failed to read model: {}", model_path.display()))?;
    if metadata.backbone != config.backbone.kind {
        bail!(
            "model was trained on {}, but backbone {} is configured",
            metadata.backbone,
            config.backbone.kind
        );
    }

    let extractor = load_backbone(config, metadata.rescale)?;
    let engine = InferenceEngine::<B>::load(&model_path, &config.label_set()?, extractor, device)?;

    for (path, result) in engine.classify_batch(images) {
        print_prediction(&path, result);
    }
    Ok(())
}

fn match_images(config: &AppConfig, images: &[PathBuf]) -> Result<()> {
    let extractor = load_backbone(config, config.augmentation.rescale)?;
    let gallery = Gallery::from_directory(
        Path::new(&config.matching.gallery_dir),
        extractor.as_ref(),
        config.matching.acceptance_radius,
    )?;
    let store = GalleryStore::new(gallery);

    for path in images {
        let gallery = store.snapshot();
        let result = extractor
            .extract_path(path)
            .and_then(|features| gallery.match_query(&features))
            .map(|m| m.decide());
        print_prediction(path, result);
    }
    Ok(())
}

fn print_prediction(path: &Path, result: coffee_vision_lib::Result<Prediction>) {
    match result {
        Ok(prediction) => match prediction.distance {
            Some(distance) => println!(
                "{}\t{}\t{:.1}%\tdistance {:.4}",
                path.display(),
                prediction.label,
                prediction.confidence * 100.0,
                distance
            ),
            None => println!(
                "{}\t{}\t{:.1}%",
                path.display(),
                prediction.label,
                prediction.confidence * 100.0
            ),
        },
        Err(e) => eprintln!("{}\tエラー: {}", path.display(), e),
    }
}
