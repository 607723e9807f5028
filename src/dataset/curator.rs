use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use crate::error::{Result, VisionError};
use crate::types::{LabelSet, LabeledSample};

use super::list_images;

pub const TRAIN_DIR: &str = "train";
pub const VALIDATION_DIR: &str = "validation";

/// 画像の配置方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// ファイルをコピー
    #[default]
    Copy,
    /// ハードリンクを張る（同じファイルシステム上のみ）
    HardLink,
}

/// 学習用と検証用に分けたサンプル
///
/// どのサンプルもどちらか一方にだけ属します。
#[derive(Debug, Clone)]
pub struct TrainValSplit {
    pub root: PathBuf,
    pub labels: LabelSet,
    pub train: Vec<LabeledSample>,
    pub validation: Vec<LabeledSample>,
}

impl TrainValSplit {
    /// 整理済みのディレクトリを読み込む
    ///
    /// クラス名はラベル集合と完全一致で照合し、知らないフォルダは警告して無視します。
    /// 学習側に1枚もないクラスがあれば `EmptyClass` を返します。
    pub fn from_directory(root: &Path, labels: &LabelSet) -> Result<Self> {
        let mut split = Self {
            root: root.to_path_buf(),
            labels: labels.clone(),
            train: Vec::new(),
            validation: Vec::new(),
        };

        for side in [TRAIN_DIR, VALIDATION_DIR] {
            let side_dir = root.join(side);
            if !side_dir.is_dir() {
                return Err(VisionError::InsufficientData(format!(
                    "directory not found: {}",
                    side_dir.display()
                )));
            }

            let mut class_dirs: Vec<PathBuf> = fs::read_dir(&side_dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_dir())
                .collect();
            class_dirs.sort();

            for class_dir in class_dirs {
                let name = class_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if !labels.contains(&name) {
                    warn!("未知のクラスフォルダを無視します: {}", class_dir.display());
                    continue;
                }
                let samples = list_images(&class_dir)?
                    .into_iter()
                    .map(|path| LabeledSample::new(path, name.clone()));
                if side == TRAIN_DIR {
                    split.train.extend(samples);
                } else {
                    split.validation.extend(samples);
                }
            }
        }

        if let Some(empty) = labels
            .iter()
            .find(|label| !split.train.iter().any(|s| s.label == *label))
        {
            return Err(VisionError::EmptyClass(empty.to_string()));
        }

        info!(
            "データセットを読み込みました: 学習 {} 枚, 検証 {} 枚",
            split.train.len(),
            split.validation.len()
        );
        Ok(split)
    }

    /// ラベルごとの (学習, 検証) 枚数（ラベル集合の順）
    pub fn class_counts(&self) -> Vec<(String, usize, usize)> {
        self.labels
            .iter()
            .map(|label| {
                let train = self.train.iter().filter(|s| s.label == label).count();
                let validation = self.validation.iter().filter(|s| s.label == label).count();
                (label.to_string(), train, validation)
            })
            .collect()
    }
}

/// ラベル付き画像を学習用と検証用のフォルダに振り分ける
#[derive(Debug, Clone)]
pub struct DataCurator {
    root: PathBuf,
    labels: LabelSet,
    split_ratio: f32,
    seed: u64,
    placement: Placement,
}

impl DataCurator {
    pub fn new(root: impl Into<PathBuf>, labels: LabelSet, split_ratio: f32, seed: u64) -> Result<Self> {
        if !(split_ratio > 0.0 && split_ratio < 1.0) {
            return Err(VisionError::Configuration(format!(
                "split ratio {} must be in (0, 1)",
                split_ratio
            )));
        }
        Ok(Self {
            root: root.into(),
            labels,
            split_ratio,
            seed,
            placement: Placement::Copy,
        })
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// サンプル群をシャッフルして分割し、画像を配置する
    ///
    /// クラスごとに分割し、どのクラスも学習側に最低1枚入ります。学習側の合計は
    /// round(N * 分割比率) に揃えます。同じ入力とシードなら同じ分割になります。
    /// 入力に問題があればディスクには何も書き込みません。
    pub fn curate(&self, pool: &[LabeledSample]) -> Result<TrainValSplit> {
        self.check_pool(pool)?;

        let mut order: Vec<usize> = (0..pool.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);
        order.shuffle(&mut rng);

        let by_class: Vec<Vec<usize>> = self
            .labels
            .iter()
            .map(|label| {
                order
                    .iter()
                    .copied()
                    .filter(|&i| pool[i].label == label)
                    .collect()
            })
            .collect();
        let sizes: Vec<usize> = by_class.iter().map(Vec::len).collect();
        let quotas = train_quotas(&sizes, self.split_ratio as f64);

        for side in [TRAIN_DIR, VALIDATION_DIR] {
            for label in self.labels.iter() {
                fs::create_dir_all(self.root.join(side).join(label))?;
            }
        }

        let train_len: usize = quotas.iter().sum();
        let mut split = TrainValSplit {
            root: self.root.clone(),
            labels: self.labels.clone(),
            train: Vec::with_capacity(train_len),
            validation: Vec::with_capacity(pool.len() - train_len),
        };

        for (members, &quota) in by_class.iter().zip(&quotas) {
            for (position, &index) in members.iter().enumerate() {
                let sample = &pool[index];
                let side = if position < quota { TRAIN_DIR } else { VALIDATION_DIR };
                let dest = self.place(sample, &self.root.join(side).join(&sample.label))?;
                let placed = LabeledSample::new(dest, sample.label.clone());
                if position < quota {
                    split.train.push(placed);
                } else {
                    split.validation.push(placed);
                }
            }
        }

        info!(
            "データを分割しました: 学習 {} 枚, 検証 {} 枚 ({})",
            split.train.len(),
            split.validation.len(),
            self.root.display()
        );
        Ok(split)
    }

    /// 書き込み前の入力チェック
    fn check_pool(&self, pool: &[LabeledSample]) -> Result<()> {
        if let Some(sample) = pool.iter().find(|s| !self.labels.contains(&s.label)) {
            return Err(VisionError::Configuration(format!(
                "sample {} has undeclared label '{}'",
                sample.path.display(),
                sample.label
            )));
        }
        if let Some(empty) = self
            .labels
            .iter()
            .find(|label| !pool.iter().any(|s| s.label == *label))
        {
            return Err(VisionError::EmptyClass(empty.to_string()));
        }
        if let Some(missing) = pool.iter().find(|s| !s.path.is_file()) {
            return Err(VisionError::invalid_image(&missing.path, "file not found"));
        }
        Ok(())
    }

    fn place(&self, sample: &LabeledSample, class_dir: &Path) -> Result<PathBuf> {
        let mut attempt = 0usize;
        loop {
            let dest = destination_candidate(class_dir, &sample.path, attempt);
            let placed = match self.placement {
                Placement::Copy => copy_new(&sample.path, &dest),
                Placement::HardLink => fs::hard_link(&sample.path, &dest),
            };
            match placed {
                Ok(()) => {
                    debug!("{} -> {}", sample.path.display(), dest.display());
                    return Ok(dest);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// クラスごとの学習側の枚数を決める
///
/// 各クラスは floor(n * ratio) 枚（最低1枚）から始め、合計が round(N * ratio) に
/// 届くまで端数の大きいクラスから1枚ずつ足します。
fn train_quotas(sizes: &[usize], ratio: f64) -> Vec<usize> {
    let total: usize = sizes.iter().sum();
    let target = ((total as f64) * ratio).round() as usize;

    let mut quotas: Vec<usize> = sizes
        .iter()
        .map(|&n| {
            let base = ((n as f64) * ratio).floor() as usize;
            if n == 0 {
                0
            } else {
                base.clamp(1, n)
            }
        })
        .collect();

    let mut by_remainder: Vec<usize> = (0..sizes.len()).collect();
    by_remainder.sort_by(|&a, &b| {
        let frac = |i: usize| (sizes[i] as f64) * ratio - quotas[i] as f64;
        frac(b).total_cmp(&frac(a))
    });

    let mut assigned: usize = quotas.iter().sum();
    while assigned < target {
        let Some(&next) = by_remainder.iter().find(|&&i| quotas[i] < sizes[i]) else {
            break;
        };
        quotas[next] += 1;
        assigned += 1;
        by_remainder.retain(|&i| i != next);
        by_remainder.push(next);
    }
    quotas
}

/// 保存先ファイルを新規作成してコピーする（既存なら AlreadyExists）
fn copy_new(source: &Path, dest: &Path) -> io::Result<()> {
    let mut input = File::open(source)?;
    let mut output = OpenOptions::new().write(true).create_new(true).open(dest)?;
    io::copy(&mut input, &mut output)?;
    Ok(())
}

/// 保存先の候補名
///
/// 0回目は `<stem>.<ext>`、以降は `<stem>_1.<ext>`, `<stem>_2.<ext>` … になります。
fn destination_candidate(dir: &Path, source: &Path, attempt: usize) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let ext = source
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    if attempt == 0 {
        dir.join(format!("{}{}", stem, ext))
    } else {
        dir.join(format!("{}_{}{}", stem, attempt, ext))
    }
}

/// ラベルごとの枚数を数える
pub fn count_by_label(samples: &[LabeledSample]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for sample in samples {
        *counts.entry(sample.label.as_str()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_solid_png;
    use std::collections::HashSet;

    fn two_labels() -> LabelSet {
        LabelSet::new(["Ripe", "Unripe"]).unwrap()
    }

    fn make_pool(dir: &Path, per_class: usize) -> Vec<LabeledSample> {
        let mut pool = Vec::new();
        for i in 0..per_class {
            let ripe = dir.join(format!("ripe_{}.png", i));
            write_solid_png(&ripe, [200, 30, 30]);
            pool.push(LabeledSample::new(ripe, "Ripe"));
            let unripe = dir.join(format!("unripe_{}.png", i));
            write_solid_png(&unripe, [30, 200, 30]);
            pool.push(LabeledSample::new(unripe, "Unripe"));
        }
        pool
    }

    #[test]
    fn test_split_sizes_and_disjoint() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let pool = make_pool(src.path(), 5);

        let curator = DataCurator::new(out.path(), two_labels(), 0.7, 7).unwrap();
        let split = curator.curate(&pool).unwrap();

        assert_eq!(split.train.len(), 7);
        assert_eq!(split.validation.len(), 3);

        let train: HashSet<_> = split.train.iter().map(|s| s.path.clone()).collect();
        assert!(split.validation.iter().all(|s| !train.contains(&s.path)));
        assert!(split.train.iter().chain(&split.validation).all(|s| s.path.exists()));
        assert!(out.path().join("validation/Ripe").is_dir());
        assert!(out.path().join("validation/Unripe").is_dir());
    }

    #[test]
    fn test_same_seed_same_split() {
        let src = tempfile::tempdir().unwrap();
        let pool = make_pool(src.path(), 4);

        let names = |seed: u64| {
            let out = tempfile::tempdir().unwrap();
            let split = DataCurator::new(out.path(), two_labels(), 0.5, seed)
                .unwrap()
                .curate(&pool)
                .unwrap();
            split
                .train
                .iter()
                .map(|s| s.path.file_name().unwrap().to_owned())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(3), names(3));
    }

    #[test]
    fn test_collision_gets_suffix() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("a")).unwrap();
        fs::create_dir_all(src.path().join("b")).unwrap();
        write_solid_png(&src.path().join("a/berry.png"), [1, 2, 3]);
        write_solid_png(&src.path().join("b/berry.png"), [4, 5, 6]);

        let class_dir = out.path().join("Ripe");
        assert_eq!(destination_candidate(&class_dir, Path::new("x/berry.png"), 0), class_dir.join("berry.png"));
        assert_eq!(destination_candidate(&class_dir, Path::new("x/berry.png"), 2), class_dir.join("berry_2.png"));

        // 既存ファイルは上書きされない
        let labels = LabelSet::new(["Ripe"]).unwrap();
        let pool = vec![
            LabeledSample::new(src.path().join("a/berry.png"), "Ripe"),
            LabeledSample::new(src.path().join("b/berry.png"), "Ripe"),
        ];
        let root = out.path().join("dataset");
        let split = DataCurator::new(&root, labels, 0.5, 1).unwrap().curate(&pool).unwrap();
        assert_eq!(split.train.len(), 1);
        assert_eq!(split.validation.len(), 1);

        let again = DataCurator::new(&root, LabelSet::new(["Ripe"]).unwrap(), 0.5, 1)
            .unwrap()
            .curate(&pool)
            .unwrap();
        let names: HashSet<_> = again
            .train
            .iter()
            .chain(&again.validation)
            .map(|s| s.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.contains("berry_1.png"));
        assert_eq!(list_images(&root.join(TRAIN_DIR).join("Ripe")).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_class_is_rejected() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let path = src.path().join("ripe.png");
        write_solid_png(&path, [200, 30, 30]);

        let result = DataCurator::new(out.path(), two_labels(), 0.8, 42)
            .unwrap()
            .curate(&[LabeledSample::new(path, "Ripe")]);
        assert!(matches!(result, Err(VisionError::EmptyClass(label)) if label == "Unripe"));
    }

    #[test]
    fn test_undeclared_label_and_bad_ratio() {
        assert!(matches!(
            DataCurator::new("out", two_labels(), 1.0, 0),
            Err(VisionError::Configuration(_))
        ));
        let curator = DataCurator::new("out", two_labels(), 0.5, 0).unwrap();
        assert!(matches!(
            curator.curate(&[LabeledSample::new("x.png", "Overripe")]),
            Err(VisionError::Configuration(_))
        ));
    }

    #[test]
    fn test_from_directory_reads_layout() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let pool = make_pool(src.path(), 3);
        let curated = DataCurator::new(out.path(), two_labels(), 0.5, 9)
            .unwrap()
            .with_placement(Placement::HardLink)
            .curate(&pool)
            .unwrap();
        fs::create_dir_all(out.path().join("train/Stray")).unwrap();

        let scanned = TrainValSplit::from_directory(out.path(), &two_labels()).unwrap();
        assert_eq!(scanned.train.len(), curated.train.len());
        assert_eq!(scanned.validation.len(), curated.validation.len());

        let counts = scanned.class_counts();
        assert_eq!(counts.iter().map(|(_, t, v)| t + v).sum::<usize>(), 6);
        assert_eq!(count_by_label(&scanned.train).values().sum::<usize>(), 3);
    }

    #[test]
    fn test_every_class_reaches_train_side() {
        let src = tempfile::tempdir().unwrap();
        let mut pool = Vec::new();
        for i in 0..9 {
            let path = src.path().join(format!("ripe_{}.png", i));
            write_solid_png(&path, [200, 30, 30]);
            pool.push(LabeledSample::new(path, "Ripe"));
        }
        let lone = src.path().join("unripe_0.png");
        write_solid_png(&lone, [30, 200, 30]);
        pool.push(LabeledSample::new(lone, "Unripe"));

        for seed in 0..20 {
            let out = tempfile::tempdir().unwrap();
            let split = DataCurator::new(out.path(), two_labels(), 0.8, seed)
                .unwrap()
                .curate(&pool)
                .unwrap();
            let counts = count_by_label(&split.train);
            assert_eq!(counts.get("Unripe"), Some(&1), "seed {}", seed);
            assert_eq!(split.train.len(), 8, "seed {}", seed);
            assert_eq!(split.validation.len(), 2, "seed {}", seed);
        }
    }

    #[test]
    fn test_train_quotas() {
        assert_eq!(train_quotas(&[5, 5], 0.7), vec![4, 3]);
        assert_eq!(train_quotas(&[9, 1], 0.8), vec![7, 1]);
        assert_eq!(train_quotas(&[1, 1, 1], 0.2), vec![1, 1, 1]);
        assert_eq!(train_quotas(&[10, 3, 2], 0.5), vec![5, 2, 1]);
        let quotas = train_quotas(&[7, 6, 4, 3], 0.75);
        assert_eq!(quotas.iter().sum::<usize>(), 15);
        assert!(quotas.iter().zip([7, 6, 4, 3]).all(|(&q, n)| q >= 1 && q <= n));
    }

    #[test]
    fn test_missing_source_writes_nothing() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut pool = make_pool(src.path(), 2);
        let extra = src.path().join("ripe_extra.png");
        write_solid_png(&extra, [210, 40, 40]);
        pool.push(LabeledSample::new(extra, "Ripe"));
        pool.push(LabeledSample::new(src.path().join("gone.png"), "Unripe"));

        let root = out.path().join("dataset");
        let result = DataCurator::new(&root, two_labels(), 0.5, 3).unwrap().curate(&pool);
        assert!(matches!(result, Err(VisionError::InvalidImage { .. })));
        assert!(!root.exists());

        // 修正後の再実行で重複が生まれない
        pool.pop();
        let split = DataCurator::new(&root, two_labels(), 0.5, 3).unwrap().curate(&pool).unwrap();
        assert_eq!(split.train.len() + split.validation.len(), pool.len());
        let on_disk: usize = ["train/Ripe", "train/Unripe", "validation/Ripe", "validation/Unripe"]
            .iter()
            .map(|side| list_images(&root.join(side)).unwrap().len())
            .sum();
        assert_eq!(on_disk, pool.len());
    }

    #[test]
    fn test_existing_file_is_never_overwritten() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let source = src.path().join("berry.png");
        write_solid_png(&source, [9, 9, 9]);
        let labels = LabelSet::new(["Ripe"]).unwrap();
        let pool = vec![LabeledSample::new(source, "Ripe")];

        for placement in [Placement::Copy, Placement::HardLink] {
            let root = out.path().join(format!("{:?}", placement));
            let class_dir = root.join(TRAIN_DIR).join("Ripe");
            fs::create_dir_all(&class_dir).unwrap();
            fs::write(class_dir.join("berry.png"), b"taken").unwrap();

            let split = DataCurator::new(&root, labels.clone(), 0.5, 0)
                .unwrap()
                .with_placement(placement)
                .curate(&pool)
                .unwrap();
            assert_eq!(split.train[0].path, class_dir.join("berry_1.png"));
            assert_eq!(fs::read(class_dir.join("berry.png")).unwrap(), b"taken");
            assert!(image::open(&split.train[0].path).is_ok());
        }
    }

    #[test]
    fn test_from_directory_rejects_empty_train_class() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let pool = make_pool(src.path(), 2);
        DataCurator::new(out.path(), two_labels(), 0.5, 4)
            .unwrap()
            .curate(&pool)
            .unwrap();
        for path in list_images(&out.path().join("train/Unripe")).unwrap() {
            fs::remove_file(path).unwrap();
        }

        let result = TrainValSplit::from_directory(out.path(), &two_labels());
        assert!(matches!(result, Err(VisionError::EmptyClass(label)) if label == "Unripe"));
    }
}
