//! 登録済みの特徴ベクトルとの最近傍照合
//!
//! 最も近いエントリが受理半径の内側にあるときだけ、そのラベルを返します。

use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::backbone::FeatureExtractor;
use crate::dataset::is_image_file;
use crate::error::{Result, VisionError};
use crate::types::FeatureVector;

/// 棄却時に返すラベル
pub const UNKNOWN_LABEL: &str = "Unknown";

/// 登録済みの個体（ラベルと参照ベクトル）
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub label: String,
    pub reference: FeatureVector,
}

impl GalleryEntry {
    pub fn new(label: impl Into<String>, reference: FeatureVector) -> Self {
        Self {
            label: label.into(),
            reference,
        }
    }
}

/// 照合結果
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// 受理時は最近傍のラベル、棄却時は "Unknown"
    pub label: String,
    /// 最近傍までの距離
    pub distance: f32,
    pub accepted: bool,
    /// 最近傍エントリの登録順インデックス
    pub nearest_index: usize,
    /// 判定に使った受理半径
    pub acceptance_radius: f32,
}

/// 参照ベクトルの集合
///
/// 構築後は変更しません。入れ替えは [`GalleryStore::reload`] で行います。
#[derive(Debug, Clone)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    acceptance_radius: f32,
}

impl Gallery {
    /// エントリ集合から構築
    ///
    /// 空の集合、正の有限値でない半径、長さの揃わない参照ベクトルは ConfigurationError です。
    pub fn build(entries: Vec<GalleryEntry>, acceptance_radius: f32) -> Result<Self> {
        if entries.is_empty() {
            return Err(VisionError::Configuration("gallery has no entries".into()));
        }
        if !(acceptance_radius.is_finite() && acceptance_radius > 0.0) {
            return Err(VisionError::Configuration(format!(
                "acceptance radius {} must be a positive number",
                acceptance_radius
            )));
        }
        let feature_len = entries[0].reference.len();
        if let Some(entry) = entries.iter().find(|e| e.reference.len() != feature_len) {
            return Err(VisionError::Configuration(format!(
                "reference for '{}' has length {}, expected {}",
                entry.label,
                entry.reference.len(),
                feature_len
            )));
        }

        Ok(Self {
            entries,
            acceptance_radius,
        })
    }

    /// フォルダの画像から構築
    ///
    /// 直下の画像はファイル名（拡張子なし）を、サブフォルダ内の画像はフォルダ名を
    /// 個体名とします。登録順はパスの辞書順です。
    pub fn from_directory(
        dir: &Path,
        extractor: &dyn FeatureExtractor,
        acceptance_radius: f32,
    ) -> Result<Self> {
        let mut images: Vec<(String, PathBuf)> = Vec::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                let Some(identity) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                    continue;
                };
                for inner in fs::read_dir(&path)? {
                    let inner = inner?.path();
                    if inner.is_file() && is_image_file(&inner) {
                        images.push((identity.clone(), inner));
                    }
                }
            } else if is_image_file(&path) {
                if let Some(stem) = path.file_stem() {
                    images.push((stem.to_string_lossy().to_string(), path.clone()));
                }
            }
        }
        images.sort_by(|a, b| a.1.cmp(&b.1));

        let mut entries = Vec::with_capacity(images.len());
        for (label, path) in images {
            match extractor.extract_path(&path) {
                Ok(reference) => entries.push(GalleryEntry::new(label, reference)),
                Err(e @ VisionError::InvalidImage { .. }) => {
                    warn!("ギャラリー画像をスキップします: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        info!("ギャラリーに {} 件を登録しました: {}", entries.len(), dir.display());
        Self::build(entries, acceptance_radius)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn acceptance_radius(&self) -> f32 {
        self.acceptance_radius
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    /// 登録順のラベル一覧（重複を含む）
    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.label.as_str()).collect()
    }

    /// 全エントリまでの距離（登録順）
    pub fn distances(&self, query: &FeatureVector) -> Result<Vec<f32>> {
        self.entries
            .iter()
            .map(|e| query.euclidean_distance(&e.reference))
            .collect()
    }

    /// 受理半径内にあるエントリのインデックス
    pub fn candidates(&self, query: &FeatureVector) -> Result<Vec<usize>> {
        Ok(self
            .distances(query)?
            .into_iter()
            .enumerate()
            .filter(|(_, d)| *d <= self.acceptance_radius)
            .map(|(i, _)| i)
            .collect())
    }

    /// クエリに最も近いエントリを選び、受理半径で判定する
    ///
    /// 同距離の場合は先に登録されたエントリを選びます。
    pub fn match_query(&self, query: &FeatureVector) -> Result<MatchResult> {
        let distances = self.distances(query)?;

        let mut nearest_index = 0;
        for (i, d) in distances.iter().enumerate() {
            if *d < distances[nearest_index] {
                nearest_index = i;
            }
        }
        let distance = distances[nearest_index];
        let accepted = distance <= self.acceptance_radius;

        let label = if accepted {
            self.entries[nearest_index].label.clone()
        } else {
            UNKNOWN_LABEL.to_string()
        };

        Ok(MatchResult {
            label,
            distance,
            accepted,
            nearest_index,
            acceptance_radius: self.acceptance_radius,
        })
    }
}

/// プロセス全体で共有するギャラリー
///
/// 読み手はスナップショット（`Arc`）を取得して照合し、再読み込みは
/// 全体を一度に差し替えます。
#[derive(Debug)]
pub struct GalleryStore {
    current: RwLock<Arc<Gallery>>,
}

impl GalleryStore {
    pub fn new(gallery: Gallery) -> Self {
        Self {
            current: RwLock::new(Arc::new(gallery)),
        }
    }

    pub fn snapshot(&self) -> Arc<Gallery> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// ギャラリーを丸ごと差し替え、以前のものを返す
    pub fn reload(&self, gallery: Gallery) -> Arc<Gallery> {
        let next = Arc::new(gallery);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_solid_png, ColorStatsExtractor};
    use approx::assert_relative_eq;

    fn fv(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    fn ann_and_bob() -> Gallery {
        Gallery::build(
            vec![
                GalleryEntry::new("Ann", fv(&[0.0, 0.0])),
                GalleryEntry::new("Bob", fv(&[10.0, 10.0])),
            ],
            3.0,
        )
        .unwrap()
    }

    #[test]
    fn test_singleton_matches_itself() {
        let v = fv(&[0.3, -1.2, 4.5]);
        let gallery = Gallery::build(vec![GalleryEntry::new("Ann", v.clone())], 0.6).unwrap();
        let result = gallery.match_query(&v).unwrap();
        assert_eq!(result.label, "Ann");
        assert_eq!(result.distance, 0.0);
        assert!(result.accepted);
    }

    #[test]
    fn test_ann_and_bob_scenario() {
        let gallery = ann_and_bob();

        let near_ann = gallery.match_query(&fv(&[0.5, 0.5])).unwrap();
        assert_eq!(near_ann.label, "Ann");
        assert_relative_eq!(near_ann.distance, 0.70710677, epsilon = 1e-4);
        assert!(near_ann.accepted);

        let between = gallery.match_query(&fv(&[6.0, 6.0])).unwrap();
        assert_eq!(between.label, UNKNOWN_LABEL);
        assert_eq!(between.nearest_index, 1);
        assert_relative_eq!(between.distance, 5.656854, epsilon = 1e-4);
        assert!(!between.accepted);
    }

    #[test]
    fn test_radius_boundary() {
        let gallery = Gallery::build(vec![GalleryEntry::new("Ann", fv(&[0.0, 0.0]))], 3.0).unwrap();
        let eps = 1e-3;

        assert!(gallery.match_query(&fv(&[3.0 - eps, 0.0])).unwrap().accepted);
        assert!(gallery.match_query(&fv(&[3.0, 0.0])).unwrap().accepted);
        assert!(!gallery.match_query(&fv(&[3.0 + eps, 0.0])).unwrap().accepted);
    }

    #[test]
    fn test_tie_prefers_first_registered() {
        let gallery = Gallery::build(
            vec![
                GalleryEntry::new("Ann", fv(&[-1.0, 0.0])),
                GalleryEntry::new("Bob", fv(&[1.0, 0.0])),
            ],
            2.0,
        )
        .unwrap();
        let result = gallery.match_query(&fv(&[0.0, 0.0])).unwrap();
        assert_eq!(result.label, "Ann");
        assert_eq!(result.nearest_index, 0);
    }

    #[test]
    fn test_candidates() {
        let gallery = ann_and_bob();
        assert_eq!(gallery.candidates(&fv(&[0.5, 0.5])).unwrap(), vec![0]);
        assert!(gallery.candidates(&fv(&[6.0, 6.0])).unwrap().is_empty());
    }

    #[test]
    fn test_build_validation() {
        assert!(matches!(
            Gallery::build(Vec::new(), 1.0),
            Err(VisionError::Configuration(_))
        ));
        assert!(matches!(
            Gallery::build(vec![GalleryEntry::new("Ann", fv(&[0.0]))], 0.0),
            Err(VisionError::Configuration(_))
        ));
        assert!(matches!(
            Gallery::build(
                vec![
                    GalleryEntry::new("Ann", fv(&[0.0])),
                    GalleryEntry::new("Bob", fv(&[0.0, 1.0])),
                ],
                1.0
            ),
            Err(VisionError::Configuration(_))
        ));
    }

    #[test]
    fn test_query_length_mismatch() {
        let gallery = ann_and_bob();
        assert!(matches!(
            gallery.match_query(&fv(&[0.0, 0.0, 0.0])),
            Err(VisionError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_solid_png(&dir.path().join("carol.png"), [255, 0, 0]);
        fs::create_dir(dir.path().join("dave")).unwrap();
        write_solid_png(&dir.path().join("dave/front.png"), [0, 0, 255]);
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let gallery = Gallery::from_directory(dir.path(), &ColorStatsExtractor, 0.1).unwrap();
        assert_eq!(gallery.labels(), vec!["carol", "dave"]);

        let red = ColorStatsExtractor.extract_path(&dir.path().join("carol.png")).unwrap();
        assert_eq!(gallery.match_query(&red).unwrap().label, "carol");
    }

    #[test]
    fn test_store_reload_swaps_snapshot() {
        let store = GalleryStore::new(ann_and_bob());
        let before = store.snapshot();

        let replacement =
            Gallery::build(vec![GalleryEntry::new("Eve", fv(&[6.0, 6.0]))], 3.0).unwrap();
        store.reload(replacement);

        assert_eq!(before.len(), 2);
        let after = store.snapshot();
        assert_eq!(after.match_query(&fv(&[6.0, 6.0])).unwrap().label, "Eve");
    }
}
