//! 学習データの整理
//!
//! ラベル付き画像を `<root>/{train,validation}/<ラベル>/` に振り分け、
//! 学習時にだけデータ拡張を適用します。

pub mod augmentation;
pub mod curator;

pub use augmentation::AugmentationPolicy;
pub use curator::{DataCurator, Placement, TrainValSplit, TRAIN_DIR, VALIDATION_DIR};

use std::path::{Path, PathBuf};

/// 受け付ける画像拡張子
pub const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// ディレクトリ直下の画像ファイルをパス順に列挙
pub fn list_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_image_file() {
        assert!(is_image_file(Path::new("a/berry.PNG")));
        assert!(is_image_file(Path::new("berry.jpeg")));
        assert!(is_image_file(Path::new("berry.gif")));
        assert!(!is_image_file(Path::new("berry.txt")));
        assert!(!is_image_file(Path::new("berry")));
    }
}
