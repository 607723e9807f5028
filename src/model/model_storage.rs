//! モデルとメタデータの永続化
//!
//! Tar.gz形式でヘッドの重みとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（ラベル、バックボーン、次元）
//! - model.bin       - 分類ヘッドの重み（バイナリ）

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, Header};

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 保存先のパスを .tar.gz に揃える
pub fn artifact_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で保存し、実際の保存先を返す
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = artifact_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;
    let mut tar_builder = Builder::new(GzEncoder::new(tar_gz_file, Compression::default()));

    append_entry(&mut tar_builder, METADATA_ENTRY, metadata.to_json_string()?.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?
        .finish()
        .context("Failed to flush gzip stream")?;

    Ok(tar_gz_path)
}

/// アーカイブ内のエントリを名前で集める
fn read_entries(tar_gz_path: &Path, wanted: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut found = vec![None; wanted.len()];
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        if let Some(slot) = wanted.iter().position(|w| *w == name) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            found[slot] = Some(buffer);
        }
    }
    Ok(found)
}

fn parse_metadata(bytes: Option<Vec<u8>>) -> Result<ModelMetadata> {
    let bytes = bytes.ok_or_else(|| anyhow!("{} not found in tar.gz archive", METADATA_ENTRY))?;
    let json = String::from_utf8(bytes).context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(&json)
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut entries = read_entries(tar_gz_path, &[METADATA_ENTRY])?;
    parse_metadata(entries.remove(0))
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    read_entries(tar_gz_path, &[MODEL_ENTRY])?
        .remove(0)
        .ok_or_else(|| anyhow!("{} not found in tar.gz archive", MODEL_ENTRY))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut entries = read_entries(tar_gz_path, &[METADATA_ENTRY, MODEL_ENTRY])?;
    let binary = entries
        .pop()
        .flatten()
        .ok_or_else(|| anyhow!("{} not found in tar.gz archive", MODEL_ENTRY))?;
    let metadata = parse_metadata(entries.pop().flatten())?;
    Ok((metadata, binary))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("クラスラベル: {}", metadata.labels.join(", "));
    println!("バックボーン: {}", metadata.backbone);
    println!("入力サイズ: {}x{}", metadata.input_size, metadata.input_size);
    println!("特徴次元: {}", metadata.feature_len);
    println!("中間層: {}", metadata.hidden_size);
    println!("リスケール: {}", if metadata.rescale { "あり" } else { "なし" });
    println!("学習エポック数: {}", metadata.num_epochs);
    if let Some(acc) = metadata.final_val_accuracy {
        println!("検証精度: {:.2}%", acc * 100.0);
    }
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::BackboneKind;
    use crate::types::LabelSet;

    fn sample_metadata() -> ModelMetadata {
        ModelMetadata::new(&LabelSet::ripeness(), BackboneKind::Vgg19, 512, 512, true, 3, None)
    }

    #[test]
    fn test_save_and_load_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let saved = save_model_with_metadata(
            &dir.path().join("models/head"),
            &sample_metadata(),
            &[1, 2, 3, 4],
        )
        .unwrap();
        assert!(saved.to_string_lossy().ends_with("head.tar.gz"));

        let (metadata, binary) = load_model_with_metadata(&saved).unwrap();
        assert_eq!(metadata.labels.len(), 4);
        assert_eq!(binary, vec![1, 2, 3, 4]);
        assert_eq!(load_metadata(&saved).unwrap().feature_len, 512);
        assert_eq!(load_model_binary(&saved).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_missing_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tar.gz");
        let file = File::create(&path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        append_entry(&mut builder, "other.txt", b"x").unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        assert!(load_metadata(&path).is_err());
        assert!(load_model_binary(&path).is_err());
        assert!(load_model_with_metadata(&path).is_err());
    }
}
