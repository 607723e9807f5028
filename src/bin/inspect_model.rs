//! モデルアーティファクトの内容を表示する開発用バイナリ

use coffee_vision_lib::model::{load_model_with_metadata, print_metadata_info};
use std::path::PathBuf;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let model_path = if args.len() > 1 {
        PathBuf::from(&args[1])
    } else {
        PathBuf::from("models/coffee_ripeness.tar.gz")
    };

    println!("=== モデル情報: {} ===", model_path.display());

    match load_model_with_metadata(&model_path) {
        Ok((metadata, binary)) => {
            println!("✓ 読み込み成功");
            print_metadata_info(&metadata);
            println!(
                "重みのサイズ: {} バイト ({:.2} MB)",
                binary.len(),
                binary.len() as f64 / 1024.0 / 1024.0
            );
        }
        Err(e) => {
            eprintln!("✗ エラー: {:#}", e);
            std::process::exit(1);
        }
    }
}
