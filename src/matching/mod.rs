//! 最近傍による個体照合
//!
//! 登録済みの参照ベクトルとの距離から、一番近い個体と受理/棄却を決めます。

pub mod gallery;

pub use gallery::{Gallery, GalleryEntry, GalleryStore, MatchResult, UNKNOWN_LABEL};
