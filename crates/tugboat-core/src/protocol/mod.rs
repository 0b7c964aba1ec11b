//! プロトコルアダプタ
//!
//! Engine API のリクエストパラメータを検証し、`OperationSpec` に変換します。
//! サポートしていない値が一つでもあれば、何も確保する前にエラーを返します。
//! 操作ごとの変換処理はモジュールに分離されています。

mod build;
mod image;

pub use build::parse_build;
pub use image::{parse_inspect, parse_pull, parse_tag};

use crate::error::ParamError;
use crate::model::OperationKind;

/// クエリパラメータ（同じキーの繰り返しを保持する）
#[derive(Debug, Clone, Default)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// 最初の値
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// 空文字列は未指定として扱う
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// 操作ごとのヘルプテキスト（サポートしている引数の一覧 + 違反内容）
pub fn help_text(kind: OperationKind, err: &ParamError) -> String {
    let supported = match kind {
        OperationKind::Build => {
            "tugboat builds only support these arguments: context, t, buildargs, labels, \
             cachefrom (one entry), cpuperiod, cpuquota, dockerfile, memory, nocache and target"
        }
        OperationKind::Pull => {
            "tugboat pulls only support these arguments: fromImage and tag \
             (repo, fromSrc, message and platform are not supported)"
        }
        OperationKind::Tag => "tugboat tags only support these arguments: repo and tag",
        OperationKind::Inspect => "tugboat inspects only support an image name",
    };

    format!("\n{}\n{}\n", supported, err)
}
