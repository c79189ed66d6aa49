//! Darknet 形式のネットワーク定義 (cfg) を読み込むモジュール
//!
//! `[section]` 行で新しいレイヤ定義が始まり、続く `key=value` 行がそのレイヤの設定になります。
//! `#` で始まる行と空行は無視されます。最初のセクションはネットワーク全体の設定 (`[net]`) です。

use std::path::Path;

use log::warn;

use crate::error::{DarknetError, Result};

/// 1レイヤ分の設定
///
/// 値は文字列のまま保持し、数値としての検証はグラフ構築時に行います。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    options: Vec<(String, String)>,
}

impl LayerSpec {
    /// 新しい `LayerSpec` を作成します。`type` キーにはレイヤタイプが入ります。
    pub fn new(kind: &str) -> Self {
        Self {
            options: vec![("type".to_string(), kind.to_string())],
        }
    }

    /// レイヤタイプ (`convolutional`, `route` など)
    pub fn kind(&self) -> &str {
        self.get("type").unwrap_or_default()
    }

    /// キーに対応する値を取得します。
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// キーと値を追加します。既にあるキーは位置を保ったまま値を上書きします。
    pub fn insert(&mut self, key: &str, value: &str) {
        match self.options.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.options.push((key.to_string(), value.to_string())),
        }
    }

    /// 設定を記述順に列挙します。
    pub fn options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// cfg テキストをレイヤ設定の列に変換します。
///
/// # Args
/// * `text` - cfg ファイルの内容
///
/// # Return
/// * セクションの記述順に並んだ `LayerSpec` の列 (先頭は `[net]`)
pub fn parse_cfg(text: &str) -> Result<Vec<LayerSpec>> {
    let mut blocks: Vec<LayerSpec> = Vec::new();

    for (line_idx, raw) in text.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let kind = header.strip_suffix(']').ok_or_else(|| DarknetError::Parse {
                line: line_no,
                message: format!("unterminated section header `{}`", line),
            })?;
            let kind = kind.trim();
            if kind.is_empty() {
                return Err(DarknetError::Parse {
                    line: line_no,
                    message: "empty section header".to_string(),
                });
            }
            blocks.push(LayerSpec::new(kind));
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| DarknetError::Parse {
            line: line_no,
            message: format!("expected `key=value`, got `{}`", line),
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(DarknetError::Parse {
                line: line_no,
                message: format!("empty key in `{}`", line),
            });
        }

        match blocks.last_mut() {
            Some(block) => block.insert(key, value.trim()),
            None => {
                return Err(DarknetError::Parse {
                    line: line_no,
                    message: format!("`{}` appears before any section", line),
                })
            }
        }
    }

    if blocks.is_empty() {
        return Err(DarknetError::Parse {
            line: 0,
            message: "no [section] headers found".to_string(),
        });
    }
    Ok(blocks)
}

/// cfg ファイルを読み込みます。
pub fn read_cfg<P: AsRef<Path>>(path: P) -> Result<Vec<LayerSpec>> {
    let text = std::fs::read_to_string(path)?;
    parse_cfg(&text)
}

/// ネットワーク全体の設定 (`[net]` セクション)
#[derive(Debug, Clone, PartialEq)]
pub struct NetInfo {
    /// 入力の幅
    pub width: usize,
    /// 入力の高さ
    pub height: usize,
    /// 入力のチャネル数
    pub channels: usize,
    spec: LayerSpec,
}

impl NetInfo {
    /// `[net]` セクションから `NetInfo` を作成します。
    ///
    /// `height` と `width` は必須で、`channels` は省略すると 3 になります。
    pub fn from_spec(spec: &LayerSpec) -> Result<Self> {
        if !matches!(spec.kind(), "net" | "network") {
            warn!("first section is [{}], treating it as [net]", spec.kind());
        }

        let dim = |key: &'static str| -> Result<usize> {
            let value = spec.get(key).ok_or(DarknetError::MissingKey {
                index: 0,
                kind: "net",
                key,
            })?;
            match value.parse::<usize>() {
                Ok(v) if v > 0 => Ok(v),
                _ => Err(DarknetError::InvalidValue {
                    index: 0,
                    kind: "net",
                    key,
                    value: value.to_string(),
                }),
            }
        };

        let channels = match spec.get("channels") {
            Some(_) => dim("channels")?,
            None => 3,
        };

        Ok(Self {
            width: dim("width")?,
            height: dim("height")?,
            channels,
            spec: spec.clone(),
        })
    }

    /// 元の `[net]` セクション
    pub fn spec(&self) -> &LayerSpec {
        &self.spec
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.spec.get(key)
    }
}
