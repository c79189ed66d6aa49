//! Darknet 形式の重みファイルを読み込むモジュール
//!
//! ファイルの先頭 20 バイトは 5 つの 32 ビット整数のヘッダで、その後ろは f32 (リトルエンディアン) の列です。
//! f32 の列は畳み込みレイヤの順に、そのレイヤのパラメータが決められた順序で並んでいます。

use std::ffi::OsStr;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use log::{debug, info};

use crate::error::{DarknetError, Result};
use crate::layer::LayerNode;

/// ヘッダのバイト数
pub const HEADER_SIZE: usize = 5 * 4;

/// 重みファイルのヘッダ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightHeader {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    /// 学習時に処理した画像の枚数
    pub seen: u64,
}

impl WeightHeader {
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(DarknetError::TruncatedHeader { len: bytes.len() });
        }
        let words: Vec<u32> = bytes[..HEADER_SIZE]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(Self {
            major: words[0],
            minor: words[1],
            revision: words[2],
            seen: u64::from(words[3]) | (u64::from(words[4]) << 32),
        })
    }
}

/// ヘッダと f32 の列に分けた重みファイル
#[derive(Debug, Clone, PartialEq)]
pub struct WeightFile {
    pub header: WeightHeader,
    pub values: Vec<f32>,
}

impl WeightFile {
    /// バイト列を重みファイルとして解釈します。
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = WeightHeader::from_bytes(bytes)?;
        let payload = &bytes[HEADER_SIZE..];
        if payload.len() % 4 != 0 {
            return Err(DarknetError::MisalignedWeights { len: payload.len() });
        }
        let values = payload
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(Self { header, values })
    }

    /// 重みファイルを読み込みます。
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// gzip 圧縮された tar アーカイブから、最初の `.weights` ファイルを読み込みます。
    pub fn read_archive<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path)?));

        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path()?.into_owned();
            if entry_path.extension() != Some(OsStr::new("weights")) {
                debug!("skip archive entry {}", entry_path.display());
                continue;
            }
            info!("reading {} from {}", entry_path.display(), path.display());
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Self::from_bytes(&buf);
        }
        Err(DarknetError::ArchiveEntryNotFound(path.to_path_buf()))
    }
}

/// f32 の列を先頭から順に切り出すリーダ
pub struct WeightReader<'a> {
    values: &'a [f32],
    cursor: usize,
}

impl<'a> WeightReader<'a> {
    pub fn new(values: &'a [f32]) -> Self {
        Self { values, cursor: 0 }
    }

    /// 読み込んだ float の数
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.values.len() - self.cursor
    }

    /// `len` 個の float を切り出してカーソルを進めます。
    ///
    /// # Args
    /// * `len` - 切り出す数
    /// * `index` - 読み込み中のレイヤ番号 (エラー用)
    /// * `kind` - 読み込み中のレイヤタイプ (エラー用)
    pub fn take(&mut self, len: usize, index: usize, kind: &'static str) -> Result<&'a [f32]> {
        if len > self.remaining() {
            return Err(DarknetError::TruncatedWeightFile {
                index,
                kind,
                needed: len,
                remaining: self.remaining(),
            });
        }
        let block = &self.values[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(block)
    }
}

/// レイヤが重みファイルから読む float の総数
pub fn num_params(layers: &[LayerNode]) -> usize {
    layers
        .iter()
        .map(|layer| match layer {
            LayerNode::Convolutional(conv) => conv.num_params(),
            _ => 0,
        })
        .sum()
}

/// f32 の列を畳み込みレイヤのパラメータに順に割り当てます。
///
/// 列の過不足はどちらもエラーです。エラーの場合、それまでのレイヤには値が書き込まれたままになります。
pub fn load_into(layers: &mut [LayerNode], values: &[f32]) -> Result<()> {
    let mut reader = WeightReader::new(values);
    for (index, layer) in layers.iter_mut().enumerate() {
        if let LayerNode::Convolutional(conv) = layer {
            conv.load(index, &mut reader)?;
        }
    }

    if reader.remaining() != 0 {
        return Err(DarknetError::TrailingWeights {
            remaining: reader.remaining(),
        });
    }
    info!("bound {} weight values", reader.position());
    Ok(())
}
