//! レイヤ設定の列から実行可能なレイヤの列を組み立てるモジュール

use std::str::FromStr;

use candle_core::Device;
use log::debug;

use crate::cfg::LayerSpec;
use crate::error::{DarknetError, Result};
use crate::layer::{Activation, Convolutional, LayerNode, Route, Shortcut, Upsample};
use crate::yolo::{Anchor, Yolo};

/// 組み立て途中の状態
///
/// `channels[i]` は `layers[i]` の出力チャネル数です。
#[derive(Debug)]
struct BuildState {
    layers: Vec<LayerNode>,
    channels: Vec<usize>,
    prev_channels: usize,
}

impl BuildState {
    fn push(mut self, node: LayerNode, channels: usize) -> Self {
        debug!(
            "layer {}: {} -> {} channels",
            self.layers.len(),
            node.kind(),
            channels
        );
        self.layers.push(node);
        self.channels.push(channels);
        self.prev_channels = channels;
        self
    }
}

/// 組み立てたレイヤの列と、各レイヤの出力チャネル数
#[derive(Debug)]
pub struct Graph {
    pub layers: Vec<LayerNode>,
    pub channels: Vec<usize>,
}

/// レイヤ設定の列 (`[net]` を除く) からレイヤを組み立てます。
///
/// # Args
/// * `specs` - `[net]` を除いたレイヤ設定の列
/// * `in_channels` - ネットワークへの入力のチャネル数
/// * `device` - パラメータを置くデバイス
///
/// # Return
/// * レイヤの列と、同じ添字で並んだ出力チャネル数の列
pub fn build_graph(specs: &[LayerSpec], in_channels: usize, device: &Device) -> Result<Graph> {
    let init = BuildState {
        layers: Vec::with_capacity(specs.len()),
        channels: Vec::with_capacity(specs.len()),
        prev_channels: in_channels,
    };

    let state = specs
        .iter()
        .enumerate()
        .try_fold(init, |state, (index, spec)| {
            let (node, channels) = build_layer(index, spec, &state, device)?;
            Ok::<_, DarknetError>(state.push(node, channels))
        })?;

    Ok(Graph {
        layers: state.layers,
        channels: state.channels,
    })
}

fn build_layer(
    index: usize,
    spec: &LayerSpec,
    state: &BuildState,
    device: &Device,
) -> Result<(LayerNode, usize)> {
    match spec.kind() {
        "convolutional" => {
            let kind = "convolutional";
            let filters: usize = required(spec, index, kind, "filters")?;
            let kernel: usize = required(spec, index, kind, "size")?;
            let stride: usize = required(spec, index, kind, "stride")?;
            let pad: i64 = required(spec, index, kind, "pad")?;
            let activation = match required::<String>(spec, index, kind, "activation")?.as_str() {
                "leaky" => Activation::Leaky,
                _ => Activation::Linear,
            };
            let batch_normalize = match spec.get("batch_normalize") {
                Some(_) => required::<i64>(spec, index, kind, "batch_normalize")? != 0,
                None => false,
            };
            if filters == 0 {
                return Err(invalid(spec, index, kind, "filters"));
            }
            if kernel == 0 {
                return Err(invalid(spec, index, kind, "size"));
            }
            if stride == 0 {
                return Err(invalid(spec, index, kind, "stride"));
            }
            let padding = if pad != 0 { (kernel - 1) / 2 } else { 0 };

            let conv = Convolutional::new(
                state.prev_channels,
                filters,
                kernel,
                stride,
                padding,
                batch_normalize,
                activation,
                device,
            )?;
            Ok((LayerNode::Convolutional(conv), filters))
        }
        "upsample" => {
            let scale: usize = required(spec, index, "upsample", "stride")?;
            if scale == 0 {
                return Err(invalid(spec, index, "upsample", "stride"));
            }
            Ok((LayerNode::Upsample(Upsample { scale }), state.prev_channels))
        }
        "route" => {
            let kind = "route";
            let values: Vec<isize> = list(spec, index, kind, "layers")?;
            if values.is_empty() || values.len() > 2 {
                return Err(invalid(spec, index, kind, "layers"));
            }
            // 0 以上の値は絶対位置なので相対位置に直す
            let offsets = values
                .into_iter()
                .map(|v| if v >= 0 { v - index as isize } else { v })
                .collect::<Vec<_>>();

            let mut channels = 0;
            for &offset in &offsets {
                channels += state.channels[resolve(index, offset, kind)?];
            }
            Ok((LayerNode::Route(Route { offsets }), channels))
        }
        "shortcut" => {
            let kind = "shortcut";
            let from: isize = required(spec, index, kind, "from")?;
            resolve(index, -1, kind)?;
            resolve(index, from, kind)?;
            Ok((LayerNode::Shortcut(Shortcut { from }), state.prev_channels))
        }
        "yolo" => {
            let kind = "yolo";
            let mask: Vec<usize> = list(spec, index, kind, "mask")?;
            let values: Vec<f32> = list(spec, index, kind, "anchors")?;
            let classes: usize = required(spec, index, kind, "classes")?;
            if values.len() % 2 != 0 {
                return Err(invalid(spec, index, kind, "anchors"));
            }
            let all: Vec<Anchor> = values
                .chunks_exact(2)
                .map(|wh| Anchor {
                    width: wh[0],
                    height: wh[1],
                })
                .collect();
            let anchors = mask
                .iter()
                .map(|&m| all.get(m).copied())
                .collect::<Option<Vec<_>>>()
                .filter(|a| !a.is_empty())
                .ok_or_else(|| invalid(spec, index, kind, "mask"))?;

            Ok((LayerNode::Yolo(Yolo { anchors, classes }), state.prev_channels))
        }
        other => Err(DarknetError::UnsupportedLayer {
            index,
            kind: other.to_string(),
        }),
    }
}

/// 相対位置を絶対位置に直します。自分より前のレイヤを指していない場合はエラーです。
fn resolve(index: usize, offset: isize, kind: &'static str) -> Result<usize> {
    let target = index as isize + offset;
    if offset >= 0 || target < 0 {
        return Err(DarknetError::LayerIndex {
            index,
            kind,
            reference: offset,
        });
    }
    Ok(target as usize)
}

fn invalid(spec: &LayerSpec, index: usize, kind: &'static str, key: &'static str) -> DarknetError {
    DarknetError::InvalidValue {
        index,
        kind,
        key,
        value: spec.get(key).unwrap_or_default().to_string(),
    }
}

fn required<T: FromStr>(
    spec: &LayerSpec,
    index: usize,
    kind: &'static str,
    key: &'static str,
) -> Result<T> {
    let value = spec
        .get(key)
        .ok_or(DarknetError::MissingKey { index, kind, key })?;
    value.parse().map_err(|_| invalid(spec, index, kind, key))
}

/// カンマ区切りの値を読みます。
fn list<T: FromStr>(
    spec: &LayerSpec,
    index: usize,
    kind: &'static str,
    key: &'static str,
) -> Result<Vec<T>> {
    let value = spec
        .get(key)
        .ok_or(DarknetError::MissingKey { index, kind, key })?;
    value
        .split(',')
        .map(|v| v.trim().parse())
        .collect::<std::result::Result<Vec<T>, _>>()
        .map_err(|_| invalid(spec, index, kind, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::parse_cfg;

    fn build(text: &str) -> Result<Graph> {
        let specs = parse_cfg(text)?;
        build_graph(&specs[1..], 3, &Device::Cpu)
    }

    const CONV: &str = "size=1\nstride=1\npad=1\nactivation=leaky\n";

    #[test]
    fn conv_padding_follows_pad_flag() {
        let g = build("[net]\n[convolutional]\nfilters=4\nsize=3\nstride=2\npad=1\nactivation=linear\n[convolutional]\nfilters=2\nsize=3\nstride=1\npad=0\nactivation=leaky\n").unwrap();
        match (&g.layers[0], &g.layers[1]) {
            (LayerNode::Convolutional(a), LayerNode::Convolutional(b)) => {
                assert_eq!((a.in_channels, a.padding, a.stride), (3, 1, 2));
                assert_eq!(a.activation, Activation::Linear);
                assert_eq!((b.in_channels, b.padding), (4, 0));
                assert_eq!(b.activation, Activation::Leaky);
            }
            _ => panic!("expected two convolutional layers"),
        }
        assert_eq!(g.channels, vec![4, 2]);
    }

    #[test]
    fn route_with_absolute_indices_concatenates() {
        let text = format!(
            "[net]\n[convolutional]\nfilters=8\n{CONV}[convolutional]\nfilters=16\n{CONV}[convolutional]\nfilters=4\n{CONV}[route]\nlayers=0,1\n[convolutional]\nfilters=2\n{CONV}"
        );
        let g = build(&text).unwrap();
        assert_eq!(g.channels, vec![8, 16, 4, 24, 2]);
        match &g.layers[3] {
            LayerNode::Route(r) => assert_eq!(r.offsets, vec![-3, -2]),
            _ => panic!("expected route"),
        }
        match &g.layers[4] {
            LayerNode::Convolutional(c) => assert_eq!(c.in_channels, 24),
            _ => panic!("expected convolutional"),
        }
    }

    #[test]
    fn route_with_single_negative_index_passes_through() {
        let text = format!(
            "[net]\n[convolutional]\nfilters=8\n{CONV}[convolutional]\nfilters=16\n{CONV}[route]\nlayers=-2\n"
        );
        let g = build(&text).unwrap();
        assert_eq!(g.channels, vec![8, 16, 8]);
    }

    #[test]
    fn forward_references_are_rejected() {
        let text = format!("[net]\n[convolutional]\nfilters=8\n{CONV}[route]\nlayers=1\n");
        assert!(matches!(
            build(&text),
            Err(DarknetError::LayerIndex { index: 1, kind: "route", reference: 0 })
        ));
        let text = format!("[net]\n[convolutional]\nfilters=8\n{CONV}[route]\nlayers=-5\n");
        assert!(matches!(build(&text), Err(DarknetError::LayerIndex { .. })));
        let text = format!("[net]\n[convolutional]\nfilters=8\n{CONV}[route]\nlayers=-1,3\n");
        assert!(matches!(build(&text), Err(DarknetError::LayerIndex { .. })));
    }

    #[test]
    fn shortcut_keeps_previous_channels() {
        let text = format!(
            "[net]\n[convolutional]\nfilters=8\n{CONV}[convolutional]\nfilters=8\n{CONV}[shortcut]\nfrom=-2\nactivation=linear\n"
        );
        let g = build(&text).unwrap();
        assert_eq!(g.channels, vec![8, 8, 8]);
        let text = "[net]\n[shortcut]\nfrom=-1\n";
        assert!(matches!(build(text), Err(DarknetError::LayerIndex { .. })));
    }

    #[test]
    fn yolo_selects_masked_anchors() {
        let text = format!(
            "[net]\n[convolutional]\nfilters=14\n{CONV}[yolo]\nmask=2,0\nanchors=10,13, 16,30, 33,23\nclasses=2\n"
        );
        let g = build(&text).unwrap();
        match &g.layers[1] {
            LayerNode::Yolo(y) => {
                assert_eq!(y.classes, 2);
                assert_eq!(
                    y.anchors,
                    vec![
                        Anchor { width: 33.0, height: 23.0 },
                        Anchor { width: 10.0, height: 13.0 }
                    ]
                );
            }
            _ => panic!("expected yolo"),
        }
        assert_eq!(g.channels, vec![14, 14]);
    }

    #[test]
    fn yolo_mask_out_of_range_is_rejected() {
        let text = "[net]\n[yolo]\nmask=3\nanchors=1,2,3,4\nclasses=1\n";
        assert!(matches!(
            build(text),
            Err(DarknetError::InvalidValue { key: "mask", .. })
        ));
    }

    #[test]
    fn unsupported_layer_is_reported_with_index() {
        let text = format!("[net]\n[convolutional]\nfilters=8\n{CONV}[foo]\nbar=1\n");
        match build(&text) {
            Err(DarknetError::UnsupportedLayer { index, kind }) => {
                assert_eq!(index, 1);
                assert_eq!(kind, "foo");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn non_numeric_values_are_rejected() {
        let text = "[net]\n[convolutional]\nfilters=8\nsize=3\nstride=abc\npad=1\nactivation=leaky\n";
        match build(text) {
            Err(DarknetError::InvalidValue { index, key, value, .. }) => {
                assert_eq!((index, key, value.as_str()), (0, "stride", "abc"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let text = "[net]\n[convolutional]\nfilters=8\nsize=3\npad=1\nactivation=leaky\n";
        assert!(matches!(
            build(text),
            Err(DarknetError::MissingKey { key: "stride", .. })
        ));
    }

    #[test]
    fn batch_normalize_zero_keeps_bias() {
        let text = format!("[net]\n[convolutional]\nbatch_normalize=0\nfilters=8\n{CONV}");
        match &build(&text).unwrap().layers[0] {
            LayerNode::Convolutional(c) => {
                assert!(c.bias().is_some());
                assert!(c.batch_norm().is_none());
            }
            _ => panic!("expected convolutional"),
        }
    }
}
