// ============================================================
// Layer 5 — SegResNet
// ============================================================
// Residual encoder-decoder for volumetric segmentation
// (Myronenko, 2018), without the VAE branch.
//
//   input [N, C_in, X, Y, Z]
//     │ conv 3×3×3 → init_filters (+ dropout)
//     ▼
//   down level 0: ResBlock × blocks_down[0]          ──┐ skip
//   down level 1: conv s2 → ResBlock × blocks_down[1] ─┐│
//   ...                                               ││
//   up level:     conv 1×1×1 (halve C) → nearest ×2 ◄─┘│ (+ skip)
//                 ResBlock × blocks_up[i]              │
//   ...                                      ◄─────────┘
//     │ GroupNorm → ReLU → conv 1×1×1 → out_channels
//     ▼
//   logits [N, C_out, X, Y, Z]
//
// Every spatial dim must be divisible by 2^(levels-1).
//
// Reference: Burn Book §3 (Building Blocks)
//            Myronenko (2018) 3D MRI brain tumor segmentation
//            using autoencoder regularization

use burn::{
    nn::{
        conv::{Conv3d, Conv3dConfig},
        Dropout, DropoutConfig,
        GroupNorm, GroupNormConfig,
        PaddingConfig3d,
    },
    prelude::*,
    tensor::activation::relu,
};

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize
#[derive(Config, Debug)]
pub struct SegResNetConfig {
    #[config(default = 1)]
    pub in_channels:   usize,
    #[config(default = 2)]
    pub out_channels:  usize,
    #[config(default = 8)]
    pub init_filters:  usize,
    #[config(default = "vec![1, 2, 2, 4]")]
    pub blocks_down:   Vec<usize>,
    #[config(default = "vec![1, 1, 1]")]
    pub blocks_up:     Vec<usize>,
    #[config(default = 8)]
    pub norm_groups:   usize,
    #[config(default = 0.0)]
    pub dropout_prob:  f64,
}

impl SegResNetConfig {
    /// Number of resolution levels.
    pub fn levels(&self) -> usize {
        self.blocks_down.len()
    }

    /// Spatial dims must be a multiple of this.
    pub fn size_divisor(&self) -> usize {
        1 << self.levels().saturating_sub(1)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> SegResNet<B> {
        let f = self.init_filters;
        let conv_init = conv3(self.in_channels, f, 1, device);

        let down: Vec<DownLevel<B>> = self
            .blocks_down
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                let channels = f << i;
                DownLevel {
                    pre_conv: (i > 0).then(|| conv3(channels / 2, channels, 2, device)),
                    blocks:   (0..n).map(|_| self.res_block(channels, device)).collect(),
                }
            })
            .collect();

        let n_up = self.levels().saturating_sub(1);
        let up: Vec<UpLevel<B>> = (0..n_up)
            .map(|i| {
                let channels = f << (n_up - i);
                let n_blocks = self.blocks_up.get(i).copied().unwrap_or(1);
                UpLevel {
                    reduce: conv1(channels, channels / 2, device),
                    blocks: (0..n_blocks).map(|_| self.res_block(channels / 2, device)).collect(),
                }
            })
            .collect();

        SegResNet {
            conv_init,
            dropout:    DropoutConfig::new(self.dropout_prob).init(),
            down,
            up,
            final_norm: GroupNormConfig::new(self.norm_groups, f).init(device),
            final_conv: conv1(f, self.out_channels, device),
        }
    }

    fn res_block<B: Backend>(&self, channels: usize, device: &B::Device) -> ResBlock<B> {
        ResBlock {
            norm1: GroupNormConfig::new(self.norm_groups, channels).init(device),
            conv1: conv3(channels, channels, 1, device),
            norm2: GroupNormConfig::new(self.norm_groups, channels).init(device),
            conv2: conv3(channels, channels, 1, device),
        }
    }
}

fn conv3<B: Backend>(c_in: usize, c_out: usize, stride: usize, device: &B::Device) -> Conv3d<B> {
    Conv3dConfig::new([c_in, c_out], [3, 3, 3])
        .with_stride([stride; 3])
        .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
        .with_bias(false)
        .init(device)
}

fn conv1<B: Backend>(c_in: usize, c_out: usize, device: &B::Device) -> Conv3d<B> {
    Conv3dConfig::new([c_in, c_out], [1, 1, 1]).init(device)
}

// ─── Building blocks ──────────────────────────────────────────────────────────
/// Pre-activation residual block: x + conv(relu(norm(conv(relu(norm(x)))))).
#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    pub norm1: GroupNorm<B>,
    pub conv1: Conv3d<B>,
    pub norm2: GroupNorm<B>,
    pub conv2: Conv3d<B>,
}

impl<B: Backend> ResBlock<B> {
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let h = self.conv1.forward(relu(self.norm1.forward(x.clone())));
        let h = self.conv2.forward(relu(self.norm2.forward(h)));
        h + x
    }
}

#[derive(Module, Debug)]
pub struct DownLevel<B: Backend> {
    /// Stride-2 conv doubling channels; absent on the first level
    pub pre_conv: Option<Conv3d<B>>,
    pub blocks:   Vec<ResBlock<B>>,
}

#[derive(Module, Debug)]
pub struct UpLevel<B: Backend> {
    pub reduce: Conv3d<B>,
    pub blocks: Vec<ResBlock<B>>,
}

#[derive(Module, Debug)]
pub struct SegResNet<B: Backend> {
    pub conv_init:  Conv3d<B>,
    pub dropout:    Dropout,
    pub down:       Vec<DownLevel<B>>,
    pub up:         Vec<UpLevel<B>>,
    pub final_norm: GroupNorm<B>,
    pub final_conv: Conv3d<B>,
}

impl<B: Backend> SegResNet<B> {
    /// x: [N, C_in, X, Y, Z] → logits [N, C_out, X, Y, Z]
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let mut x = self.dropout.forward(self.conv_init.forward(x));

        let mut skips = Vec::with_capacity(self.down.len());
        for level in &self.down {
            if let Some(conv) = &level.pre_conv {
                x = conv.forward(x);
            }
            for block in &level.blocks {
                x = block.forward(x);
            }
            skips.push(x.clone());
        }

        // deepest output is `x` itself; skips are consumed from the next level up
        skips.pop();
        for level in &self.up {
            x = upsample_nearest(level.reduce.forward(x));
            if let Some(skip) = skips.pop() {
                x = x + skip;
            }
            for block in &level.blocks {
                x = block.forward(x);
            }
        }

        self.final_conv.forward(relu(self.final_norm.forward(x)))
    }
}

/// Nearest-neighbour ×2 upsampling on every spatial axis.
///
/// Each axis is doubled on its own so no intermediate tensor has more
/// than four dimensions; the ndarray backend stops at six.
pub fn upsample_nearest<B: Backend>(x: Tensor<B, 5>) -> Tensor<B, 5> {
    let [n, c, d, h, w] = x.dims();
    let x = x
        .reshape([n * c, d, 1, h * w])
        .expand::<4, _>(Shape::new([n * c, d, 2, h * w]))
        .reshape([n * c * d * 2, h, 1, w])
        .expand::<4, _>(Shape::new([n * c * d * 2, h, 2, w]))
        .reshape([n * c * d * 2 * h * 2, w, 1])
        .expand::<3, _>(Shape::new([n * c * d * 2 * h * 2, w, 2]));
    x.reshape([n, c, d * 2, h * 2, w * 2])
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn small() -> SegResNetConfig {
        SegResNetConfig::new()
            .with_init_filters(4)
            .with_norm_groups(2)
            .with_blocks_down(vec![1, 1, 1])
            .with_blocks_up(vec![1, 1])
    }

    #[test]
    fn test_output_channels_match_classes() {
        let device = Default::default();
        let model  = small().init::<TestBackend>(&device);
        let x      = Tensor::<TestBackend, 5>::zeros([1, 1, 8, 8, 4], &device);
        assert_eq!(model.forward(x).dims(), [1, 2, 8, 8, 4]);
    }

    #[test]
    fn test_default_depth() {
        let cfg = SegResNetConfig::new();
        assert_eq!(cfg.levels(), 4);
        assert_eq!(cfg.size_divisor(), 8);
        assert_eq!(cfg.out_channels, 2);
    }

    #[test]
    fn test_upsample_nearest_repeats_voxels() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0], &device).reshape([1, 1, 2, 1, 1]);
        let y = upsample_nearest(x);
        assert_eq!(y.dims(), [1, 1, 4, 2, 2]);
        let v: Vec<f32> = y.into_data().to_vec().unwrap();
        assert_eq!(&v[..4], &[1.0; 4]);
        assert_eq!(&v[12..], &[2.0; 4]);
    }

    #[test]
    fn test_upsample_nearest_keeps_inner_axes_ordered() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0, 3.0, 4.0], &device).reshape([1, 1, 1, 2, 2]);
        let v: Vec<f32> = upsample_nearest(x).into_data().to_vec().unwrap();
        // [2, 4, 4]: each (h, w) voxel becomes a 2×2 block, repeated over both depth slices
        let slice = [
            1.0, 1.0, 2.0, 2.0,
            1.0, 1.0, 2.0, 2.0,
            3.0, 3.0, 4.0, 4.0,
            3.0, 3.0, 4.0, 4.0,
        ];
        assert_eq!(&v[..16], &slice);
        assert_eq!(&v[16..], &slice);
    }

    #[test]
    fn test_default_network_runs_on_cpu_backend() {
        let device = Default::default();
        let model  = SegResNetConfig::new().init::<TestBackend>(&device);
        let x      = Tensor::<TestBackend, 5>::ones([1, 1, 16, 16, 8], &device);
        let out    = model.forward(x);
        assert_eq!(out.dims(), [1, 2, 16, 16, 8]);
        let total: f32 = out.abs().sum().into_scalar();
        assert!(total.is_finite());
    }
}
