//! ControlNet for Stable Diffusion UNets
//!
//! A trainable copy of the UNet encoder half. The control hint is encoded by a
//! small conv stack and added to the latent after `conv_in`; each encoder
//! residual and the mid-block output pass through a zero-initialised 1x1 conv
//! before being handed to the frozen UNet. Fresh weights therefore contribute
//! nothing until training moves them away from zero.
//!
//! Weight names follow the diffusers `ControlNetModel` layout so converted
//! checkpoints load directly.

use candle_core::{Module, Result, Tensor};
use candle_nn::{self as nn, Conv2d, Conv2dConfig, Init, VarBuilder};
use candle_transformers::models::stable_diffusion::{embeddings, unet_2d_blocks};

use super::config::{ControlNetConfig, UNetConfig};

/// Residuals for one forward pass, already multiplied by their control scales.
#[derive(Debug, Clone)]
pub struct ControlNetOutput {
    pub down_block_residuals: Vec<Tensor>,
    pub mid_block_residual: Tensor,
}

/// 1x1 conv whose fresh initialisation is all zeros.
fn zero_conv(channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    let weight = vb.get_with_hints((channels, channels, 1, 1), "weight", Init::Const(0.))?;
    let bias = vb.get_with_hints(channels, "bias", Init::Const(0.))?;
    Ok(Conv2d::new(weight, Some(bias), Conv2dConfig::default()))
}

fn zero_conv3x3(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    let weight = vb.get_with_hints((out_channels, in_channels, 3, 3), "weight", Init::Const(0.))?;
    let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.))?;
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    Ok(Conv2d::new(weight, Some(bias), cfg))
}

/// Encodes the pixel-space hint down to latent resolution.
#[derive(Debug)]
struct ConditioningEmbedding {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: Conv2d,
}

impl ConditioningEmbedding {
    fn new(
        vb: VarBuilder,
        conditioning_channels: usize,
        block_out_channels: &[usize],
        embedding_channels: usize,
    ) -> Result<Self> {
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let down = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };

        let conv_in = nn::conv2d(
            conditioning_channels,
            block_out_channels[0],
            3,
            same,
            vb.pp("conv_in"),
        )?;

        let vb_blocks = vb.pp("blocks");
        let mut blocks = Vec::with_capacity(2 * block_out_channels.len());
        for (i, pair) in block_out_channels.windows(2).enumerate() {
            let (c_in, c_out) = (pair[0], pair[1]);
            blocks.push(nn::conv2d(c_in, c_in, 3, same, vb_blocks.pp(2 * i))?);
            blocks.push(nn::conv2d(c_in, c_out, 3, down, vb_blocks.pp(2 * i + 1))?);
        }

        let last = block_out_channels[block_out_channels.len() - 1];
        let conv_out = zero_conv3x3(last, embedding_channels, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = self.conv_in.forward(xs)?.silu()?;
        for block in &self.blocks {
            xs = block.forward(&xs)?.silu()?;
        }
        self.conv_out.forward(&xs)
    }
}

enum DownBlock {
    Basic(unet_2d_blocks::DownBlock2D),
    CrossAttn(unet_2d_blocks::CrossAttnDownBlock2D),
}

pub struct ControlNet {
    conv_in: Conv2d,
    time_proj: embeddings::Timesteps,
    time_embedding: embeddings::TimestepEmbedding,
    cond_embedding: ConditioningEmbedding,
    down_blocks: Vec<DownBlock>,
    zero_convs: Vec<Conv2d>,
    mid_block: unet_2d_blocks::UNetMidBlock2DCrossAttn,
    mid_zero_conv: Conv2d,
    scales: Vec<f64>,
}

impl ControlNet {
    /// Build the encoder mirroring `unet`. `scales` holds one entry per down
    /// residual plus one for the mid residual.
    pub fn new(
        vb: VarBuilder,
        unet: &UNetConfig,
        control: &ControlNetConfig,
        scales: Vec<f64>,
    ) -> Result<Self> {
        let n_blocks = unet.blocks.len();
        let b_channels = unet.blocks[0].out_channels;
        let last = unet.blocks[n_blocks - 1];
        let time_embed_dim = b_channels * 4;

        if scales.len() != unet.num_down_residuals() + 1 {
            candle_core::bail!(
                "expected {} control scales, got {}",
                unet.num_down_residuals() + 1,
                scales.len()
            )
        }

        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = nn::conv2d(unet.in_channels, b_channels, 3, conv_cfg, vb.pp("conv_in"))?;
        let time_proj = embeddings::Timesteps::new(b_channels, unet.flip_sin_to_cos, unet.freq_shift);
        let time_embedding =
            embeddings::TimestepEmbedding::new(vb.pp("time_embedding"), b_channels, time_embed_dim)?;

        let cond_embedding = ConditioningEmbedding::new(
            vb.pp("controlnet_cond_embedding"),
            control.conditioning_channels,
            &control.conditioning_embedding_out_channels,
            b_channels,
        )?;

        let vb_db = vb.pp("down_blocks");
        let vb_zero = vb.pp("controlnet_down_blocks");
        let mut zero_convs = Vec::with_capacity(unet.num_down_residuals());
        zero_convs.push(zero_conv(b_channels, vb_zero.pp(0))?);

        let mut down_blocks = Vec::with_capacity(n_blocks);
        for (i, block) in unet.blocks.iter().enumerate() {
            let in_channels = if i > 0 {
                unet.blocks[i - 1].out_channels
            } else {
                b_channels
            };
            let add_downsample = i < n_blocks - 1;
            let sliced_attention_size = match unet.sliced_attention_size {
                Some(0) => Some(block.attention_head_dim / 2),
                other => other,
            };
            let db_cfg = unet_2d_blocks::DownBlock2DConfig {
                num_layers: unet.layers_per_block,
                resnet_eps: unet.norm_eps,
                resnet_groups: unet.norm_num_groups,
                add_downsample,
                downsample_padding: unet.downsample_padding,
                ..Default::default()
            };

            let down_block = match block.use_cross_attn {
                Some(transformer_layers_per_block) => {
                    let cfg = unet_2d_blocks::CrossAttnDownBlock2DConfig {
                        downblock: db_cfg,
                        attn_num_head_channels: block.attention_head_dim,
                        cross_attention_dim: unet.cross_attention_dim,
                        sliced_attention_size,
                        use_linear_projection: unet.use_linear_projection,
                        transformer_layers_per_block,
                    };
                    DownBlock::CrossAttn(unet_2d_blocks::CrossAttnDownBlock2D::new(
                        vb_db.pp(i),
                        in_channels,
                        block.out_channels,
                        Some(time_embed_dim),
                        unet.use_flash_attn,
                        cfg,
                    )?)
                }
                None => DownBlock::Basic(unet_2d_blocks::DownBlock2D::new(
                    vb_db.pp(i),
                    in_channels,
                    block.out_channels,
                    Some(time_embed_dim),
                    db_cfg,
                )?),
            };
            down_blocks.push(down_block);

            let residuals = unet.layers_per_block + usize::from(add_downsample);
            for _ in 0..residuals {
                let idx = zero_convs.len();
                zero_convs.push(zero_conv(block.out_channels, vb_zero.pp(idx))?);
            }
        }

        let mid_cfg = unet_2d_blocks::UNetMidBlock2DCrossAttnConfig {
            resnet_eps: unet.norm_eps,
            output_scale_factor: unet.mid_block_scale_factor,
            cross_attn_dim: unet.cross_attention_dim,
            attn_num_head_channels: last.attention_head_dim,
            resnet_groups: Some(unet.norm_num_groups),
            use_linear_projection: unet.use_linear_projection,
            transformer_layers_per_block: last.use_cross_attn.unwrap_or(1),
            ..Default::default()
        };
        let mid_block = unet_2d_blocks::UNetMidBlock2DCrossAttn::new(
            vb.pp("mid_block"),
            last.out_channels,
            Some(time_embed_dim),
            unet.use_flash_attn,
            mid_cfg,
        )?;
        let mid_zero_conv = zero_conv(last.out_channels, vb.pp("controlnet_mid_block"))?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            cond_embedding,
            down_blocks,
            zero_convs,
            mid_block,
            mid_zero_conv,
            scales,
        })
    }

    /// `xs`: noisy latents `(B, C, h, w)`; `hint`: `(B, 3, H, W)` with
    /// `H = h * 2^(n-1)` for `n` hint encoder widths; `timesteps`: `(B,)`;
    /// `context`: text embeddings `(B, L, D)`.
    pub fn forward(
        &self,
        xs: &Tensor,
        hint: &Tensor,
        timesteps: &Tensor,
        context: &Tensor,
    ) -> Result<ControlNetOutput> {
        let dtype = xs.dtype();
        let emb = self.time_proj.forward(timesteps)?.to_dtype(dtype)?;
        let emb = self.time_embedding.forward(&emb)?;

        let guided_hint = self.cond_embedding.forward(hint)?;
        let mut xs = (self.conv_in.forward(xs)? + guided_hint)?;

        let mut residuals = vec![xs.clone()];
        for block in &self.down_blocks {
            let (out, res) = match block {
                DownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                DownBlock::CrossAttn(b) => b.forward(&xs, Some(&emb), Some(context))?,
            };
            residuals.extend(res);
            xs = out;
        }
        let mid = self.mid_block.forward(&xs, Some(&emb), Some(context))?;

        let down_block_residuals = residuals
            .iter()
            .zip(self.zero_convs.iter())
            .zip(self.scales.iter())
            .map(|((res, conv), &scale)| conv.forward(res)? * scale)
            .collect::<Result<Vec<_>>>()?;
        let mid_scale = self.scales[self.scales.len() - 1];
        let mid_block_residual = (self.mid_zero_conv.forward(&mid)? * mid_scale)?;

        Ok(ControlNetOutput {
            down_block_residuals,
            mid_block_residual,
        })
    }

    pub fn num_down_residuals(&self) -> usize {
        self.zero_convs.len()
    }
}
