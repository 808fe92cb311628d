use anyhow::{Context, Result};
use candle_core::{Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::clip;
use log::debug;
use std::collections::HashMap;
use tokenizers::Tokenizer;

use super::config::TextEncoderConfig;

/// Turns prompts into cross-attention context.
pub trait TextConditioner {
    /// `(1, L, D)` embedding of a single prompt.
    fn encode(&mut self, text: &str) -> Result<Tensor>;

    /// `(B, L, D)` embeddings, one row per prompt.
    fn encode_batch(&mut self, texts: &[String]) -> Result<Tensor> {
        let rows = texts
            .iter()
            .map(|text| self.encode(text))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&rows, 0)?)
    }
}

/// Frozen CLIP text transformer. Embeddings are cached per distinct prompt,
/// since training sees the same few prompts over and over.
pub struct ClipConditioner {
    model: clip::ClipTextTransformer,
    tokenizer: Tokenizer,
    max_length: usize,
    pad_id: u32,
    device: Device,
    cache: HashMap<String, Tensor>,
}

impl ClipConditioner {
    pub fn new(vb: VarBuilder, config: &TextEncoderConfig) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(&config.tokenizer).map_err(|e| {
            anyhow::anyhow!(
                "Failed to load tokenizer {}: {}",
                config.tokenizer.display(),
                e
            )
        })?;
        let pad_id = tokenizer
            .token_to_id(&config.pad_token)
            .with_context(|| format!("Pad token '{}' not in vocabulary", config.pad_token))?;

        let device = vb.device().clone();
        let model = clip::ClipTextTransformer::new(vb, &config.clip_config()?)?;

        Ok(Self {
            model,
            tokenizer,
            max_length: config.max_length,
            pad_id,
            device,
            cache: HashMap::new(),
        })
    }

    fn tokenize(&self, text: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {:?}", e))?;
        let ids = pad_ids(encoding.get_ids().to_vec(), self.max_length, self.pad_id);
        Ok(Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?)
    }
}

impl TextConditioner for ClipConditioner {
    fn encode(&mut self, text: &str) -> Result<Tensor> {
        if let Some(hit) = self.cache.get(text) {
            return Ok(hit.clone());
        }
        debug!("Encoding prompt {:?}", text);
        let tokens = self.tokenize(text)?;
        let embedding = self.model.forward(&tokens)?.detach();
        self.cache.insert(text.to_string(), embedding.clone());
        Ok(embedding)
    }
}

/// Pad `ids` to `max_length` with `pad_id`. Over-long sequences are cut and
/// keep their final (end-of-text) token.
pub fn pad_ids(mut ids: Vec<u32>, max_length: usize, pad_id: u32) -> Vec<u32> {
    if ids.len() > max_length {
        let last = ids[ids.len() - 1];
        ids.truncate(max_length);
        if let Some(end) = ids.last_mut() {
            *end = last;
        }
    }
    ids.resize(max_length, pad_id);
    ids
}

/// Fixed pseudo-embeddings derived from the prompt bytes. Stands in for CLIP
/// where a real tokenizer and weights are not at hand.
#[cfg(test)]
pub(crate) struct HashConditioner {
    pub seq_len: usize,
    pub dim: usize,
    pub calls: usize,
}

#[cfg(test)]
impl HashConditioner {
    pub fn new(seq_len: usize, dim: usize) -> Self {
        Self {
            seq_len,
            dim,
            calls: 0,
        }
    }
}

#[cfg(test)]
impl TextConditioner for HashConditioner {
    fn encode(&mut self, text: &str) -> Result<Tensor> {
        self.calls += 1;
        let seed = text.bytes().fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        let values: Vec<f32> = (0..self.seq_len * self.dim)
            .map(|i| (((seed as usize + i * 17) % 101) as f32 / 50.0) - 1.0)
            .collect();
        Ok(Tensor::from_vec(values, (1, self.seq_len, self.dim), &Device::Cpu)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_short_sequence() {
        let ids = pad_ids(vec![49406, 320, 49407], 6, 49407);
        assert_eq!(ids, vec![49406, 320, 49407, 49407, 49407, 49407]);
    }

    #[test]
    fn test_truncate_keeps_end_token() {
        let ids = pad_ids(vec![49406, 1, 2, 3, 4, 49407], 4, 0);
        assert_eq!(ids, vec![49406, 1, 2, 49407]);
    }

    #[test]
    fn test_exact_length_untouched() {
        let ids = pad_ids(vec![1, 2, 3], 3, 0);
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_encode_batch_stacks_rows() -> Result<()> {
        let mut conditioner = HashConditioner::new(5, 16);
        let texts = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let ctx = conditioner.encode_batch(&texts)?;
        assert_eq!(ctx.dims(), &[3, 5, 16]);

        let first = ctx.get(0)?.flatten_all()?.to_vec1::<f32>()?;
        let second = ctx.get(1)?.flatten_all()?.to_vec1::<f32>()?;
        let third = ctx.get(2)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(first, third);
        assert_ne!(first, second);
        Ok(())
    }
}
