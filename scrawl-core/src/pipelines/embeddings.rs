use anyhow::{Error, Result};
use candle_core::{Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::clip;
use tokenizers::Tokenizer;

/// CLIP text stack shared by both pipelines. Embeddings come out in the
/// encoder's native f32; pipelines cast to their own dtype.
pub(crate) struct TextEmbedder {
    tokenizer: Tokenizer,
    encoder: clip::ClipTextTransformer,
    config: clip::Config,
    device: Device,
}

impl TextEmbedder {
    pub(crate) fn new(
        tokenizer: Tokenizer,
        encoder: clip::ClipTextTransformer,
        config: clip::Config,
        device: Device,
    ) -> Self {
        Self {
            tokenizer,
            encoder,
            config,
            device,
        }
    }

    fn pad_token_id(&self) -> Result<u32> {
        let vocab = self.tokenizer.get_vocab(true);
        let token = match &self.config.pad_with {
            Some(token) => token.as_str(),
            None => "<|endoftext|>",
        };
        vocab
            .get(token)
            .copied()
            .ok_or_else(|| Error::msg(format!("tokenizer vocabulary is missing {token:?}")))
    }

    /// Embeds one text, padded out to the encoder's context length.
    pub(crate) fn embed(&self, text: &str) -> Result<Tensor> {
        let pad_id = self.pad_token_id()?;
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.config.max_position_embeddings {
            anyhow::bail!(
                "the prompt is too long, {} tokens exceed the limit of {}",
                tokens.len(),
                self.config.max_position_embeddings
            );
        }
        tokens.resize(self.config.max_position_embeddings, pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.encoder.forward(&tokens)?)
    }
}
