//! # Speech Model
//!
//! Loads and drives the streaming speech codec-LM checkpoint. The model is a
//! causally-delayed streaming transducer: audio frames are quantized into
//! codec codes, the language model steps once per code timestep and may emit
//! nothing while it is still inside its lookahead window, and emitted audio
//! tokens are decoded back into PCM samples.
//!
//! ## Checkpoint Layout:
//! A single safetensors file with the following tensors:
//! - `codec.codebooks`: `[num_codebooks, codebook_size, latent_dim]` residual
//!   vector-quantizer tables shared by encode and decode
//! - `codec.encoder.weight`: `[latent_dim, frame_size]` analysis projection
//! - `codec.decoder.weight`: `[frame_size, latent_dim]` synthesis projection
//! - `lm.in_proj.weight`: `[latent_dim, latent_dim]`
//! - `lm.text_embed.weight`: `[text_vocab, latent_dim]` persona prompt table
//! - `lm.text_head.weight`: `[text_vocab, latent_dim]`
//! - `lm.audio_head.weight`: `[2 * num_codebooks * codebook_size, latent_dim]`
//!
//! ## Token Channel Layout:
//! Each emitted step carries `1 + 2 * num_codebooks` channels (17 for the
//! default 8-codebook checkpoint). Channel 0 is text; channels
//! `1..=num_codebooks` are the audio output stream and are the only channels
//! that may be decoded to PCM. Remaining channels mirror the input stream and
//! must be excluded before decoding.

use crate::config::ModelConfig;
use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};
use std::collections::HashMap;
use std::path::PathBuf;
use tokenizers::Tokenizer;

/// Steps the language model withholds output while filling its lookahead
/// window. Emitting nothing for the first frames of an utterance is the
/// expected steady-state behavior, not an error.
const ACOUSTIC_DELAY_STEPS: usize = 2;

/// Per-session streaming state. Created by [`SpeechModel::open_stream`] and
/// torn down when the owning session ends; the weights themselves are shared
/// read-only across sessions.
pub struct StreamState {
    /// Rolling context folded into every step; makes the step order-sensitive
    context: Tensor,

    /// Steps consumed since the stream was opened or reset
    steps: usize,

    /// Latest persona/voice conditioning vector, if any
    pub conditioning: Option<Tensor>,
}

/// The loaded speech model: immutable weights plus the tokenizer used for
/// persona text prompts.
pub struct SpeechModel {
    device: Device,
    frame_size: usize,
    num_codebooks: usize,
    codebook_size: usize,
    latent_dim: usize,

    codebooks: Tensor,
    encoder: Linear,
    decoder: Linear,
    lm_proj: Linear,
    text_embed: Tensor,
    text_vocab: usize,
    text_head: Linear,
    audio_head: Linear,

    tokenizer: Option<Tokenizer>,
    voice_dir: Option<PathBuf>,
}

impl SpeechModel {
    /// Download and load the checkpoint named in the configuration.
    ///
    /// Any failure here (network, missing files, malformed tensors) is
    /// reported to the caller, which falls back to the mock engine; this
    /// function never needs to be retried at runtime.
    pub async fn load(config: &ModelConfig, device: Device) -> Result<Self> {
        tracing::info!("Loading speech model from {}...", config.repo_id);

        let api = {
            use hf_hub::api::tokio::{Api, ApiBuilder};

            let mut builder = ApiBuilder::new();
            if let Ok(token) = std::env::var("HF_TOKEN") {
                builder = builder.with_token(Some(token));
            } else {
                builder = builder.with_token(None);
            }
            if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
                builder = builder.with_cache_dir(cache_dir.into());
            }
            builder = builder.with_progress(false);

            match builder.build() {
                Ok(api) => api,
                Err(e) => {
                    tracing::warn!("ApiBuilder failed ({}), falling back to Api::new()", e);
                    Api::new().map_err(|e2| {
                        anyhow!("HuggingFace API initialization failed: {} / {}", e, e2)
                    })?
                }
            }
        };

        let repo = api.model(config.repo_id.clone());

        let weights_path = repo.get(&config.weights_file).await.map_err(|e| {
            anyhow!(
                "Failed to download {} from {}: {}",
                config.weights_file,
                config.repo_id,
                e
            )
        })?;
        tracing::info!("Checkpoint downloaded to {:?}", weights_path);

        // The tokenizer is only needed for persona text prompts; a missing
        // tokenizer degrades configure() but does not disable the model.
        let tokenizer = match repo.get(&config.tokenizer_file).await {
            Ok(path) => match Tokenizer::from_file(&path) {
                Ok(t) => Some(t),
                Err(e) => {
                    tracing::warn!("Failed to load tokenizer: {}", e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Tokenizer {} not available in {}: {}",
                    config.tokenizer_file,
                    config.repo_id,
                    e
                );
                None
            }
        };

        let tensors = candle_core::safetensors::load(&weights_path, &device)?;
        let voice_dir = config.voice_dir.as_ref().map(PathBuf::from);

        let model = Self::from_weights(tensors, tokenizer, voice_dir, device)?;
        tracing::info!(
            "Speech model loaded: frame_size={}, codebooks={}x{}, latent_dim={}",
            model.frame_size,
            model.num_codebooks,
            model.codebook_size,
            model.latent_dim
        );
        Ok(model)
    }

    /// Build the model from an already-loaded tensor map.
    pub fn from_weights(
        tensors: HashMap<String, Tensor>,
        tokenizer: Option<Tokenizer>,
        voice_dir: Option<PathBuf>,
        device: Device,
    ) -> Result<Self> {
        let codebooks = tensors
            .get("codec.codebooks")
            .ok_or_else(|| anyhow!("checkpoint is missing codec.codebooks"))?
            .clone();
        let (num_codebooks, codebook_size, latent_dim) = codebooks.dims3()?;

        let encoder_weight = tensors
            .get("codec.encoder.weight")
            .ok_or_else(|| anyhow!("checkpoint is missing codec.encoder.weight"))?;
        let (enc_out, frame_size) = encoder_weight.dims2()?;
        if enc_out != latent_dim {
            return Err(anyhow!(
                "encoder latent dim {} does not match codebook dim {}",
                enc_out,
                latent_dim
            ));
        }

        let text_embed = tensors
            .get("lm.text_embed.weight")
            .ok_or_else(|| anyhow!("checkpoint is missing lm.text_embed.weight"))?
            .clone();
        let (text_vocab, embed_dim) = text_embed.dims2()?;
        if embed_dim != latent_dim {
            return Err(anyhow!(
                "text embedding dim {} does not match latent dim {}",
                embed_dim,
                latent_dim
            ));
        }

        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let encoder = linear_no_bias(frame_size, latent_dim, vb.pp("codec.encoder"))?;
        let decoder = linear_no_bias(latent_dim, frame_size, vb.pp("codec.decoder"))?;
        let lm_proj = linear_no_bias(latent_dim, latent_dim, vb.pp("lm.in_proj"))?;
        let text_head = linear_no_bias(latent_dim, text_vocab, vb.pp("lm.text_head"))?;
        let audio_head = linear_no_bias(
            latent_dim,
            2 * num_codebooks * codebook_size,
            vb.pp("lm.audio_head"),
        )?;

        Ok(Self {
            device,
            frame_size,
            num_codebooks,
            codebook_size,
            latent_dim,
            codebooks,
            encoder,
            decoder,
            lm_proj,
            text_embed,
            text_vocab,
            text_head,
            audio_head,
            tokenizer,
            voice_dir,
        })
    }

    /// Samples per frame, as defined by the codec.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Number of residual codebooks, which is also the width of the audio
    /// token sub-range within an emitted step.
    pub fn num_codebooks(&self) -> usize {
        self.num_codebooks
    }

    /// Total token channels per emitted step (text + output audio + echo).
    pub fn out_channels(&self) -> usize {
        1 + 2 * self.num_codebooks
    }

    /// Enter streaming scope: create fresh per-session streaming state.
    pub fn open_stream(&self) -> Result<StreamState> {
        Ok(StreamState {
            context: Tensor::zeros((1, self.latent_dim), DType::F32, &self.device)?,
            steps: 0,
            conditioning: None,
        })
    }

    /// Quantize one frame into codec codes, one `Vec` of codebook indices per
    /// timestep. Deterministic given the input frame; must be called with
    /// frames in strict chronological order.
    pub fn encode(&self, frame: &[f32]) -> Result<Vec<Vec<u32>>> {
        if frame.len() != self.frame_size {
            return Err(anyhow!(
                "encode expects exactly {} samples, got {}",
                self.frame_size,
                frame.len()
            ));
        }

        let x = Tensor::from_slice(frame, (1, self.frame_size), &self.device)?;
        let mut residual = self.encoder.forward(&x)?;

        let mut codes = Vec::with_capacity(self.num_codebooks);
        for q in 0..self.num_codebooks {
            let table = self.codebooks.get(q)?;
            let dist = table.broadcast_sub(&residual)?.sqr()?.sum(D::Minus1)?;
            let idx = dist.argmin(0)?.to_scalar::<u32>()?;
            let entry = table.narrow(0, idx as usize, 1)?;
            residual = residual.sub(&entry)?;
            codes.push(idx);
        }

        // One code timestep per frame at the codec's native frame rate
        Ok(vec![codes])
    }

    /// Advance the language model by one code timestep.
    ///
    /// Returns `None` while the model is still inside its lookahead window;
    /// afterwards returns the full multi-channel token frame for this step.
    pub fn step(&self, state: &mut StreamState, codes: &[u32]) -> Result<Option<Vec<u32>>> {
        let mut h = Tensor::zeros((1, self.latent_dim), DType::F32, &self.device)?;
        for (q, &code) in codes.iter().take(self.num_codebooks).enumerate() {
            let idx = (code as usize).min(self.codebook_size - 1);
            let entry = self.codebooks.get(q)?.narrow(0, idx, 1)?;
            h = h.add(&entry)?;
        }

        h = h.add(&state.context)?;
        if let Some(conditioning) = &state.conditioning {
            h = h.add(conditioning)?;
        }

        let hidden = self.lm_proj.forward(&h)?.tanh()?;

        // Leaky context integration keeps the step stateful and strictly
        // order-sensitive across timesteps
        state.context = state
            .context
            .affine(0.9, 0.0)?
            .add(&hidden.affine(0.1, 0.0)?)?;
        state.steps += 1;

        if state.steps <= ACOUSTIC_DELAY_STEPS {
            return Ok(None);
        }

        let text_token = self
            .text_head
            .forward(&hidden)?
            .argmax(D::Minus1)?
            .to_vec1::<u32>()?[0];

        let audio_tokens = self
            .audio_head
            .forward(&hidden)?
            .reshape((2 * self.num_codebooks, self.codebook_size))?
            .argmax(D::Minus1)?
            .to_vec1::<u32>()?;

        let mut tokens = Vec::with_capacity(self.out_channels());
        tokens.push(text_token);
        tokens.extend(audio_tokens);
        Ok(Some(tokens))
    }

    /// Decode one step's audio tokens back into PCM samples.
    ///
    /// Every code is clamped into the codec vocabulary first so a single
    /// out-of-range token cannot crash the session.
    pub fn decode(&self, audio_tokens: &[u32]) -> Result<Vec<f32>> {
        let mut h = Tensor::zeros((1, self.latent_dim), DType::F32, &self.device)?;
        for (q, &code) in audio_tokens.iter().take(self.num_codebooks).enumerate() {
            let idx = (code as usize).min(self.codebook_size - 1);
            let entry = self.codebooks.get(q)?.narrow(0, idx, 1)?;
            h = h.add(&entry)?;
        }

        let samples = self.decoder.forward(&h)?.clamp(-1.0, 1.0)?;
        Ok(samples.flatten_all()?.to_vec1::<f32>()?)
    }

    /// Reset streaming state, equivalent to starting a new utterance.
    /// Conditioning survives; only the stream caches are cleared.
    pub fn reset_stream(&self, state: &mut StreamState) -> Result<()> {
        state.context = Tensor::zeros((1, self.latent_dim), DType::F32, &self.device)?;
        state.steps = 0;
        Ok(())
    }

    /// Run a bounded number of zero frames through the full pipeline on a
    /// scratch stream, absorbing one-time initialization cost. The scratch
    /// stream is dropped afterwards so warmup cannot alter observable output.
    pub fn warmup(&self, frames: usize) -> Result<()> {
        tracing::info!("Warming up speech model with {} frames...", frames);
        let mut scratch = self.open_stream()?;
        let silence = vec![0.0f32; self.frame_size];

        for _ in 0..frames {
            for codes in self.encode(&silence)? {
                if let Some(tokens) = self.step(&mut scratch, &codes)? {
                    let _ = self.decode(&tokens[1..1 + self.num_codebooks])?;
                }
            }
        }

        tracing::info!("Warmup complete");
        Ok(())
    }

    /// Turn a persona description into a conditioning vector via the text
    /// prompt table. Returns `None` when no tokenizer is available.
    pub fn encode_text_prompt(&self, persona: &str) -> Result<Option<Tensor>> {
        let tokenizer = match &self.tokenizer {
            Some(t) => t,
            None => {
                tracing::warn!("No tokenizer loaded; persona text prompt ignored");
                return Ok(None);
            }
        };

        // Wrap with system tags the way the model was trained
        let cleaned = persona.trim();
        let prompt = if cleaned.starts_with("<system>") && cleaned.ends_with("<system>") {
            cleaned.to_string()
        } else {
            format!("<system> {} <system>", cleaned)
        };

        let encoding = tokenizer
            .encode(prompt.as_str(), true)
            .map_err(|e| anyhow!("Failed to tokenize persona prompt: {}", e))?;

        let ids: Vec<u32> = encoding
            .get_ids()
            .iter()
            .map(|&id| id.min(self.text_vocab as u32 - 1))
            .collect();
        if ids.is_empty() {
            return Ok(None);
        }

        let ids_len = ids.len();
        let ids = Tensor::from_vec(ids, ids_len, &self.device)?;
        let embedded = self.text_embed.index_select(&ids, 0)?;
        Ok(Some(embedded.mean(0)?.unsqueeze(0)?))
    }

    /// Load a per-voice embedding file (e.g. `NATF0.safetensors`) from the
    /// configured voice directory.
    pub fn load_voice_embedding(&self, voice: &str) -> Result<Option<Tensor>> {
        let dir = match &self.voice_dir {
            Some(dir) => dir,
            None => {
                tracing::warn!("Voice directory not configured; voice prompt ignored");
                return Ok(None);
            }
        };

        let path = dir.join(format!("{}.safetensors", voice));
        if !path.exists() {
            tracing::warn!("Voice embedding not found: {:?}", path);
            return Ok(None);
        }

        let tensors = candle_core::safetensors::load(&path, &self.device)?;
        let embedding = tensors
            .get("embedding")
            .ok_or_else(|| anyhow!("voice file {:?} is missing the embedding tensor", path))?;
        let embedding = embedding.reshape((1, self.latent_dim))?;
        tracing::info!("Loaded voice embedding: {}", voice);
        Ok(Some(embedding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tiny deterministic checkpoint for exercising the tensor pipeline.
    fn tiny_model() -> SpeechModel {
        let device = Device::Cpu;
        let nq = 2;
        let size = 8;
        let latent = 4;
        let frame = 16;
        let text_vocab = 8;

        let mut tensors = HashMap::new();
        let fill = |n: usize| -> Vec<f32> {
            (0..n).map(|i| ((i % 13) as f32 - 6.0) / 13.0).collect()
        };
        tensors.insert(
            "codec.codebooks".to_string(),
            Tensor::from_vec(fill(nq * size * latent), (nq, size, latent), &device).unwrap(),
        );
        tensors.insert(
            "codec.encoder.weight".to_string(),
            Tensor::from_vec(fill(latent * frame), (latent, frame), &device).unwrap(),
        );
        tensors.insert(
            "codec.decoder.weight".to_string(),
            Tensor::from_vec(fill(frame * latent), (frame, latent), &device).unwrap(),
        );
        tensors.insert(
            "lm.in_proj.weight".to_string(),
            Tensor::from_vec(fill(latent * latent), (latent, latent), &device).unwrap(),
        );
        tensors.insert(
            "lm.text_embed.weight".to_string(),
            Tensor::from_vec(fill(text_vocab * latent), (text_vocab, latent), &device).unwrap(),
        );
        tensors.insert(
            "lm.text_head.weight".to_string(),
            Tensor::from_vec(fill(text_vocab * latent), (text_vocab, latent), &device).unwrap(),
        );
        tensors.insert(
            "lm.audio_head.weight".to_string(),
            Tensor::from_vec(fill(2 * nq * size * latent), (2 * nq * size, latent), &device)
                .unwrap(),
        );

        SpeechModel::from_weights(tensors, None, None, device).unwrap()
    }

    #[test]
    fn test_dimensions_derived_from_checkpoint() {
        let model = tiny_model();
        assert_eq!(model.frame_size(), 16);
        assert_eq!(model.num_codebooks(), 2);
        assert_eq!(model.out_channels(), 5);
    }

    #[test]
    fn test_encode_is_deterministic_and_in_range() {
        let model = tiny_model();
        let frame: Vec<f32> = (0..16).map(|i| (i as f32 / 16.0) - 0.5).collect();

        let a = model.encode(&frame).unwrap();
        let b = model.encode(&frame).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].len(), 2);
        for &code in &a[0] {
            assert!(code < 8);
        }
    }

    #[test]
    fn test_encode_rejects_wrong_frame_size() {
        let model = tiny_model();
        assert!(model.encode(&[0.0; 15]).is_err());
    }

    #[test]
    fn test_step_withholds_output_during_delay() {
        let model = tiny_model();
        let mut stream = model.open_stream().unwrap();

        assert!(model.step(&mut stream, &[0, 0]).unwrap().is_none());
        assert!(model.step(&mut stream, &[1, 1]).unwrap().is_none());

        let tokens = model.step(&mut stream, &[2, 2]).unwrap();
        let tokens = tokens.expect("delay window exhausted, tokens expected");
        assert_eq!(tokens.len(), model.out_channels());
    }

    #[test]
    fn test_reset_restores_delay_window() {
        let model = tiny_model();
        let mut stream = model.open_stream().unwrap();
        for _ in 0..4 {
            let _ = model.step(&mut stream, &[0, 0]).unwrap();
        }

        model.reset_stream(&mut stream).unwrap();
        assert!(model.step(&mut stream, &[0, 0]).unwrap().is_none());
    }

    #[test]
    fn test_decode_clamps_out_of_range_codes() {
        let model = tiny_model();
        // 9999 is far outside the 8-entry codebook; must not panic or error
        let samples = model.decode(&[9999, 7]).unwrap();
        assert_eq!(samples.len(), model.frame_size());
        for s in samples {
            assert!((-1.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn test_warmup_runs_on_scratch_state() {
        let model = tiny_model();
        model.warmup(3).unwrap();

        // A fresh stream still observes the full delay window afterwards
        let mut stream = model.open_stream().unwrap();
        assert!(model.step(&mut stream, &[0, 0]).unwrap().is_none());
    }
}
