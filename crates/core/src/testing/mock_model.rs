use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};

use crate::cache::{DecoderCache, LayerCache};
use crate::engine::{DecoderStepOutput, EncoderOutput, Seq2SeqScorer, SourceInputs};

/// `(source_tokens, decoder_history) -> logits over the vocabulary`.
pub type NextLogitsFn = Arc<dyn Fn(&[u32], &[u32]) -> Vec<f32> + Send + Sync>;

/// A mock scorer for testing the decoding loop without a real network.
///
/// Logits are produced by a closure over the row's source tokens and decoder
/// history, so tests can script any distribution deterministically. In cached
/// mode the returned cache holds the decoder history itself, which lets
/// tests detect a cache that was not reordered with its beams.
pub struct MockScorer {
    vocab_size: usize,
    decoder_start_token_id: u32,
    device: Device,
    next_logits: NextLogitsFn,
    use_cache: bool,
    encoder_decoder: bool,
    decode_calls: AtomicUsize,
    fed_lengths: Mutex<Vec<usize>>,
}

impl MockScorer {
    pub fn new(vocab_size: usize, decoder_start_token_id: u32, next_logits: NextLogitsFn) -> Self {
        Self {
            vocab_size,
            decoder_start_token_id,
            device: Device::Cpu,
            next_logits,
            use_cache: false,
            encoder_decoder: true,
            decode_calls: AtomicUsize::new(0),
            fed_lengths: Mutex::new(Vec::new()),
        }
    }

    /// Uniform logits at every step.
    pub fn uniform(vocab_size: usize, decoder_start_token_id: u32) -> Self {
        Self::new(
            vocab_size,
            decoder_start_token_id,
            Arc::new(move |_, _| vec![0.0; vocab_size]),
        )
    }

    pub fn with_cache(mut self) -> Self {
        self.use_cache = true;
        self
    }

    pub fn decoder_only(mut self) -> Self {
        self.encoder_decoder = false;
        self
    }

    /// Number of `decode_step` calls so far.
    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    /// Decoder input length of every `decode_step` call so far.
    pub fn fed_lengths(&self) -> Vec<usize> {
        self.fed_lengths
            .lock()
            .map(|lengths| lengths.clone())
            .unwrap_or_default()
    }

    fn histories(
        &self,
        decoder_input_ids: &Tensor,
        cache: Option<&DecoderCache>,
    ) -> candle_core::Result<Vec<Vec<u32>>> {
        let fed: Vec<Vec<u32>> = decoder_input_ids.to_vec2()?;
        let Some(layer) = cache.and_then(|c| c.layers.first()) else {
            return Ok(fed);
        };
        let cached: Vec<Vec<f32>> = layer.self_key.to_vec2()?;
        Ok(cached
            .into_iter()
            .zip(fed)
            .map(|(past, new)| {
                past.into_iter()
                    .map(|t| t as u32)
                    .chain(new)
                    .collect()
            })
            .collect())
    }
}

impl Seq2SeqScorer for MockScorer {
    /// Hidden states carry the source token ids, `[batch, src_len, 1]`.
    /// `aux` holds the first source token of each example.
    fn encode(&self, inputs: &SourceInputs) -> candle_core::Result<EncoderOutput> {
        let (batch, src_len) = inputs.input_ids.dims2()?;
        let hidden = inputs
            .input_ids
            .to_dtype(DType::F32)?
            .reshape((batch, src_len, 1))?;
        let aux = inputs.input_ids.narrow(1, 0, 1)?.squeeze(1)?.to_dtype(DType::F32)?;
        Ok(EncoderOutput::with_src_len(hidden, src_len)
            .with_attention_mask(inputs.combined_attention_mask()?)
            .with_aux(aux))
    }

    fn decode_step(
        &self,
        decoder_input_ids: &Tensor,
        encoder_output: &EncoderOutput,
        cache: Option<&DecoderCache>,
    ) -> candle_core::Result<DecoderStepOutput> {
        self.decode_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut lengths) = self.fed_lengths.lock() {
            lengths.push(decoder_input_ids.dim(1)?);
        }

        let histories = self.histories(decoder_input_ids, cache)?;
        let sources: Vec<Vec<f32>> = encoder_output.hidden_states.squeeze(2)?.to_vec2()?;
        let rows = histories.len();

        let mut logits = Vec::with_capacity(rows * self.vocab_size);
        for (history, source) in histories.iter().zip(&sources) {
            let source: Vec<u32> = source.iter().map(|&t| t as u32).collect();
            let mut row = (self.next_logits)(&source, history);
            row.resize(self.vocab_size, f32::NEG_INFINITY);
            logits.extend(row);
        }
        let logits = Tensor::from_vec(logits, (rows, 1, self.vocab_size), &self.device)?;

        let cur_len = histories.first().map_or(0, Vec::len);
        let attentions = Tensor::ones((rows, cur_len), DType::F32, &self.device)?;
        let mut output = DecoderStepOutput::new(logits).with_attentions(attentions);

        if self.use_cache {
            let flat: Vec<f32> = histories.iter().flatten().map(|&t| t as f32).collect();
            let past = Tensor::from_vec(flat, (rows, cur_len), &self.device)?;
            let cross = encoder_output.hidden_states.clone();
            output = output.with_cache(DecoderCache::new(vec![
                LayerCache::new(past.clone(), past).with_cross_attention(cross.clone(), cross),
            ]));
        }
        Ok(output)
    }

    fn decoder_start_token_id(&self) -> u32 {
        self.decoder_start_token_id
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn is_encoder_decoder(&self) -> bool {
        self.encoder_decoder
    }
}
