use anyhow::{Result, ensure};
use burn::{
    nn::{
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, Linear, LinearConfig, Relu,
        attention::MultiHeadAttention,
    },
    prelude::*,
    tensor::activation::log_softmax,
    train::ClassificationOutput,
};
use nn::{
    LayerNormConfig,
    attention::{MhaInput, MultiHeadAttentionConfig, generate_autoregressive_mask},
};

use crate::data_helpers::Seq2SeqBatch;

#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    ln_atn: LayerNorm<B>,
    atn: MultiHeadAttention<B>,
    ln_ff: LayerNorm<B>,
    ff1: Linear<B>,
    act: Relu,
    ff2: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn forward(&self, x: Tensor<B, 3>, src_mask_pad: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let x_ln_atn = self.ln_atn.forward(x.clone());
        let x_atn_input = MhaInput::self_attn(x_ln_atn).mask_pad(src_mask_pad);

        let x_atn = self.atn.forward(x_atn_input).context;
        let x_with_atn = x + self.dropout.forward(x_atn);

        let x_ln_ff = self.ln_ff.forward(x_with_atn.clone());
        let x_ff1_act = self.act.forward(self.ff1.forward(x_ln_ff));
        let x_ff2 = self.ff2.forward(x_ff1_act);

        x_with_atn + self.dropout.forward(x_ff2)
    }
}

#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    ln_self_atn: LayerNorm<B>,
    self_atn: MultiHeadAttention<B>,
    ln_cross_atn: LayerNorm<B>,
    cross_atn: MultiHeadAttention<B>,
    ln_ff: LayerNorm<B>,
    ff1: Linear<B>,
    act: Relu,
    ff2: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        memory: Tensor<B, 3>,
        tgt_mask_pad: Tensor<B, 2, Bool>,
        src_mask_pad: Tensor<B, 2, Bool>,
    ) -> Tensor<B, 3> {
        let [batch_size, seq_length, _embed_dim] = x.dims();
        let dev = x.device();

        let x_ln_self = self.ln_self_atn.forward(x.clone());
        let x_self_input = MhaInput::self_attn(x_ln_self)
            .mask_pad(tgt_mask_pad)
            .mask_attn(generate_autoregressive_mask(batch_size, seq_length, &dev));
        let x_self = self.self_atn.forward(x_self_input).context;
        let x_with_self = x + self.dropout.forward(x_self);

        // Queries come from the decoder, keys and values from the encoder output.
        let x_ln_cross = self.ln_cross_atn.forward(x_with_self.clone());
        let x_cross_input = MhaInput::new(x_ln_cross, memory.clone(), memory).mask_pad(src_mask_pad);
        let x_cross = self.cross_atn.forward(x_cross_input).context;
        let x_with_cross = x_with_self + self.dropout.forward(x_cross);

        let x_ln_ff = self.ln_ff.forward(x_with_cross.clone());
        let x_ff1_act = self.act.forward(self.ff1.forward(x_ln_ff));
        let x_ff2 = self.ff2.forward(x_ff1_act);

        x_with_cross + self.dropout.forward(x_ff2)
    }
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    tok_emb: Embedding<B>,
    pos_emb: Embedding<B>,
    blocks: Vec<EncoderBlock<B>>,
    ln_out: LayerNorm<B>,
    dropout: Dropout,
    d_model: usize,
}

impl<B: Backend> Encoder<B> {
    pub fn forward(
        &self,
        inputs: Tensor<B, 2, Int>,
        inputs_pos: Tensor<B, 2, Int>,
        src_mask_pad: Tensor<B, 2, Bool>,
    ) -> Tensor<B, 3> {
        let x_tok_emb = self.tok_emb.forward(inputs) * (self.d_model as f64).sqrt();
        let x_pos_emb = self.pos_emb.forward(inputs_pos);
        let x = self.dropout.forward(x_tok_emb + x_pos_emb);

        let x_blocks = self
            .blocks
            .iter()
            .fold(x, |h, block| block.forward(h, src_mask_pad.clone()));

        self.ln_out.forward(x_blocks)
    }
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    tok_emb: Embedding<B>,
    pos_emb: Embedding<B>,
    blocks: Vec<DecoderBlock<B>>,
    ln_out: LayerNorm<B>,
    dropout: Dropout,
    unembed: Linear<B>,
    d_model: usize,
}

impl<B: Backend> Decoder<B> {
    pub fn forward(
        &self,
        targets: Tensor<B, 2, Int>,
        targets_pos: Tensor<B, 2, Int>,
        tgt_mask_pad: Tensor<B, 2, Bool>,
        memory: Tensor<B, 3>,
        src_mask_pad: Tensor<B, 2, Bool>,
    ) -> Tensor<B, 3> {
        let x_tok_emb = self.tok_emb.forward(targets) * (self.d_model as f64).sqrt();
        let x_pos_emb = self.pos_emb.forward(targets_pos);
        let x = self.dropout.forward(x_tok_emb + x_pos_emb);

        let x_blocks = self.blocks.iter().fold(x, |h, block| {
            block.forward(h, memory.clone(), tgt_mask_pad.clone(), src_mask_pad.clone())
        });

        self.unembed.forward(self.ln_out.forward(x_blocks))
    }
}

#[derive(Module, Debug)]
pub struct Transformer<B: Backend> {
    pub encoder: Encoder<B>,
    pub decoder: Decoder<B>,
    pad_id: usize,
}

impl<B: Backend> Transformer<B> {
    /// Returns logits of shape `[batch, tgt_len, tgt_vocab_size]`.
    pub fn forward(
        &self,
        inputs: Tensor<B, 2, Int>,
        inputs_pos: Tensor<B, 2, Int>,
        targets: Tensor<B, 2, Int>,
        targets_pos: Tensor<B, 2, Int>,
    ) -> Tensor<B, 3> {
        let src_mask_pad = inputs.clone().equal_elem(self.pad_id as i64);
        let tgt_mask_pad = targets.clone().equal_elem(self.pad_id as i64);

        let memory = self
            .encoder
            .forward(inputs, inputs_pos, src_mask_pad.clone());

        self.decoder
            .forward(targets, targets_pos, tgt_mask_pad, memory, src_mask_pad)
    }

    pub fn forward_classification(&self, batch: Seq2SeqBatch<B>) -> ClassificationOutput<B> {
        let y_hat = self.forward(
            batch.inputs,
            batch.inputs_pos,
            batch.sos_targets,
            batch.sos_targets_pos,
        );

        let y_hat_flattened = y_hat.flatten::<2>(0, 1);

        let y_gt_reshaped = batch.targets_eos.reshape([-1]);

        let loss = self.masked_cross_entropy(y_hat_flattened.clone(), y_gt_reshaped.clone());

        ClassificationOutput::new(loss, y_hat_flattened, y_gt_reshaped)
    }

    /// Mean negative log-likelihood over the targets that are not `pad_id`.
    fn masked_cross_entropy(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let [n_targets, _] = logits.dims();

        let nll = log_softmax(logits, 1)
            .gather(1, targets.clone().reshape([n_targets, 1]))
            .reshape([n_targets])
            .neg();
        let keep = targets.not_equal_elem(self.pad_id as i64).float();
        let n_kept = keep.clone().sum().clamp_min(1.0);

        (nll * keep).sum() / n_kept
    }

    /// Parameter counts as `(whole model, encoder, decoder)`.
    pub fn count_parameters(&self) -> (usize, usize, usize) {
        let enc = self.encoder.num_params();
        let dec = self.decoder.num_params();

        (self.num_params(), enc, dec)
    }
}

#[derive(Config, Debug)]
pub struct TransformerConfig {
    pub src_vocab_size: usize,
    pub tgt_vocab_size: usize,
    /// Number of position slots; slot 0 is reserved for padding.
    #[config(default = 512)]
    pub max_len: usize,
    #[config(default = 512)]
    pub d_model: usize,
    #[config(default = 8)]
    pub n_heads: usize,
    #[config(default = 2048)]
    pub d_ff: usize,
    #[config(default = 6)]
    pub num_enc_blocks: usize,
    #[config(default = 6)]
    pub num_dec_blocks: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    #[config(default = 0)]
    pub pad_id: usize,
}

impl TransformerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.n_heads > 0 && self.d_model % self.n_heads == 0,
            "model.d_model ({}) must be divisible by model.n_heads ({})",
            self.d_model,
            self.n_heads
        );
        ensure!(
            self.pad_id < self.src_vocab_size && self.pad_id < self.tgt_vocab_size,
            "model.pad_id ({}) is outside the vocabulary",
            self.pad_id
        );
        ensure!(self.max_len > 1, "model.max_len must be at least 2");

        Ok(())
    }

    fn init_encoder_block<B: Backend>(&self, device: &B::Device) -> EncoderBlock<B> {
        EncoderBlock {
            ln_atn: LayerNormConfig::new(self.d_model).init(device),
            atn: MultiHeadAttentionConfig::new(self.d_model, self.n_heads)
                .with_dropout(self.dropout)
                .init(device),
            ln_ff: LayerNormConfig::new(self.d_model).init(device),
            ff1: LinearConfig::new(self.d_model, self.d_ff).init(device),
            act: Relu::new(),
            ff2: LinearConfig::new(self.d_ff, self.d_model).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }

    fn init_decoder_block<B: Backend>(&self, device: &B::Device) -> DecoderBlock<B> {
        DecoderBlock {
            ln_self_atn: LayerNormConfig::new(self.d_model).init(device),
            self_atn: MultiHeadAttentionConfig::new(self.d_model, self.n_heads)
                .with_dropout(self.dropout)
                .init(device),
            ln_cross_atn: LayerNormConfig::new(self.d_model).init(device),
            cross_atn: MultiHeadAttentionConfig::new(self.d_model, self.n_heads)
                .with_dropout(self.dropout)
                .init(device),
            ln_ff: LayerNormConfig::new(self.d_model).init(device),
            ff1: LinearConfig::new(self.d_model, self.d_ff).init(device),
            act: Relu::new(),
            ff2: LinearConfig::new(self.d_ff, self.d_model).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Transformer<B> {
        let encoder = Encoder {
            tok_emb: EmbeddingConfig::new(self.src_vocab_size, self.d_model).init(device),
            pos_emb: EmbeddingConfig::new(self.max_len, self.d_model).init(device),
            blocks: (0..self.num_enc_blocks)
                .map(|_| self.init_encoder_block(device))
                .collect(),
            ln_out: LayerNormConfig::new(self.d_model).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            d_model: self.d_model,
        };

        let decoder = Decoder {
            tok_emb: EmbeddingConfig::new(self.tgt_vocab_size, self.d_model).init(device),
            pos_emb: EmbeddingConfig::new(self.max_len, self.d_model).init(device),
            blocks: (0..self.num_dec_blocks)
                .map(|_| self.init_decoder_block(device))
                .collect(),
            ln_out: LayerNormConfig::new(self.d_model).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            unembed: LinearConfig::new(self.d_model, self.tgt_vocab_size)
                .with_bias(false)
                .init(device),
            d_model: self.d_model,
        };

        Transformer {
            encoder,
            decoder,
            pad_id: self.pad_id,
        }
    }
}
