use burn::{
    nn::{
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        Dropout, DropoutConfig,
        Embedding, EmbeddingConfig,
        LayerNorm, LayerNormConfig,
        Linear, LinearConfig,
    },
    optim::AdamWConfig,
    prelude::*,
    tensor::activation,
};

use crate::application::train_use_case::TrainConfig;

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug)]
pub struct LayoutTransformerConfig {
    pub vocab_size:  usize,
    pub max_seq_len: usize,
    pub d_model:     usize,
    pub num_heads:   usize,
    pub num_layers:  usize,
    pub d_ff:        usize,
    pub dropout:     f64,
}

impl LayoutTransformerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LayoutTransformer<B> {
        let token_embedding    = EmbeddingConfig::new(self.vocab_size, self.d_model).init(device);
        let position_embedding = EmbeddingConfig::new(self.max_seq_len, self.d_model).init(device);
        let layers: Vec<EncoderBlock<B>> = (0..self.num_layers)
            .map(|_| self.build_encoder_block(device))
            .collect();
        let final_norm = LayerNormConfig::new(self.d_model).init(device);
        let lm_head    = LinearConfig::new(self.d_model, self.vocab_size).init(device);
        let dropout    = DropoutConfig::new(self.dropout).init();
        LayoutTransformer {
            token_embedding, position_embedding, layers,
            final_norm, lm_head, dropout,
        }
    }

    fn build_encoder_block<B: Backend>(&self, device: &B::Device) -> EncoderBlock<B> {
        let self_attn   = MultiHeadAttentionConfig::new(self.d_model, self.num_heads)
            .with_dropout(self.dropout)
            .init(device);
        let ffn_linear1 = LinearConfig::new(self.d_model, self.d_ff).init(device);
        let ffn_linear2 = LinearConfig::new(self.d_ff, self.d_model).init(device);
        let norm1   = LayerNormConfig::new(self.d_model).init(device);
        let norm2   = LayerNormConfig::new(self.d_model).init(device);
        let dropout = DropoutConfig::new(self.dropout).init();
        EncoderBlock { self_attn, ffn_linear1, ffn_linear2, norm1, norm2, dropout }
    }
}

/// AdamW over every parameter with the configured betas and weight decay.
/// No clipping is configured here: the learner clips the global norm
/// itself before each step.
pub fn optimizer_config(cfg: &TrainConfig) -> AdamWConfig {
    AdamWConfig::new()
        .with_beta_1(cfg.beta1 as f32)
        .with_beta_2(cfg.beta2 as f32)
        .with_weight_decay(cfg.weight_decay as f32)
}

#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub self_attn:   MultiHeadAttention<B>,
    pub ffn_linear1: Linear<B>,
    pub ffn_linear2: Linear<B>,
    pub norm1:       LayerNorm<B>,
    pub norm2:       LayerNorm<B>,
    pub dropout:     Dropout,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn forward(&self, x: Tensor<B, 3>, pad_mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let attn_output = self
            .self_attn
            .forward(MhaInput::self_attn(x.clone()).mask_pad(pad_mask))
            .context;
        let x = self.norm1.forward(x + self.dropout.forward(attn_output));
        let ffn_out = self.ffn_linear2.forward(
            activation::gelu(self.ffn_linear1.forward(x.clone()))
        );
        self.norm2.forward(x + self.dropout.forward(ffn_out))
    }
}

#[derive(Module, Debug)]
pub struct LayoutTransformer<B: Backend> {
    pub token_embedding:    Embedding<B>,
    pub position_embedding: Embedding<B>,
    pub layers:             Vec<EncoderBlock<B>>,
    pub final_norm:         LayerNorm<B>,
    pub lm_head:            Linear<B>,
    pub dropout:            Dropout,
}

impl<B: Backend> LayoutTransformer<B> {
    /// tokens: [batch, seq_len], pad_mask: [batch, seq_len] (true = pad)
    /// → logits: [batch, seq_len, vocab]
    pub fn forward(&self, tokens: Tensor<B, 2, Int>, pad_mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let [batch_size, seq_len] = tokens.dims();

        let tok_emb = self.token_embedding.forward(tokens);

        let positions = Tensor::<B, 1, Int>::arange(0..seq_len as i64, &tok_emb.device())
            .unsqueeze::<2>()
            .expand([batch_size, seq_len]);
        let pos_emb = self.position_embedding.forward(positions);

        let mut x = self.dropout.forward(tok_emb + pos_emb);
        for layer in &self.layers {
            x = layer.forward(x, pad_mask.clone());
        }
        self.lm_head.forward(self.final_norm.forward(x))
    }

    /// Cross-entropy averaged over masked positions only.
    ///
    /// weights: [batch, seq_len], 1.0 at masked positions, 0.0 elsewhere.
    /// Returns a one-element tensor.
    pub fn masked_loss(
        &self,
        inputs:   Tensor<B, 2, Int>,
        targets:  Tensor<B, 2, Int>,
        weights:  Tensor<B, 2>,
        pad_mask: Tensor<B, 2, Bool>,
    ) -> Tensor<B, 1> {
        let [batch_size, seq_len] = targets.dims();
        let logits    = self.forward(inputs, pad_mask);
        let log_probs = activation::log_softmax(logits, 2);
        let nll = log_probs
            .gather(2, targets.unsqueeze_dim::<3>(2))
            .reshape([batch_size, seq_len])
            .neg();

        let total = (nll * weights.clone()).sum();
        total / weights.sum().clamp_min(1.0)
    }
}
