use std::{path::Path, sync::Arc};

use anyhow::{Result, anyhow};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder, batcher::Batcher},
        dataset::{
            InMemDataset,
            transform::{Mapper, MapperDataset},
        },
    },
    prelude::Backend,
    tensor::{Int, Tensor, TensorData},
};
use log::{info, warn};
use tokenizers::Tokenizer;

use crate::{
    config::{DataConfig, TrainConfig},
    corpus::{self, SentencePair},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Dev,
}

impl Split {
    fn location<'a>(&self, data: &'a DataConfig) -> &'a str {
        match self {
            Split::Train => &data.train,
            Split::Dev => &data.dev,
        }
    }
}

/// Loads a tokenizer from a local `tokenizer.json`, falling back to the hub.
pub fn load_tokenizer(name: &str) -> Result<Tokenizer> {
    if Path::new(name).exists() {
        Tokenizer::from_file(name).map_err(|e| anyhow!("Could not load tokenizer {name}: {e}"))
    } else {
        Tokenizer::from_pretrained(name, None)
            .map_err(|e| anyhow!("Could not fetch tokenizer {name}: {e}"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: u32,
    pub sos: u32,
    pub eos: u32,
}

impl SpecialTokens {
    pub fn from_tokenizer(tokenizer: &Tokenizer, data: &DataConfig) -> Result<Self> {
        let lookup = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer has no {token:?} token"))
        };

        Ok(Self {
            pad: lookup(&data.pad_token)?,
            sos: lookup(&data.sos_token)?,
            eos: lookup(&data.eos_token)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenizedPair {
    pub src: Vec<u32>,
    pub tgt: Vec<u32>,
}

#[derive(Clone)]
pub struct PairTokenizer {
    pub tokenizer: Tokenizer,
    max_src_len: usize,
    max_tgt_len: usize,
}

impl PairTokenizer {
    pub fn new(tokenizer: Tokenizer, max_src_len: usize, max_tgt_len: usize) -> Self {
        Self {
            tokenizer,
            max_src_len,
            max_tgt_len,
        }
    }

    fn encode(&self, text: &str, max_len: usize) -> Vec<u32> {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => {
                let ids = encoding.get_ids();
                ids[..ids.len().min(max_len)].to_vec()
            }
            Err(e) => {
                warn!("Could not tokenize {text:?}: {e}");
                Vec::new()
            }
        }
    }
}

impl Mapper<SentencePair, TokenizedPair> for PairTokenizer {
    fn map(&self, item: &SentencePair) -> TokenizedPair {
        TokenizedPair {
            src: self.encode(&item.src, self.max_src_len),
            tgt: self.encode(&item.tgt, self.max_tgt_len),
        }
    }
}

/// Right padded rows flattened row-major, with 1-based positions and 0 for padding.
#[derive(Debug, PartialEq, Eq)]
struct PaddedRows {
    ids: Vec<i64>,
    positions: Vec<i64>,
    width: usize,
}

fn pad_rows(rows: impl Iterator<Item = Vec<u32>> + Clone, pad: u32) -> PaddedRows {
    let width = rows.clone().map(|row| row.len()).max().unwrap_or(0).max(1);
    let mut ids = Vec::new();
    let mut positions = Vec::new();

    for row in rows {
        for i in 0..width {
            match row.get(i) {
                Some(&id) => {
                    ids.push(id as i64);
                    positions.push(i as i64 + 1);
                }
                None => {
                    ids.push(pad as i64);
                    positions.push(0);
                }
            }
        }
    }

    PaddedRows {
        ids,
        positions,
        width,
    }
}

#[derive(Clone, Debug)]
pub struct Seq2SeqBatch<B: Backend> {
    pub inputs: Tensor<B, 2, Int>,
    pub inputs_pos: Tensor<B, 2, Int>,
    pub sos_targets: Tensor<B, 2, Int>,
    pub sos_targets_pos: Tensor<B, 2, Int>,
    pub targets_eos: Tensor<B, 2, Int>,
}

#[derive(Clone)]
pub struct Seq2SeqBatcher {
    tokens: SpecialTokens,
}

impl Seq2SeqBatcher {
    pub fn new(tokens: SpecialTokens) -> Self {
        Self { tokens }
    }
}

fn to_tensor<B: Backend>(values: Vec<i64>, rows: usize, width: usize, device: &B::Device) -> Tensor<B, 2, Int> {
    Tensor::from_data(TensorData::new(values, [rows, width]), device)
}

impl<B: Backend> Batcher<B, TokenizedPair, Seq2SeqBatch<B>> for Seq2SeqBatcher {
    fn batch(&self, items: Vec<TokenizedPair>, device: &B::Device) -> Seq2SeqBatch<B> {
        let SpecialTokens { pad, sos, eos } = self.tokens;
        let batch_size = items.len();

        let src = pad_rows(items.iter().map(|item| item.src.clone()), pad);

        let sos_rows = items.iter().map(move |item| {
            let mut row = Vec::with_capacity(item.tgt.len() + 1);
            row.push(sos);
            row.extend_from_slice(&item.tgt);
            row
        });
        let eos_rows = items.iter().map(move |item| {
            let mut row = item.tgt.clone();
            row.push(eos);
            row
        });
        let sos_tgt = pad_rows(sos_rows, pad);
        let tgt_eos = pad_rows(eos_rows, pad);

        Seq2SeqBatch {
            inputs: to_tensor(src.ids, batch_size, src.width, device),
            inputs_pos: to_tensor(src.positions, batch_size, src.width, device),
            sos_targets: to_tensor(sos_tgt.ids, batch_size, sos_tgt.width, device),
            sos_targets_pos: to_tensor(sos_tgt.positions, batch_size, sos_tgt.width, device),
            targets_eos: to_tensor(tgt_eos.ids, batch_size, tgt_eos.width, device),
        }
    }
}

pub type Seq2SeqDataset = MapperDataset<InMemDataset<SentencePair>, PairTokenizer, SentencePair>;

pub fn build_dataset(data: &DataConfig, split: Split, tokenizer: &Tokenizer) -> Result<Seq2SeqDataset> {
    let location = split.location(data);
    let path = corpus::resolve(location)?;
    let pairs = corpus::read_pairs(&path, &data.src_column, &data.tgt_column)?;
    info!("Read {} sentence pairs for {split:?} from {location}", pairs.len());

    Ok(MapperDataset::new(
        InMemDataset::new(pairs),
        PairTokenizer::new(tokenizer.clone(), data.max_src_len, data.max_tgt_len),
    ))
}

pub fn build_data_loader<B: Backend>(
    config: &TrainConfig,
    split: Split,
    tokenizer: &Tokenizer,
    device: &B::Device,
) -> Result<Arc<dyn DataLoader<B, Seq2SeqBatch<B>>>> {
    let tokens = SpecialTokens::from_tokenizer(tokenizer, &config.data)?;
    let dataset = build_dataset(&config.data, split, tokenizer)?;

    let mut builder = DataLoaderBuilder::new(Seq2SeqBatcher::new(tokens))
        .batch_size(config.data.batch_size)
        .num_workers(config.data.num_workers)
        .set_device(device.clone());

    if split == Split::Train && config.data.shuffle {
        builder = builder.shuffle(config.training.seed);
    }

    Ok(builder.build(dataset))
}

/// Validation loader over no items, used when evaluation during training is off.
pub fn empty_data_loader<B: Backend>(
    tokens: SpecialTokens,
    device: &B::Device,
) -> Arc<dyn DataLoader<B, Seq2SeqBatch<B>>> {
    DataLoaderBuilder::new(Seq2SeqBatcher::new(tokens))
        .set_device(device.clone())
        .build(InMemDataset::<TokenizedPair>::new(Vec::new()))
}
