//! Caption preprocessing and tokenization.

use crate::interfaces::{Padding, Tokenizer};
use crate::tensor::token_ids;
use burn::tensor::TensorData;
use rand::seq::SliceRandom;

#[derive(Debug, Clone, Copy, Default)]
pub struct CaptionOptions {
    pub shuffle_tags: bool,
    pub strict_tokens: bool,
    pub not_pad_tokens: bool,
    /// Encode prompts as several `model_max_length` windows covering this many tokens.
    pub max_token_length: Option<usize>,
}

impl CaptionOptions {
    pub fn padding(&self) -> Padding {
        if self.not_pad_tokens {
            Padding::Longest
        } else {
            Padding::MaxLength
        }
    }

    /// Strict captions carry their own bos/eos markers.
    pub fn add_special_tokens(&self) -> bool {
        !self.strict_tokens
    }
}

#[derive(Debug, Clone)]
pub struct TokenizedCaption {
    /// Caption after tag shuffling / strict wrapping, as fed to the tokenizer.
    pub caption: String,
    /// Shape `[1, n]`.
    pub ids: TensorData,
}

/// Shuffle comma-separated tags, keeping the leading tag in place.
pub fn shuffle_tags(caption: &str, rng: &mut dyn rand::RngCore) -> String {
    let mut tags: Vec<&str> = caption
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    if tags.len() > 2 {
        tags[1..].shuffle(rng);
    }
    tags.join(", ")
}

/// Wrap each clause in `bos`/`eos` and mark word ends with `</w>`.
pub fn build_strict_tokens(caption: &str, bos: &str, eos: &str) -> String {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut chars = caption.chars().peekable();
    while let Some(c) = chars.next() {
        if matches!(c, ',' | ';' | '.' | '!' | '?')
            && chars.peek().is_some_and(|n| n.is_whitespace())
        {
            chars.next();
            clauses.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    clauses.push(current);

    clauses
        .iter()
        .map(|clause| {
            let words: Vec<String> = clause
                .split(' ')
                .filter(|w| !w.is_empty())
                .map(|w| format!("{w}</w>"))
                .collect();
            format!("{bos}{}{eos}", words.join(" "))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Apply the caption rules for one tokenizer without tokenizing.
pub fn prepare_caption(
    caption: &str,
    opts: &CaptionOptions,
    tokenizer: &dyn Tokenizer,
    rng: &mut dyn rand::RngCore,
) -> String {
    let mut caption = if opts.shuffle_tags {
        shuffle_tags(caption, rng)
    } else {
        caption.to_string()
    };
    if opts.strict_tokens {
        caption = build_strict_tokens(&caption, tokenizer.bos_token(), tokenizer.eos_token());
    }
    caption
}

/// Tokenize with truncation and log whatever the truncation dropped.
pub fn tokenize_truncated(
    tokenizer: &dyn Tokenizer,
    text: &str,
    padding: Padding,
    add_special_tokens: bool,
) -> anyhow::Result<Vec<i64>> {
    let ids = tokenizer.tokenize(text, padding, true, add_special_tokens)?;
    let untruncated = tokenizer.tokenize(text, Padding::Longest, false, add_special_tokens)?;
    if untruncated.len() >= ids.len() && ids != untruncated {
        let max = tokenizer.model_max_length();
        let end = untruncated.len().saturating_sub(1);
        let start = max.saturating_sub(1).min(end);
        let removed = tokenizer.decode(&untruncated[start..end])?;
        tracing::warn!(
            "The following part of your input was truncated because the model can only handle sequences up to {max} tokens: {removed}"
        );
    }
    Ok(ids)
}

/// Split a prompt into `max_token_length / (model_max_length - 2)` windows of
/// `[bos, chunk.., eos]`, each `model_max_length` ids long. Content past the
/// last window is dropped with a warning; short prompts are padded.
pub fn tokenize_windows(
    tokenizer: &dyn Tokenizer,
    text: &str,
    max_token_length: usize,
) -> anyhow::Result<Vec<Vec<i64>>> {
    let max = tokenizer.model_max_length();
    anyhow::ensure!(
        max > 2,
        "model max length {max} leaves no room between bos and eos"
    );
    let chunk = max - 2;
    let windows = (max_token_length / chunk).max(1);
    let capacity = windows * chunk;

    let mut content = tokenizer.tokenize(text, Padding::Longest, false, false)?;
    if content.len() > capacity {
        let removed = tokenizer.decode(&content[capacity..])?;
        tracing::warn!(
            "The following part of your input was truncated because the model can only handle sequences up to {capacity} tokens: {removed}"
        );
        content.truncate(capacity);
    }
    content.resize(capacity, tokenizer.pad_token_id());

    Ok(content
        .chunks(chunk)
        .map(|part| {
            let mut ids = Vec::with_capacity(max);
            ids.push(tokenizer.bos_token_id());
            ids.extend_from_slice(part);
            ids.push(tokenizer.eos_token_id());
            ids
        })
        .collect())
}

pub fn tokenize_caption(
    tokenizer: &dyn Tokenizer,
    caption: &str,
    opts: &CaptionOptions,
    rng: &mut dyn rand::RngCore,
) -> anyhow::Result<TokenizedCaption> {
    let caption = prepare_caption(caption, opts, tokenizer, rng);
    let ids = tokenize_truncated(
        tokenizer,
        &caption,
        opts.padding(),
        opts.add_special_tokens(),
    )?;
    Ok(TokenizedCaption {
        caption,
        ids: token_ids(ids),
    })
}
