//! Prompt encoding for text stacks, and dual-encoder conditioning tensors.

use crate::captions::{
    build_strict_tokens, shuffle_tags, tokenize_truncated, tokenize_windows, CaptionOptions,
};
use crate::interfaces::{Padding, TextStack};
use crate::tensor::{concat_last_dim, f32_values, token_ids};
use crate::types::{AddedConditioning, TextEncoding};
use anyhow::Context;
use burn::tensor::TensorData;

/// Run every branch of the stack over `prompt`.
///
/// Sequence embeddings are concatenated along the feature dimension; the pooled
/// embedding comes from the final encoder only. With `max_token_length` set, each
/// branch encodes the prompt window by window and merges the windows.
pub fn encode_prompt(
    stack: &TextStack,
    prompt: &str,
    opts: &CaptionOptions,
    rng: &mut dyn rand::RngCore,
) -> anyhow::Result<TextEncoding> {
    let prompt = if opts.shuffle_tags {
        shuffle_tags(prompt, rng)
    } else {
        prompt.to_string()
    };

    let mut sequences = Vec::new();
    let mut pooled = None;
    for (i, branch) in stack.branches().into_iter().enumerate() {
        let tokenizer = branch.tokenizer.as_ref();
        let text = if opts.strict_tokens {
            build_strict_tokens(&prompt, tokenizer.bos_token(), tokenizer.eos_token())
        } else {
            prompt.clone()
        };
        let encoder = branch
            .encoder
            .as_ref()
            .with_context(|| format!("text encoder {i} is not configured"))?;
        let encoded = match opts.max_token_length {
            Some(max_tokens) => {
                let windows = tokenize_windows(tokenizer, &text, max_tokens)?
                    .into_iter()
                    .map(|ids| encoder.encode(&token_ids(ids)))
                    .collect::<anyhow::Result<Vec<_>>>()
                    .with_context(|| format!("text encoder {i} failed"))?;
                merge_windows(&windows)?
            }
            None => {
                let ids = tokenize_truncated(
                    tokenizer,
                    &text,
                    Padding::MaxLength,
                    opts.add_special_tokens(),
                )?;
                encoder
                    .encode(&token_ids(ids))
                    .with_context(|| format!("text encoder {i} failed"))?
            }
        };
        sequences.push(encoded.sequence);
        pooled = Some(encoded.pooled);
    }

    let sequence = concat_last_dim(&sequences)?;
    let pooled = pooled.context("text stack has no branches")?;
    let pooled_values = f32_values(&pooled)?;
    let pooled = TensorData::new(pooled_values.clone(), [1, pooled_values.len()]);
    Ok(TextEncoding { sequence, pooled })
}

/// Join per-window encodings into one sequence: the first window's bos row, the
/// inner rows of every window, then the last window's final row. The pooled
/// embedding is the first window's.
fn merge_windows(windows: &[TextEncoding]) -> anyhow::Result<TextEncoding> {
    let first = windows.first().context("prompt produced no windows")?;
    let [_, len, dim] = first.sequence.shape[..] else {
        anyhow::bail!("expected [1, seq, dim] embeddings, got {:?}", first.sequence.shape);
    };
    anyhow::ensure!(len > 2, "window of {len} tokens has no inner rows");

    let mut rows = Vec::with_capacity((windows.len() * (len - 2) + 2) * dim);
    let mut last = Vec::new();
    for (k, window) in windows.iter().enumerate() {
        anyhow::ensure!(
            window.sequence.shape == first.sequence.shape,
            "window {k} has shape {:?}, expected {:?}",
            window.sequence.shape,
            first.sequence.shape
        );
        let values = f32_values(&window.sequence)?;
        if k == 0 {
            rows.extend_from_slice(&values[..dim]);
        }
        rows.extend_from_slice(&values[dim..(len - 1) * dim]);
        last = values[(len - 1) * dim..].to_vec();
    }
    rows.extend_from_slice(&last);
    let seq = rows.len() / dim;
    Ok(TextEncoding {
        sequence: TensorData::new(rows, [1, seq, dim]),
        pooled: first.pooled.clone(),
    })
}

/// `[orig_w, orig_h, crop_top, crop_left, target_w, target_h]` for an uncropped bucket image.
pub fn time_ids(resolution: (u32, u32)) -> TensorData {
    let (w, h) = (resolution.0 as f32, resolution.1 as f32);
    TensorData::new(vec![w, h, 0.0, 0.0, w, h], [1, 6])
}

pub fn compute_conditioning(
    stack: &TextStack,
    resolution: (u32, u32),
    prompt: &str,
    opts: &CaptionOptions,
    rng: &mut dyn rand::RngCore,
) -> anyhow::Result<(TensorData, AddedConditioning)> {
    let encoded = encode_prompt(stack, prompt, opts, rng)?;
    Ok((
        encoded.sequence,
        AddedConditioning {
            text_embeds: encoded.pooled,
            time_ids: time_ids(resolution),
        },
    ))
}
