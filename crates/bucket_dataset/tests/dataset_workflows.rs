//! End-to-end workflows over `BucketDataset` with fake collaborators.

mod common;

use bucket_dataset::conditioning::encode_prompt;
use bucket_dataset::{
    collate, BucketBatchSampler, BucketDataset, BucketDatasetError, BucketKey, CaptionOptions,
    DatasetConfig, ExampleImage, ExampleText, NullProgress, SampleRegistry, TextBranch, TextStack,
};
use burn::tensor::TensorData;
use burn_ndarray::NdArray;
use common::{
    sample, small_config, ConstTextEncoder, CountingImageEncoder, RefusingTextEncoder,
    SolidLoader, WordTokenizer,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn single_stack() -> TextStack {
    TextStack::Single(TextBranch::new(Arc::new(WordTokenizer::new(16))))
}

fn dual_stack() -> TextStack {
    TextStack::Dual(
        TextBranch::new(Arc::new(WordTokenizer::new(8)))
            .with_encoder(Arc::new(ConstTextEncoder { dim: 4 })),
        TextBranch::new(Arc::new(WordTokenizer::new(8)))
            .with_encoder(Arc::new(ConstTextEncoder { dim: 6 })),
    )
}

fn dataset(
    cfg: DatasetConfig,
    registry: SampleRegistry,
    text: Option<TextStack>,
) -> Result<BucketDataset, BucketDatasetError> {
    BucketDataset::new(
        cfg,
        registry,
        text,
        Arc::new(SolidLoader),
        Arc::new(NullProgress),
    )
}

fn f32s(data: &TensorData) -> Vec<f32> {
    data.to_vec::<f32>().unwrap()
}

#[test]
fn three_instances_one_reference_end_to_end() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cfg = DatasetConfig {
        cache_dir: tmp.path().to_path_buf(),
        seed: Some(3),
        ..DatasetConfig::default()
    };
    let registry = SampleRegistry::new(
        vec![
            sample("inst/0.png", 512, 512, "sks dog"),
            sample("inst/1.png", 512, 512, "sks dog on grass"),
            sample("inst/2.png", 512, 512, "sks dog at night"),
        ],
        vec![sample("class/0.png", 512, 512, "a dog")],
    );
    let mut ds = dataset(cfg, registry, Some(single_stack()))?;

    let totals = ds.make_buckets_with_caching(None);
    assert_eq!(totals.instances, 3);
    assert_eq!(totals.references, 1);
    assert_eq!(totals.buckets, 1);
    assert_eq!(ds.samples().len(), 4);
    assert!(ds.materialized().failed.is_empty());
    assert_eq!(ds.len(), 6);

    let key = BucketKey::new(512, 512, 0);
    assert_eq!(ds.resolutions(), &[key]);
    ds.shuffle_buckets();
    let pairing = ds.pairing(&key).unwrap();
    assert_eq!(pairing.len(), 6);
    for (i, entry) in pairing.iter().enumerate() {
        assert_eq!(entry.is_reference, i % 2 == 1);
    }

    let mut wraps = 0;
    for _ in 0..6 {
        let (index, wrapped) = ds.get_example(key)?;
        wraps += usize::from(wrapped);
        let example = ds.get_item(index)?;
        assert_eq!(example.resolution, (512, 512));
        match &example.image {
            ExampleImage::Pixels(t) => assert_eq!(t.shape, vec![3, 512, 512]),
            other => panic!("expected pixels, got {other:?}"),
        }
        match &example.text {
            ExampleText::TokenIds(t) => assert_eq!(t.shape, vec![1, 16]),
            other => panic!("expected token ids, got {other:?}"),
        }
    }
    assert_eq!(wraps, 1);
    assert!(matches!(
        ds.get_item(4),
        Err(BucketDatasetError::IndexOutOfRange { index: 4, len: 4 })
    ));
    Ok(())
}

#[test]
fn failing_sample_leaves_no_artifacts() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let registry = SampleRegistry::new(
        vec![
            sample("a.png", 128, 128, "sks cat"),
            sample("corrupt.png", 128, 128, "sks cat"),
            sample("wide.png", 300, 100, "sks cat panorama"),
        ],
        vec![sample("r.png", 100, 100, "a cat")],
    );
    let mut ds = dataset(small_config(tmp.path()), registry, Some(dual_stack()))?;
    let encoder = Arc::new(CountingImageEncoder::default());
    ds.make_buckets_with_caching(Some(encoder.clone()));

    let corrupt = Path::new("corrupt.png");
    assert_eq!(ds.materialized().failed, vec![PathBuf::from("corrupt.png")]);
    assert!(!ds.cache().contains_any(corrupt));
    assert!(ds.samples().iter().all(|s| s.path != corrupt));
    assert_eq!(ds.samples().len(), 3);

    let square = BucketKey::new(128, 128, 0);
    let wide = BucketKey::new(192, 64, 0);
    let sizes = &ds.materialized().bucket_sizes;
    assert_eq!(sizes.get(&square), Some(&2));
    assert_eq!(sizes.get(&wide), Some(&1));
    assert_eq!(ds.len(), 3);
    assert_eq!(encoder.calls(), 3);

    ds.shuffle_buckets();
    let (index, _) = ds.get_example(square)?;
    let example = ds.get_item(index)?;
    match &example.image {
        ExampleImage::Latent(t) => assert_eq!(t.shape, vec![4, 16, 16]),
        other => panic!("expected a cached latent, got {other:?}"),
    }
    match &example.text {
        ExampleText::Conditioning(t) => assert_eq!(t.shape, vec![1, 8, 10]),
        other => panic!("expected conditioning, got {other:?}"),
    }
    let added = example.added_conditioning.expect("dual stacks add conditioning");
    assert_eq!(added.text_embeds.shape, vec![1, 6]);
    assert_eq!(
        f32s(&added.time_ids),
        vec![128.0, 128.0, 0.0, 0.0, 128.0, 128.0]
    );
    Ok(())
}

#[test]
fn latent_cache_survives_a_restart() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let registry = || {
        SampleRegistry::new(
            vec![
                sample("a.png", 128, 128, "one"),
                sample("b.png", 300, 100, "two"),
            ],
            Vec::new(),
        )
    };

    let first_encoder = Arc::new(CountingImageEncoder::default());
    let mut first = dataset(small_config(tmp.path()), registry(), None)?;
    first.make_buckets_with_caching(Some(first_encoder.clone()));
    assert_eq!(first_encoder.calls(), 2);
    let cache_path = first.cache_file().path().to_path_buf();
    assert!(cache_path.ends_with("image_cache_128.safetensors"));
    let written = fs::read(&cache_path)?;
    let modified = fs::metadata(&cache_path)?.modified()?;

    let second_encoder = Arc::new(CountingImageEncoder::default());
    let mut second = dataset(small_config(tmp.path()), registry(), None)?;
    second.make_buckets_with_caching(Some(second_encoder.clone()));
    assert_eq!(second_encoder.calls(), 0);
    for name in ["a.png", "b.png"] {
        let path = Path::new(name);
        let before = first.cache().latents.get(path).unwrap();
        let after = second.cache().latents.get(path).unwrap();
        assert_eq!(before.shape, after.shape);
        assert_eq!(f32s(&before), f32s(&after));
    }
    // Unchanged key set: the snapshot is left alone.
    assert_eq!(fs::read(&cache_path)?, written);
    assert_eq!(fs::metadata(&cache_path)?.modified()?, modified);

    let mut grown = registry();
    grown.instance.push(sample("c.png", 128, 128, "three"));
    let third_encoder = Arc::new(CountingImageEncoder::default());
    let mut third = dataset(small_config(tmp.path()), grown, None)?;
    third.make_buckets_with_caching(Some(third_encoder.clone()));
    assert_eq!(third_encoder.calls(), 1);
    assert_eq!(third.cache_file().load()?.len(), 3);
    Ok(())
}

#[test]
fn no_latents_means_no_cache_file() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let registry = SampleRegistry::new(
        vec![sample("corrupt_a.png", 128, 128, "x"), sample("corrupt_b.png", 128, 128, "y")],
        Vec::new(),
    );
    let mut ds = dataset(small_config(tmp.path()), registry, None)?;
    ds.make_buckets_with_caching(Some(Arc::new(CountingImageEncoder::default())));
    assert!(ds.is_empty());
    assert!(ds.resolutions().is_empty());
    assert!(!ds.cache_file().exists());
    assert_eq!(fs::read_dir(tmp.path())?.count(), 0);
    Ok(())
}

#[test]
fn debug_mode_returns_inspection_markers() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cfg = DatasetConfig {
        debug_dataset: true,
        ..small_config(tmp.path())
    };
    let registry = SampleRegistry::new(
        vec![
            sample("imgs/first.png", 128, 128, "a photo of sks dog"),
            sample("imgs/second.jpg", 128, 128, "sks dog"),
        ],
        vec![sample("class/only.png", 128, 128, "a dog")],
    );
    let mut ds = dataset(cfg, registry, Some(single_stack()))?;
    let encoder = Arc::new(CountingImageEncoder::default());
    ds.make_buckets_with_caching(Some(encoder.clone()));
    assert_eq!(encoder.calls(), 0);
    assert!(!ds.cache_file().exists());

    let key = BucketKey::new(128, 128, 0);
    ds.shuffle_buckets();
    let names: Vec<_> = ds
        .pairing(&key)
        .unwrap()
        .iter()
        .map(|e| e.path.clone())
        .collect();
    assert_eq!(
        names,
        vec![
            PathBuf::from("imgs/first.png"),
            PathBuf::from("class/only.png"),
            PathBuf::from("imgs/second.jpg"),
            PathBuf::from("class/only.png"),
        ]
    );

    let (index, _) = ds.get_example(key)?;
    let example = ds.get_item(index)?;
    match example.image {
        ExampleImage::Marker { stem, extension } => {
            assert_eq!(stem, PathBuf::from("imgs/first"));
            assert_eq!(extension, ".png");
        }
        other => panic!("expected a marker, got {other:?}"),
    }
    match example.text {
        ExampleText::Inspect { caption, rebuilt } => {
            assert_eq!(caption, "a photo of sks dog");
            assert_eq!(rebuilt, "a photo of sks dog");
        }
        other => panic!("expected inspection text, got {other:?}"),
    }
    Ok(())
}

#[test]
fn configuration_errors_fail_construction() {
    let tmp = tempfile::tempdir().unwrap();
    let shuffle_without_tokenizer = DatasetConfig {
        shuffle_tags: true,
        ..small_config(tmp.path())
    };
    assert!(matches!(
        dataset(shuffle_without_tokenizer, SampleRegistry::default(), None),
        Err(BucketDatasetError::Configuration(_))
    ));

    let no_encoders = TextStack::Dual(
        TextBranch::new(Arc::new(WordTokenizer::new(8))),
        TextBranch::new(Arc::new(WordTokenizer::new(8))),
    );
    assert!(matches!(
        dataset(
            small_config(tmp.path()),
            SampleRegistry::default(),
            Some(no_encoders)
        ),
        Err(BucketDatasetError::Configuration(_))
    ));
}

#[test]
fn shuffled_tags_are_never_cached() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cfg = DatasetConfig {
        shuffle_tags: true,
        ..small_config(tmp.path())
    };
    let registry = SampleRegistry::new(
        vec![sample("a.png", 128, 128, "sks, red, blue, green")],
        Vec::new(),
    );
    let mut ds = dataset(cfg, registry, Some(single_stack()))?;
    ds.make_buckets_with_caching(None);
    assert!(ds.cache().caption_ids.is_empty());

    ds.shuffle_buckets();
    let (index, wrapped) = ds.get_example(BucketKey::new(128, 128, 0))?;
    assert!(wrapped);
    match ds.get_item(index)?.text {
        ExampleText::TokenIds(t) => assert_eq!(t.shape, vec![1, 16]),
        other => panic!("expected token ids, got {other:?}"),
    }
    assert!(ds.cache().caption_ids.is_empty());
    Ok(())
}

#[test]
fn batch_sampler_covers_every_bucket_per_epoch() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let registry = SampleRegistry::new(
        vec![
            sample("s0.png", 128, 128, "square zero"),
            sample("s1.png", 128, 128, "square one"),
            sample("s2.png", 128, 128, "square two"),
            sample("w0.png", 300, 100, "wide zero"),
            sample("w1.png", 300, 100, "wide one"),
        ],
        vec![sample("ref.png", 128, 128, "reference")],
    );
    let mut ds = dataset(small_config(tmp.path()), registry, Some(single_stack()))?;
    ds.make_buckets_with_caching(Some(Arc::new(CountingImageEncoder::default())));
    assert_eq!(ds.len(), 8);

    let mut sampler = BucketBatchSampler::new(2)?;
    let device = Default::default();
    for _epoch in 0..2 {
        sampler.start_epoch(&mut ds);
        let mut batches = 0;
        while let Some(examples) = sampler.next_batch(&mut ds)? {
            let batch = collate::<NdArray<f32>>(&examples, &device)?;
            let (w, h) = batch.resolution;
            assert_eq!(batch.images.dims(), [2, 4, h as usize / 8, w as usize / 8]);
            assert_eq!(batch.input_ids.map(|t| t.dims()), Some([2, 16]));
            batches += 1;
        }
        // 6 paired square entries in 3 batches, 2 wide entries in 1.
        assert_eq!(batches, 4);
        assert_eq!(sampler.batches_drawn(), 4);
    }
    Ok(())
}

#[test]
fn latent_is_evicted_when_conditioning_fails() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let stack = TextStack::Dual(
        TextBranch::new(Arc::new(WordTokenizer::new(8)))
            .with_encoder(Arc::new(ConstTextEncoder { dim: 4 })),
        TextBranch::new(Arc::new(WordTokenizer::new(8)))
            .with_encoder(Arc::new(RefusingTextEncoder {
                max_tokens: 4,
                dim: 6,
            })),
    );
    let registry = SampleRegistry::new(
        vec![
            sample("short.png", 128, 128, "sks cat"),
            sample("long.png", 128, 128, "sks cat sitting on a chair"),
        ],
        Vec::new(),
    );
    let mut ds = dataset(small_config(tmp.path()), registry, Some(stack))?;
    let encoder = Arc::new(CountingImageEncoder::default());
    ds.make_buckets_with_caching(Some(encoder.clone()));

    // Both latents were encoded before the text encoder refused one prompt.
    assert_eq!(encoder.calls(), 2);
    let long = Path::new("long.png");
    assert_eq!(ds.materialized().failed, vec![PathBuf::from("long.png")]);
    assert!(!ds.cache().contains_any(long));
    assert!(ds.cache().latents.contains(Path::new("short.png")));
    assert_eq!(ds.len(), 1);

    let persisted = ds.cache_file().load()?;
    assert_eq!(persisted.len(), 1);
    assert!(persisted.contains_key(Path::new("short.png")));
    Ok(())
}

#[test]
fn failed_cache_write_is_not_fatal() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let not_a_dir = tmp.path().join("cache.txt");
    fs::write(&not_a_dir, b"occupied")?;
    let registry = SampleRegistry::new(vec![sample("a.png", 128, 128, "one")], Vec::new());
    let mut ds = dataset(small_config(&not_a_dir), registry, None)?;
    let encoder = Arc::new(CountingImageEncoder::default());
    let totals = ds.make_buckets_with_caching(Some(encoder.clone()));

    assert_eq!(totals.examples, 1);
    assert_eq!(encoder.calls(), 1);
    assert!(ds.cache().latents.contains(Path::new("a.png")));
    assert!(!ds.cache_file().exists());
    Ok(())
}

#[test]
fn corrupt_cache_file_is_rebuilt() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let registry = SampleRegistry::new(
        vec![
            sample("a.png", 128, 128, "one"),
            sample("b.png", 300, 100, "two"),
        ],
        Vec::new(),
    );
    let mut ds = dataset(small_config(tmp.path()), registry, None)?;
    fs::write(ds.cache_file().path(), b"definitely not safetensors")?;
    assert!(ds.cache_file().load().is_err());

    let encoder = Arc::new(CountingImageEncoder::default());
    ds.make_buckets_with_caching(Some(encoder.clone()));
    assert_eq!(encoder.calls(), 2);
    assert_eq!(ds.len(), 2);
    assert_eq!(ds.cache_file().load()?.len(), 2);
    Ok(())
}

#[test]
fn long_prompts_are_encoded_in_windows() -> anyhow::Result<()> {
    let opts = CaptionOptions {
        max_token_length: Some(16),
        ..CaptionOptions::default()
    };
    let words: Vec<String> = (0..14).map(|i| format!("w{i}")).collect();
    let first_value_per_row = |data: &TensorData, dim: usize| -> Vec<f32> {
        f32s(data).chunks(dim).map(|row| row[0]).collect()
    };

    // Two windows of 6 content tokens each: the 10-word prompt is padded.
    let fits = words[..10].join(" ");
    let encoded = encode_prompt(&dual_stack(), &fits, &opts, &mut rand::rng())?;
    assert_eq!(encoded.sequence.shape, vec![1, 14, 10]);
    let mut expected = vec![1.0];
    expected.extend((3..13).map(|id| id as f32));
    expected.extend([0.0, 0.0, 2.0]);
    assert_eq!(first_value_per_row(&encoded.sequence, 10), expected);
    assert_eq!(encoded.pooled.shape, vec![1, 6]);
    assert_eq!(f32s(&encoded.pooled), vec![8.0; 6]);

    // 14 words overflow both windows; the last two are dropped.
    let overflow = words.join(" ");
    let encoded = encode_prompt(&dual_stack(), &overflow, &opts, &mut rand::rng())?;
    assert_eq!(encoded.sequence.shape, vec![1, 14, 10]);
    let mut expected = vec![1.0];
    expected.extend((3..15).map(|id| id as f32));
    expected.push(2.0);
    assert_eq!(first_value_per_row(&encoded.sequence, 10), expected);

    // Without windows the same prompt is truncated to one model-length sequence.
    let single = encode_prompt(&dual_stack(), &overflow, &CaptionOptions::default(), &mut rand::rng())?;
    assert_eq!(single.sequence.shape, vec![1, 8, 10]);
    Ok(())
}

#[test]
fn windowed_conditioning_reaches_examples() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cfg = DatasetConfig {
        max_token_length: Some(16),
        ..small_config(tmp.path())
    };
    let caption = "a very long caption that does not fit one window";
    let registry = SampleRegistry::new(vec![sample("a.png", 128, 128, caption)], Vec::new());
    let mut ds = dataset(cfg, registry, Some(dual_stack()))?;
    ds.make_buckets_with_caching(None);
    ds.shuffle_buckets();
    let (index, _) = ds.get_example(BucketKey::new(128, 128, 0))?;
    let example = ds.get_item(index)?;
    match &example.text {
        ExampleText::Conditioning(t) => assert_eq!(t.shape, vec![1, 14, 10]),
        other => panic!("expected conditioning, got {other:?}"),
    }
    Ok(())
}
