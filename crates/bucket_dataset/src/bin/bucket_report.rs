use anyhow::Context;
use bucket_dataset::{
    config_fingerprint, make_bucket_resolutions, plan_buckets, scan_directory, DatasetConfig,
    LatentCacheFile, SampleRegistry,
};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "bucket_report",
    about = "Preview resolution buckets and latent cache coverage for a dataset"
)]
struct Args {
    /// Directory of instance images (with optional sibling .txt captions).
    #[arg(long)]
    instance_dir: PathBuf,
    /// Directory of reference (class) images.
    #[arg(long)]
    reference_dir: Option<PathBuf>,
    /// Base training resolution.
    #[arg(long, default_value_t = 512)]
    resolution: u32,
    /// Concept group id assigned to every scanned sample.
    #[arg(long, default_value_t = 0)]
    group: usize,
    /// Directory holding image_cache_{resolution}.safetensors.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Print the plan as JSON instead of text.
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut cfg = DatasetConfig {
        resolution: args.resolution,
        ..DatasetConfig::default()
    }
    .with_env_overrides();
    if let Some(dir) = &args.cache_dir {
        cfg.cache_dir = dir.clone();
    }
    cfg.validate()?;

    let instance = scan_directory(&args.instance_dir, args.group, false)
        .with_context(|| format!("scanning {}", args.instance_dir.display()))?;
    let reference = match &args.reference_dir {
        Some(dir) => scan_directory(dir, args.group, true)
            .with_context(|| format!("scanning {}", dir.display()))?,
        None => Vec::new(),
    };
    let registry = SampleRegistry::new(instance, reference);
    let summary = registry.summary();

    let candidates = make_bucket_resolutions(cfg.resolution, &cfg.bucket);
    let plan = plan_buckets(&registry.instance, &registry.reference, &candidates)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!(
            "{} instance / {} reference images, {} without captions, {} candidate resolutions",
            summary.instances,
            summary.references,
            summary.empty_captions,
            candidates.len()
        );
        for (i, bucket) in plan.iter().enumerate() {
            println!(
                "Bucket {i} {} - Instance Images: {} | Class Images: {} | Max Examples/batch: {}",
                bucket.key, bucket.instances, bucket.references, bucket.examples
            );
        }
        let total: usize = plan.iter().map(|b| b.examples).sum();
        println!("Total Buckets {} - Max Examples/batch: {total}", plan.len());
    }

    let store = LatentCacheFile::for_resolution(
        &cfg.cache_dir,
        cfg.resolution,
        config_fingerprint(&cfg),
    );
    if store.exists() {
        let cached = store.load()?;
        let covered = registry
            .instance
            .iter()
            .chain(&registry.reference)
            .filter(|s| cached.contains_key(&s.path))
            .count();
        println!(
            "Latent cache {}: {} entries, covers {covered}/{} registry images",
            store.path().display(),
            cached.len(),
            summary.instances + summary.references
        );
    } else {
        println!("No latent cache at {}", store.path().display());
    }
    Ok(())
}
