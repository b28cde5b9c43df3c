use image::{Rgb, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};
use text_embed::{HashTextEncoder, PromptEmbeddingCheckpoint, TextEncoder};
use training::{run_train, TrainBackend, TrainMode, Trainer, TrainerArgs};

const EMBED_DIM: usize = 16;

fn write_image(path: &Path, shade: u8) -> anyhow::Result<()> {
    let mut img = RgbImage::new(8, 8);
    for pixel in img.pixels_mut() {
        *pixel = Rgb([shade, 128, 200]);
    }
    img.save(path)?;
    Ok(())
}

/// Detection split with one box per frame, cycling through `categories`.
fn create_detection_split(
    root: &Path,
    split: &str,
    frames: usize,
    categories: &[&str],
) -> anyhow::Result<PathBuf> {
    let split_dir = root.join(split);
    let labels_dir = split_dir.join("labels");
    fs::create_dir_all(&labels_dir)?;
    for i in 0..frames {
        let frame_id = (i + 1) as u64;
        let img_name = format!("frame_{frame_id:05}.png");
        write_image(&split_dir.join(&img_name), (i * 30) as u8)?;
        let category = categories[i % categories.len()];
        let meta = serde_json::json!({
            "frame_id": frame_id,
            "image": img_name,
            "image_present": true,
            "labels": [{
                "category": category,
                "bbox_px": null,
                "bbox_norm": [0.1, 0.1, 0.5, 0.5],
            }],
        });
        fs::write(
            labels_dir.join(format!("frame_{frame_id:05}.json")),
            serde_json::to_vec(&meta)?,
        )?;
    }
    Ok(split_dir)
}

fn create_grounding_source(root: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    let img_dir = root.join("web_images");
    fs::create_dir_all(&img_dir)?;
    let mut entries = Vec::new();
    for (i, phrase) in ["red car", "tall tree"].iter().enumerate() {
        let img_name = format!("web_{i}.png");
        write_image(&img_dir.join(&img_name), 200)?;
        entries.push(serde_json::json!({
            "image": img_name,
            "regions": [{ "phrase": phrase, "bbox_norm": [0.2, 0.2, 0.6, 0.6] }],
        }));
    }
    let json_file = root.join("web_annotations.json");
    fs::write(&json_file, serde_json::to_vec(&entries)?)?;
    Ok((img_dir, json_file))
}

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    data_config: PathBuf,
    names: Vec<String>,
}

/// Builds a full on-disk fixture: a detection train dataset, a grounding
/// source, and a validation dataset with a minival split.
fn fixture(nc: usize) -> anyhow::Result<Fixture> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().to_path_buf();

    let names: Vec<String> = (0..nc).map(|i| format!("category {i}")).collect();
    let train_categories: Vec<&str> = names.iter().take(3).map(|s| s.as_str()).collect();

    let det_root = root.join("objects365");
    create_detection_split(&det_root, "train", 4, &train_categories)?;
    let val_root = root.join("lvis");
    create_detection_split(&val_root, "minival", 2, &train_categories)?;
    let (img_dir, json_file) = create_grounding_source(&root)?;

    let train_card = serde_json::json!({
        "path": det_root,
        "train": "train",
        "val": "val",
        "nc": nc,
        "names": names,
    });
    let val_card = serde_json::json!({
        "path": val_root,
        "train": "train",
        "val": "val",
        "minival": "minival",
        "nc": nc,
        "names": names,
    });
    let train_card_path = root.join("objects365.json");
    let val_card_path = root.join("lvis.json");
    fs::write(&train_card_path, serde_json::to_vec(&train_card)?)?;
    fs::write(&val_card_path, serde_json::to_vec(&val_card)?)?;

    let config = serde_json::json!({
        "train": { "sources": [
            { "detection": { "card": train_card_path } },
            { "grounding": { "img_path": img_dir, "json_file": json_file } },
        ] },
        "val": { "sources": [ { "detection": { "card": val_card_path } } ] },
    });
    let data_config = root.join("data.json");
    fs::write(&data_config, serde_json::to_vec(&config)?)?;

    Ok(Fixture {
        _tmp: tmp,
        root,
        data_config,
        names,
    })
}

fn base_args(fixture: &Fixture, mode: TrainMode) -> TrainerArgs {
    let mut args = TrainerArgs::new(mode, fixture.data_config.display().to_string());
    args.embed_dim = EMBED_DIM;
    args.max_boxes = 4;
    args.checkpoint_out = Some(
        fixture
            .root
            .join("checkpoints/detector.bin")
            .display()
            .to_string(),
    );
    args
}

fn prompt_checkpoint(fixture: &Fixture) -> anyhow::Result<PathBuf> {
    let encoder = HashTextEncoder::new(EMBED_DIM);
    let vectors = encoder.encode_batch(&fixture.names)?;
    let ckpt = PromptEmbeddingCheckpoint::new(fixture.names.clone(), vectors);
    let path = fixture.root.join("train_pe.json");
    ckpt.save(&path)?;
    Ok(path)
}

#[test]
fn standard_mode_clamps_class_count() -> anyhow::Result<()> {
    let fixture = fixture(120)?;
    let trainer = Trainer::new(base_args(&fixture, TrainMode::Standard))?;
    let device = Default::default();
    let model = trainer.build_model::<TrainBackend>(None, &device)?;
    // 120 configured classes, but text samples per image are capped at 80.
    assert_eq!(model.nc(), 80);
    assert!(model.has_visual_branch());
    assert!(!model.has_fused_classes());
    Ok(())
}

#[test]
fn linear_probe_surgery_produces_fused_headless_model() -> anyhow::Result<()> {
    let fixture = fixture(5)?;
    let pe_path = prompt_checkpoint(&fixture)?;
    let mut args = base_args(&fixture, TrainMode::LinearProbe);
    args.prompt_embeddings = Some(pe_path.display().to_string());
    let trainer = Trainer::new(args)?;
    let ckpt = PromptEmbeddingCheckpoint::load(&pe_path)?;
    let device = Default::default();
    let model = trainer.build_model::<TrainBackend>(Some(&ckpt), &device)?;

    // Full class count, no visual branch, prompts fused into the head.
    assert_eq!(model.nc(), 5);
    assert!(!model.has_visual_branch());
    assert!(!model.has_prompt_embeddings());
    assert!(model.has_fused_classes());
    Ok(())
}

#[test]
fn linear_probe_without_checkpoint_fails() -> anyhow::Result<()> {
    let fixture = fixture(5)?;
    let args = base_args(&fixture, TrainMode::LinearProbe);
    let err = run_train(args).unwrap_err();
    assert!(err.to_string().contains("prompt-embeddings"));
    Ok(())
}

#[test]
fn from_scratch_run_trains_and_writes_caches() -> anyhow::Result<()> {
    let fixture = fixture(5)?;
    let args = base_args(&fixture, TrainMode::FromScratch);
    run_train(args)?;

    // Checkpoint plus exported prompt embeddings.
    assert!(fixture.root.join("checkpoints/detector.bin").exists());
    assert!(fixture.root.join("checkpoints/detector.pe.json").exists());

    // Embedding caches land next to the first train source root.
    assert!(fixture.root.join("objects365/pos_embeddings.json").exists());
    assert!(fixture.root.join("objects365/neg_embeddings.json").exists());
    Ok(())
}

#[test]
fn second_run_reuses_embedding_caches() -> anyhow::Result<()> {
    let fixture = fixture(5)?;
    run_train(base_args(&fixture, TrainMode::FromScratch))?;

    let pos_cache = fixture.root.join("objects365/pos_embeddings.json");
    let before = fs::read(&pos_cache)?;
    run_train(base_args(&fixture, TrainMode::FromScratch))?;
    let after = fs::read(&pos_cache)?;
    assert_eq!(before, after, "cache file was rewritten on a hit");
    Ok(())
}

#[test]
fn standard_run_completes_on_single_source() -> anyhow::Result<()> {
    let fixture = fixture(5)?;
    run_train(base_args(&fixture, TrainMode::Standard))?;
    assert!(fixture.root.join("checkpoints/detector.bin").exists());
    Ok(())
}

#[test]
fn visual_prompt_run_completes() -> anyhow::Result<()> {
    let fixture = fixture(5)?;
    run_train(base_args(&fixture, TrainMode::VisualPrompt))?;
    assert!(fixture.root.join("checkpoints/detector.bin").exists());
    Ok(())
}

#[test]
fn prompt_free_run_uses_fused_head() -> anyhow::Result<()> {
    let fixture = fixture(5)?;
    let pe_path = prompt_checkpoint(&fixture)?;
    let mut args = base_args(&fixture, TrainMode::PromptFree);
    args.prompt_embeddings = Some(pe_path.display().to_string());
    run_train(args)?;
    assert!(fixture.root.join("checkpoints/detector.bin").exists());
    Ok(())
}
