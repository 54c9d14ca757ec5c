//! End-to-end phases: synthetic data, model construction, epoch loops and
//! checkpointing around the two trainers.

use std::path::Path;

use anyhow::{Context, Result};
use burn::{
    optim::{decay::WeightDecayConfig, AdamConfig},
    tensor::backend::AutodiffBackend,
};
use colored::Colorize;
use tracing::info;

use super::checkpoint::{load_model, save_model, CheckpointMetadata, Phase};
use super::mutual::TeacherStudentTrainer;
use super::pretrainer::PreTrainer;
use crate::dataset::{
    generate_source, generate_target, IterLoader, SourceBatcher, TargetBatcher,
};
use crate::model::{ClassifierBank, ExperimentConfig, GranularitySpec, ReidEncoder, ReidNet};
use crate::utils::logging::PhaseLogger;
use crate::utils::meters::EpochSummary;

/// Result of the warm-up phase
pub struct PretrainOutcome<B: AutodiffBackend> {
    pub model: ReidNet<B>,
    pub summaries: Vec<EpochSummary>,
}

/// Result of the adaptation phase
pub struct AdaptationOutcome<B: AutodiffBackend> {
    pub student: ReidNet<B>,
    pub teacher: ReidNet<B>,
    pub summaries: Vec<EpochSummary>,
}

/// Train on the labelled source domain; saves `pretrain` under `output_dir`
pub fn run_pretraining<B: AutodiffBackend>(
    config: &ExperimentConfig,
    output_dir: Option<&Path>,
    device: &B::Device,
) -> Result<PretrainOutcome<B>> {
    config.validate().context("invalid experiment configuration")?;
    let settings = &config.pretrain;

    let source = generate_source(&config.source)?;
    // During warm-up the target domain is read with the source layout.
    let target = generate_source(&config.target)?;
    let num_classes = source.num_identities();

    let model: ReidNet<B> = config
        .backbone
        .reid_config(vec![num_classes])
        .init(device)?;

    let mut source_loader = IterLoader::new(
        source,
        SourceBatcher::new(config.source.image_size),
        settings.batch_size,
        settings.seed,
        device.clone(),
    )?;
    let mut target_loader = IterLoader::new(
        target,
        SourceBatcher::new(config.target.image_size),
        settings.batch_size,
        settings.seed.wrapping_add(1),
        device.clone(),
    )?;

    let mut optimizer = AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(settings.weight_decay as f32)))
        .init::<B, ReidNet<B>>();

    println!("{}", "Warm-up Configuration:".cyan().bold());
    println!("  Identities:     {}", num_classes);
    println!("  Epochs:         {}", settings.epochs);
    println!("  Iterations:     {}", settings.iterations);
    println!("  Batch size:     {}", settings.batch_size);
    println!("  Learning rate:  {}", settings.learning_rate);
    println!("  Device:         {:?}", device);
    println!();

    let mut trainer = PreTrainer::new(model, num_classes, settings.triplet, device.clone())?;
    let mut logger = PhaseLogger::new("pretrain", settings.epochs);
    let mut summaries = Vec::with_capacity(settings.epochs);

    for epoch in 0..settings.epochs {
        logger.start_epoch(epoch);
        let summary = trainer.train(
            epoch,
            &mut source_loader,
            &mut target_loader,
            &mut optimizer,
            settings.learning_rate,
            settings.iterations,
            settings.log_every,
        )?;
        logger.end_epoch(summary.loss_ce, summary.loss_tri, summary.precision);
        summaries.push(summary);
    }
    logger.finish();

    let model = trainer.into_model();
    if let Some(dir) = output_dir {
        let metadata = CheckpointMetadata::new(
            Phase::Pretrain,
            settings.epochs.saturating_sub(1),
            summaries.last().map_or(0.0, |s| s.precision),
            vec![num_classes],
        );
        save_model(&model, &dir.join("pretrain"), &metadata)?;
    }

    Ok(PretrainOutcome { model, summaries })
}

/// Restore a warm-up checkpoint written by [`run_pretraining`]
pub fn load_pretrained<B: AutodiffBackend>(
    config: &ExperimentConfig,
    path: &Path,
    device: &B::Device,
) -> Result<ReidNet<B>> {
    let num_classes = config.source.num_identities;
    let model: ReidNet<B> = config
        .backbone
        .reid_config(vec![num_classes])
        .init(device)?;
    load_model(model, path, device)
        .with_context(|| format!("failed to restore warm-up model from {:?}", path))
}

/// Teacher/student adaptation on the pseudo-labelled target domain
///
/// With `warm_start` the backbone is reused under a fresh classifier bank;
/// otherwise training starts from a random encoder.
pub fn run_adaptation<B: AutodiffBackend>(
    config: &ExperimentConfig,
    warm_start: Option<ReidNet<B>>,
    output_dir: Option<&Path>,
    device: &B::Device,
) -> Result<AdaptationOutcome<B>> {
    config.validate().context("invalid experiment configuration")?;
    let settings = &config.adaptation;

    let spec = GranularitySpec::new(settings.cluster_counts.clone())?;
    let reid_config = config.backbone.reid_config(settings.cluster_counts.clone());

    let student = match warm_start {
        Some(model) => {
            let bank = ClassifierBank::new(&spec, model.feature_dim(), device)?;
            model.with_bank(bank)?
        }
        None => reid_config.init(device)?,
    };
    let teacher = reid_config.init_teacher(&student, device)?;

    let target = generate_target(&config.target, spec.as_slice())?;
    let mut target_loader = IterLoader::new(
        target,
        TargetBatcher::new(config.target.image_size, spec.len()),
        settings.batch_size,
        settings.seed,
        device.clone(),
    )?;

    let mut optimizer = AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(settings.weight_decay as f32)))
        .init::<B, ReidNet<B>>();

    println!("{}", "Adaptation Configuration:".cyan().bold());
    println!("  Granularities:  {:?}", spec.as_slice());
    println!("  Chosen:         {}", settings.chosen_granularity);
    println!("  EMA decay:      {}", settings.ema_decay);
    println!("  Loss:           {:?}", settings.loss_combination);
    println!("  Epochs:         {}", settings.epochs);
    println!("  Iterations:     {}", settings.iterations);
    println!("  Device:         {:?}", device);
    println!();

    let mut trainer =
        TeacherStudentTrainer::new(student, teacher, spec.clone(), settings.ema_decay, device.clone())?
            .with_triplet(settings.triplet)
            .with_loss_combination(settings.loss_combination);

    let step = settings.step();
    let mut logger = PhaseLogger::new("adapt", settings.epochs);
    let mut summaries = Vec::with_capacity(settings.epochs);

    for epoch in 0..settings.epochs {
        logger.start_epoch(epoch);
        let summary = trainer.train(epoch, &mut target_loader, &mut optimizer, &step)?;
        logger.end_epoch(summary.loss_ce, summary.loss_tri, summary.precision);
        summaries.push(summary);
    }
    logger.finish();

    info!(
        "Teacher absorbed {} EMA updates",
        trainer.synchronizer().updates()
    );

    let (student, teacher) = trainer.into_models();
    if let Some(dir) = output_dir {
        let metadata = CheckpointMetadata::new(
            Phase::Adaptation,
            settings.epochs.saturating_sub(1),
            summaries.last().map_or(0.0, |s| s.precision),
            student.classifier_bank().granularity().as_slice().to_vec(),
        );
        save_model(&student, &dir.join("student"), &metadata)?;
        save_model(&teacher, &dir.join("teacher"), &metadata)?;
    }

    Ok(AdaptationOutcome {
        student,
        teacher,
        summaries,
    })
}
