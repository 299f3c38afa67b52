//! Embedding pipeline: paired batches in, one normalized embedding per sample out.

use anyhow::{bail, Context, Result};
use ndarray::{concatenate, Array2, Array4, ArrayView2, Axis};

use crate::config::{AudioConfig, LoaderConfig};
use crate::loader::{DataLoader, Dataset};
use crate::models::EmbeddingNetwork;
use crate::video::{ClipDescriptor, ClipError, FrameOptions, VideoAudioDataset};

/// Same floor as the usual `x / max(|x|, eps)` normalization
const NORM_EPS: f32 = 1e-12;

/// Loader over one clip, tagged with the clip's label
pub struct ClipLoader<D: Dataset> {
    pub label: String,
    pub loader: DataLoader<D>,
}

/// All embeddings of one clip, in frame order
#[derive(Debug, Clone)]
pub struct ClipEmbeddings {
    pub label: String,
    pub embeddings: Array2<f32>,
}

impl ClipEmbeddings {
    pub fn len(&self) -> usize {
        self.embeddings.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.nrows() == 0
    }
}

/// Build one paired video/audio loader per clip. Clips are decoded eagerly so
/// a missing or unreadable video fails here, before any inference runs.
pub fn tsne_loaders(
    clips: &[ClipDescriptor],
    loader: &LoaderConfig,
    audio: &AudioConfig,
) -> Result<Vec<ClipLoader<VideoAudioDataset>>> {
    clips
        .iter()
        .map(|clip| -> Result<ClipLoader<VideoAudioDataset>> {
            let dataset = VideoAudioDataset::open(clip, FrameOptions::from(loader), audio)
                .with_context(|| format!("Failed to open clip {}", clip.filename.display()))?;
            Ok(ClipLoader {
                label: clip.label(),
                loader: DataLoader::new(dataset, loader.batch_size, loader.num_workers)?,
            })
        })
        .collect()
}

/// Scale every row to unit L2 norm
pub fn l2_normalize(embeddings: &mut Array2<f32>) {
    for mut row in embeddings.rows_mut() {
        let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt().max(NORM_EPS);
        row.mapv_inplace(|x| x / norm);
    }
}

/// Runs the frame-stack and sample networks over paired batches
pub struct EmbeddingPipeline<'a> {
    stack_net: &'a dyn EmbeddingNetwork,
    sample_net: &'a dyn EmbeddingNetwork,
}

impl<'a> EmbeddingPipeline<'a> {
    pub fn new(stack_net: &'a dyn EmbeddingNetwork, sample_net: &'a dyn EmbeddingNetwork) -> Self {
        Self {
            stack_net,
            sample_net,
        }
    }

    /// Embed one batch: both networks, concatenated on the feature axis, normalized
    pub fn embed_batch(&self, stack: &Array4<f32>, sample: &Array2<f32>) -> Result<Array2<f32>> {
        if stack.shape()[0] != sample.nrows() {
            bail!(
                "Stack batch has {} samples but sample batch has {}",
                stack.shape()[0],
                sample.nrows()
            );
        }

        let stack_embed = self.stack_net.embed(stack.view().into_dyn())?;
        let sample_embed = self.sample_net.embed(sample.view().into_dyn())?;

        for (net, embed) in [(self.stack_net, &stack_embed), (self.sample_net, &sample_embed)] {
            if embed.nrows() != sample.nrows() {
                bail!(
                    "Network {} returned {} rows for a batch of {}",
                    net.name(),
                    embed.nrows(),
                    sample.nrows()
                );
            }
        }

        let mut embed = concatenate(Axis(1), &[stack_embed.view(), sample_embed.view()])?;
        l2_normalize(&mut embed);
        Ok(embed)
    }

    /// Embed every sample of a clip, preserving frame order
    pub fn embed_clip<D>(&self, clip: &ClipLoader<D>) -> Result<ClipEmbeddings>
    where
        D: Dataset<Batch = (Array4<f32>, Array2<f32>)>,
    {
        let mut embed_batches = Vec::with_capacity(clip.loader.len());
        for (index, batch) in clip.loader.iter().enumerate() {
            let (stack, sample) =
                batch.with_context(|| format!("Failed to load batch {} of {}", index, clip.label))?;
            embed_batches.push(self.embed_batch(&stack, &sample)?);
            tracing::debug!(clip = %clip.label, batch = index, "Embedded batch");
        }

        if embed_batches.is_empty() {
            return Err(ClipError::EmptyClip(clip.label.clone()).into());
        }

        let views: Vec<ArrayView2<f32>> = embed_batches.iter().map(|b| b.view()).collect();
        let embeddings = concatenate(Axis(0), &views[..])?;

        tracing::info!(
            clip = %clip.label,
            samples = embeddings.nrows(),
            dim = embeddings.ncols(),
            "Embedded clip"
        );

        Ok(ClipEmbeddings {
            label: clip.label.clone(),
            embeddings,
        })
    }

    /// Embed each clip in order
    pub fn embed_clips<D>(&self, clips: &[ClipLoader<D>]) -> Result<Vec<ClipEmbeddings>>
    where
        D: Dataset<Batch = (Array4<f32>, Array2<f32>)>,
    {
        clips.iter().map(|clip| self.embed_clip(clip)).collect()
    }
}

/// Stack all clips' embeddings into one matrix. Returns the matrix and the
/// cumulative row offsets: clip `i` owns rows `offsets[i]..offsets[i + 1]`.
pub fn join_embeddings(clips: &[ClipEmbeddings]) -> Result<(Array2<f32>, Vec<usize>)> {
    if clips.is_empty() {
        bail!("No clip embeddings to join");
    }
    if let Some(empty) = clips.iter().find(|c| c.is_empty()) {
        return Err(ClipError::EmptyClip(empty.label.clone()).into());
    }

    let mut offsets = Vec::with_capacity(clips.len() + 1);
    offsets.push(0);
    for clip in clips {
        offsets.push(offsets[offsets.len() - 1] + clip.len());
    }

    let views: Vec<ArrayView2<f32>> = clips.iter().map(|c| c.embeddings.view()).collect();
    Ok((concatenate(Axis(0), &views[..])?, offsets))
}
