//! Kiosk replay: drive a [`ScanSession`] from a directory of camera frames.
//!
//! Each frame is sent for face detection; once the debouncer reports a
//! stable single face, that frame is submitted as the transaction probe.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use armory_core::session::{ScanContext, ScanPhase};
use armory_core::types::BoundingBox;
use armory_core::{FaceDebouncer, ScanSession};

use crate::client::{encode_bytes, ApiClient};

/// What the replay loop needs from the daemon.
pub trait ScanBackend {
    fn detect(&self, frame: &[u8]) -> impl Future<Output = Result<Vec<BoundingBox>>>;

    /// Submit the triggering frame. Returns `(success, message)`.
    fn submit(&self, context: &ScanContext, frame: &[u8]) -> impl Future<Output = Result<(bool, String)>>;
}

impl ScanBackend for ApiClient {
    async fn detect(&self, frame: &[u8]) -> Result<Vec<BoundingBox>> {
        ApiClient::detect(self, encode_bytes(frame)).await
    }

    async fn submit(&self, context: &ScanContext, frame: &[u8]) -> Result<(bool, String)> {
        let resp = self
            .transaction(
                &context.subject_id,
                &context.weapon_code,
                context.kind,
                encode_bytes(frame),
                None,
            )
            .await?;
        let success = resp["transaction_success"].as_bool().unwrap_or(false);
        let message = resp["message"].as_str().unwrap_or("no message").to_string();
        Ok((success, message))
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub debounce_frames: u32,
    pub min_face_px: f32,
    pub reset_delay: Duration,
    /// Further attempts allowed after a failed verification.
    pub retries: u32,
}

/// How a replay ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub success: bool,
    pub message: String,
    /// Frames consumed, including the triggering one.
    pub frames_used: usize,
    pub attempts: u32,
}

/// JPEG and PNG files in `dir`, sorted by file name.
pub fn load_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
            .unwrap_or(false);
        if is_image {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

/// Replay `frames` through one scan session for `context`.
///
/// Stops at the first successful transaction, after waiting out the reset
/// delay so the session re-arms, or fails once retries or frames run out.
pub async fn replay<B: ScanBackend>(
    backend: &B,
    context: ScanContext,
    frames: &[PathBuf],
    options: &ScanOptions,
) -> Result<ScanReport> {
    let mut session = ScanSession::new(
        FaceDebouncer::new(options.debounce_frames, options.min_face_px),
        options.reset_delay,
    );
    session.arm(context);
    let mut attempts = 0u32;

    for (index, path) in frames.iter().enumerate() {
        let frame = std::fs::read(path).with_context(|| format!("reading frame {}", path.display()))?;
        let faces = backend.detect(&frame).await?;
        tracing::debug!(frame = %path.display(), faces = faces.len(), "frame observed");

        let Some(triggered) = session.observe_faces(&faces) else {
            continue;
        };
        attempts += 1;
        tracing::info!(frame = %path.display(), attempt = attempts, "face stable; verifying");
        let (success, message) = backend.submit(&triggered, &frame).await?;
        session.finish(success, message.clone(), Instant::now());

        if success {
            tokio::time::sleep(options.reset_delay).await;
            let rearmed = session.tick(Instant::now());
            tracing::info!(rearmed, "transaction complete");
            return Ok(ScanReport {
                success,
                message,
                frames_used: index + 1,
                attempts,
            });
        }

        if attempts > options.retries {
            return Ok(ScanReport {
                success,
                message,
                frames_used: index + 1,
                attempts,
            });
        }
        tracing::warn!(%message, "verification failed; retrying");
        session.retry();
    }

    match session.phase() {
        ScanPhase::AwaitingFace(_) if attempts == 0 => {
            bail!("no stable face in {} frames", frames.len())
        }
        _ => bail!("frames ran out after {attempts} attempt(s)"),
    }
}
