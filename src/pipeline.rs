use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::NarratorConfig;
use crate::detection::{Detection, DetectionAdapter, Frame};
use crate::error::DetectionError;
use crate::faces::{FaceAnalyzer, FaceObservation};
use crate::heuristics::HeuristicAnalyzer;
use crate::overlay::{Overlay, build_overlays};
use crate::queue::DescriptionQueue;
use crate::sampler::FrameSampler;
use crate::scene::SceneDescriptor;

/// A finished description, delivered in request order.
#[derive(Debug, Clone)]
pub struct Commentary {
    pub text: String,
    pub people: usize,
    pub requested_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameOutcome {
    /// Fresh overlays when the overlay throttle let this frame through.
    pub overlays: Option<Vec<Overlay>>,
    pub commentary_requested: bool,
}

struct PendingCommentary {
    people: usize,
    requested_at: Instant,
    description: BoxFuture<'static, String>,
}

/// Stops a running pipeline from another task.
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    running: Arc<RwLock<bool>>,
}

impl StopHandle {
    /// Takes effect even when issued before `run` starts.
    pub async fn stop(&self) {
        info!("Stopping pipeline...");
        self.stopped.store(true, Ordering::SeqCst);
        *self.running.write().await = false;
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub overlay_refreshes: u64,
    pub commentary_requests: u64,
    /// Commentary slots skipped because the backlog was full
    pub commentary_skipped: u64,
}

/// Frames in, overlays and throttled commentary out.
pub struct CommentaryPipeline {
    adapter: DetectionAdapter,
    faces: Box<dyn FaceAnalyzer>,
    analyzer: HeuristicAnalyzer,
    overlay_sampler: FrameSampler,
    commentary_sampler: FrameSampler,
    queue: DescriptionQueue,
    pending: mpsc::UnboundedSender<PendingCommentary>,
    outstanding: Arc<AtomicUsize>,
    max_pending_commentary: usize,
    scenic_mode: bool,
    attach_frames: bool,
    max_frame_dimension: u32,
    stopped: Arc<AtomicBool>,
    running: Arc<RwLock<bool>>,
    stats: PipelineStats,
}

impl CommentaryPipeline {
    /// Builds the pipeline and returns the receiving end of its commentary
    /// stream. Must be called inside a tokio runtime.
    pub fn new(
        config: &NarratorConfig,
        adapter: DetectionAdapter,
        faces: Box<dyn FaceAnalyzer>,
        queue: DescriptionQueue,
    ) -> (Self, mpsc::UnboundedReceiver<Commentary>) {
        info!("Initializing scene commentary pipeline");

        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (commentary_tx, commentary_rx) = mpsc::unbounded_channel();
        let outstanding = Arc::new(AtomicUsize::new(0));
        tokio::spawn(deliver_commentary(pending_rx, commentary_tx, Arc::clone(&outstanding)));

        let analyzer = HeuristicAnalyzer::new(&config.heuristics, adapter.viewport());
        let pipeline = Self {
            adapter,
            faces,
            analyzer,
            overlay_sampler: FrameSampler::new("overlay", config.sampling.overlay_interval()),
            commentary_sampler: FrameSampler::new("commentary", config.sampling.commentary_interval()),
            queue,
            pending: pending_tx,
            outstanding,
            max_pending_commentary: config.sampling.max_pending_commentary,
            scenic_mode: config.commentary.scenic_mode,
            attach_frames: config.commentary.attach_frames,
            max_frame_dimension: config.commentary.max_frame_dimension,
            stopped: Arc::new(AtomicBool::new(false)),
            running: Arc::new(RwLock::new(false)),
            stats: PipelineStats::default(),
        };
        (pipeline, commentary_rx)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stopped: Arc::clone(&self.stopped),
            running: Arc::clone(&self.running),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.clone()
    }

    pub fn queue(&self) -> &DescriptionQueue {
        &self.queue
    }

    /// Requested descriptions that have not been delivered yet.
    pub fn pending_commentary(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Consumes frames until the channel closes, the detector runs dry, or
    /// the pipeline is stopped. Returns the number of frames handled.
    pub async fn run(&mut self, mut frames: mpsc::Receiver<Frame>) -> Result<u64> {
        if self.stopped.load(Ordering::SeqCst) {
            info!("Pipeline was stopped before it started");
            return Ok(0);
        }
        info!("Starting scene commentary loop");
        *self.running.write().await = true;

        let mut frame_count = 0u64;
        let mut last_stats_time = std::time::Instant::now();

        while let Some(frame) = frames.recv().await {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            match self.process_frame(&frame, Instant::now()).await {
                Ok(_) => {
                    frame_count += 1;
                    if frame_count % 100 == 0 {
                        let fps = 100.0 / last_stats_time.elapsed().as_secs_f32();
                        info!("Processed {} frames, current FPS: {:.2}", frame_count, fps);
                        last_stats_time = std::time::Instant::now();
                    }
                }
                Err(DetectionError::Exhausted) => {
                    info!("Detection source exhausted");
                    break;
                }
                Err(e) => error!("Frame processing error: {}", e),
            }
        }

        *self.running.write().await = false;
        info!("Pipeline stopped after processing {} frames", frame_count);
        Ok(frame_count)
    }

    /// Runs detection on an overlay-throttled frame. A detector failure other
    /// than exhaustion still produces commentary, carrying the error.
    pub async fn process_frame(&mut self, frame: &Frame, now: Instant) -> Result<FrameOutcome, DetectionError> {
        self.stats.frames_processed += 1;
        if !self.overlay_sampler.try_accept(now) {
            return Ok(FrameOutcome::default());
        }

        let detections = match self.adapter.detect(frame).await {
            Ok(detections) => detections,
            Err(DetectionError::Exhausted) => return Err(DetectionError::Exhausted),
            Err(e) => {
                warn!("Detection failed: {}", e);
                let commentary_requested = self.commentary_slot_open(now)
                    && self.request_commentary(SceneDescriptor::failed(e.to_string()), now);
                return Ok(FrameOutcome {
                    overlays: None,
                    commentary_requested,
                });
            }
        };

        let faces = self.faces.analyze(frame).await.unwrap_or_else(|e| {
            warn!("Face analysis failed, continuing without faces: {}", e);
            Vec::new()
        });

        Ok(self.describe(&detections, &faces, Some(frame), now))
    }

    /// Same as [`process_frame`](Self::process_frame) for detections that were
    /// produced elsewhere. They are normalized here.
    pub fn process_observation(
        &mut self,
        detections: Vec<Detection>,
        faces: &[FaceObservation],
        frame: Option<&Frame>,
        now: Instant,
    ) -> FrameOutcome {
        self.stats.frames_processed += 1;
        if !self.overlay_sampler.try_accept(now) {
            return FrameOutcome::default();
        }
        let detections = self.adapter.normalize(detections);
        self.describe(&detections, faces, frame, now)
    }

    fn describe(
        &mut self,
        detections: &[Detection],
        faces: &[FaceObservation],
        frame: Option<&Frame>,
        now: Instant,
    ) -> FrameOutcome {
        self.stats.overlay_refreshes += 1;
        let overlays = build_overlays(detections);
        let analysis = self.analyzer.analyze(detections, faces, now);
        debug!(
            "👁️ {} people, {} objects, {} tracked",
            analysis.people.len(),
            analysis.objects.len(),
            self.analyzer.tracked_people()
        );

        let mut commentary_requested = false;
        if self.commentary_slot_open(now) {
            let descriptor = SceneDescriptor {
                people: analysis.people,
                objects: analysis.objects,
                frame: frame.and_then(|f| self.encode_frame(f)),
                is_scenic: self.scenic_mode,
                error: None,
            };
            commentary_requested = self.request_commentary(descriptor, now);
        }

        FrameOutcome {
            overlays: Some(overlays),
            commentary_requested,
        }
    }

    /// The commentary throttle. A slot that comes due while the backlog is
    /// full is spent without a request.
    fn commentary_slot_open(&mut self, now: Instant) -> bool {
        if !self.commentary_sampler.try_accept(now) {
            return false;
        }
        if self.pending_commentary() >= self.max_pending_commentary {
            self.stats.commentary_skipped += 1;
            debug!("Commentary backlog full, skipping this slot");
            return false;
        }
        true
    }

    fn encode_frame(&self, frame: &Frame) -> Option<String> {
        if !self.attach_frames {
            return None;
        }
        match frame.encode_base64_jpeg(self.max_frame_dimension) {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                warn!("Could not attach frame, describing without it: {}", e);
                None
            }
        }
    }

    fn request_commentary(&mut self, descriptor: SceneDescriptor, now: Instant) -> bool {
        let people = descriptor.people.len();
        let description = Box::pin(self.queue.enqueue(descriptor));
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let accepted = self
            .pending
            .send(PendingCommentary {
                people,
                requested_at: now,
                description,
            })
            .is_ok();
        if accepted {
            self.stats.commentary_requests += 1;
            debug!("📝 Commentary requested for {} people", people);
        } else {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        accepted
    }
}

async fn deliver_commentary(
    mut pending: mpsc::UnboundedReceiver<PendingCommentary>,
    commentary: mpsc::UnboundedSender<Commentary>,
    outstanding: Arc<AtomicUsize>,
) {
    while let Some(request) = pending.recv().await {
        let text = request.description.await;
        outstanding.fetch_sub(1, Ordering::SeqCst);
        info!("🗣️ {}", text);
        if commentary
            .send(Commentary {
                text,
                people: request.people,
                requested_at: request.requested_at,
            })
            .is_err()
        {
            debug!("Commentary receiver dropped");
        }
    }
}
