use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError, channel};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use log::{info, warn};
use uuid::Uuid;

use fd_core::{GenerationMode, Payload};

use crate::error::AppError;
use crate::events::JobOutcome;
use crate::job::{JobHandle, JobStatus};
use crate::remote::RemoteService;
use crate::storage::ImageStore;

struct ActiveJob {
    handle: JobHandle,
    cancelled: Arc<AtomicBool>,
    outcome_rx: Receiver<JobOutcome>,
    worker: Option<JoinHandle<()>>,
}

/// Dispatches one generation job at a time to the remote service on a
/// background thread and hands the result back to the foreground exactly
/// once, via [`JobOrchestrator::poll`].
pub struct JobOrchestrator {
    remote: Arc<dyn RemoteService>,
    store: Arc<ImageStore>,
    active: Option<ActiveJob>,
    // Workers of cancelled jobs keep running until their remote call
    // returns; they are joined here once finished.
    orphans: Vec<JoinHandle<()>>,
}

impl JobOrchestrator {
    pub fn new(remote: Arc<dyn RemoteService>, store: Arc<ImageStore>) -> Self {
        Self {
            remote,
            store,
            active: None,
            orphans: Vec::new(),
        }
    }

    pub fn active(&self) -> Option<&JobHandle> {
        self.active.as_ref().map(|a| &a.handle)
    }

    pub fn is_busy(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| !a.handle.status.is_terminal())
    }

    /// Start one job. Refused while another is pending; the UI disables the
    /// trigger too, but the single-slot invariant is enforced here.
    pub fn submit(&mut self, endpoint: &str, payload: Payload) -> Result<JobHandle, AppError> {
        if self.is_busy() {
            return Err(AppError::Busy);
        }
        self.reap_orphans();

        let mode = payload.mode();
        let handle = JobHandle {
            id: Uuid::new_v4(),
            mode,
            endpoint: endpoint.to_string(),
            submitted_at: Utc::now(),
            status: JobStatus::Pending,
        };

        let (tx, rx) = channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let worker = thread::spawn({
            let remote = self.remote.clone();
            let store = self.store.clone();
            let cancelled = cancelled.clone();
            let endpoint = handle.endpoint.clone();
            let job_id = handle.id;
            move || {
                let outcome = run_job(
                    job_id,
                    mode,
                    &endpoint,
                    &payload,
                    remote.as_ref(),
                    &store,
                    &cancelled,
                );
                if cancelled.load(Ordering::SeqCst) {
                    info!("job {} cancelled, discarding result", job_id);
                    return;
                }
                // One channel per job, one send per worker: the handoff
                // cannot fire twice. If cancel raced us here the receiver
                // is already gone and the send is a no-op.
                let _ = tx.send(outcome);
            }
        });

        info!("submitted job {} to {}", handle.id, endpoint);
        self.active = Some(ActiveJob {
            handle: handle.clone(),
            cancelled,
            outcome_rx: rx,
            worker: Some(worker),
        });

        Ok(handle)
    }

    /// Foreground-side drain. Non-blocking; returns the outcome at most
    /// once per job, transitioning the handle terminal and freeing the
    /// pending slot.
    pub fn poll(&mut self) -> Option<JobOutcome> {
        let active = self.active.as_mut()?;
        let outcome = match active.outcome_rx.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return None,
            // The worker died without sending (a panic before the
            // handoff). Surface it as a failure instead of leaving the
            // handle Pending forever.
            Err(TryRecvError::Disconnected) => JobOutcome::Failed {
                job_id: active.handle.id,
                error: "generation worker terminated unexpectedly".into(),
            },
        };

        active.handle.status = match &outcome {
            JobOutcome::Finished { .. } => JobStatus::Succeeded,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        };
        if let Some(worker) = active.worker.take() {
            let _ = worker.join();
        }
        self.active = None;

        Some(outcome)
    }

    /// Best-effort cancel. The in-flight remote call is not interrupted;
    /// its eventual result is suppressed instead of delivered. If the job
    /// already reconciled this is a no-op.
    pub fn cancel(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        if active.handle.status.is_terminal() {
            return;
        }

        active.cancelled.store(true, Ordering::SeqCst);
        active.handle.status = JobStatus::Cancelled;
        info!("cancelled job {}", active.handle.id);

        if let Some(worker) = active.worker.take() {
            self.orphans.push(worker);
        }
        // dropping `active` drops the receiver; a racing send is discarded
    }

    fn reap_orphans(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) = self
            .orphans
            .drain(..)
            .partition(|handle| handle.is_finished());
        for handle in done {
            if handle.join().is_err() {
                warn!("cancelled job worker panicked");
            }
        }
        self.orphans = running;
    }
}

/// The background half of a job: remote call, then image persistence.
/// Every failure collapses into a `Failed` outcome carrying the message
/// users see; nothing escapes to the foreground as a panic or error.
fn run_job(
    job_id: Uuid,
    mode: GenerationMode,
    endpoint: &str,
    payload: &Payload,
    remote: &dyn RemoteService,
    store: &ImageStore,
    cancelled: &AtomicBool,
) -> JobOutcome {
    let response = match remote.generate(endpoint, payload) {
        Ok(response) => response,
        Err(e) => {
            return JobOutcome::Failed {
                job_id,
                error: e.to_string(),
            };
        }
    };

    let mut saved_files = Vec::with_capacity(response.images.len());
    for (index, image) in response.images.iter().enumerate() {
        // re-checked before every write: a cancel landing mid-batch
        // stops further persistence, not just delivery
        if cancelled.load(Ordering::SeqCst) {
            return JobOutcome::Failed {
                job_id,
                error: "cancelled".into(),
            };
        }
        let filename = store.generation_filename(mode, index);
        match store.save_from_url(&image.url, &filename) {
            Ok(_) => saved_files.push(filename),
            Err(e) => {
                return JobOutcome::Failed {
                    job_id,
                    error: format!("failed to save image: {}", e),
                };
            }
        }
    }

    JobOutcome::Finished {
        job_id,
        images: response.images,
        saved_files,
        seed: response.seed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::mpsc::Sender;
    use std::time::{Duration, Instant};

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;

    use fd_core::catalog::FALLBACK_PARAMS;
    use fd_core::{ImageSize, PayloadDraft};

    use crate::remote::{GenerateResponse, GeneratedImage};

    fn tiny_png_data_url() -> String {
        let mut bytes = Vec::new();
        let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([0, 255, 0, 255]));
        image::DynamicImage::ImageRgba8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .unwrap();
        format!("data:image/png;base64,{}", BASE64.encode(bytes))
    }

    /// Remote double: each `generate` call blocks until the test sends a
    /// scripted result through the gate.
    struct GatedRemote {
        gate: Mutex<std::sync::mpsc::Receiver<Result<GenerateResponse, String>>>,
    }

    impl GatedRemote {
        fn new() -> (Arc<Self>, Sender<Result<GenerateResponse, String>>) {
            let (tx, rx) = channel();
            let remote = Arc::new(Self {
                gate: Mutex::new(rx),
            });
            (remote, tx)
        }
    }

    impl RemoteService for GatedRemote {
        fn generate(&self, _endpoint: &str, _payload: &Payload) -> Result<GenerateResponse, AppError> {
            let result = self
                .gate
                .lock()
                .unwrap()
                .recv()
                .unwrap_or_else(|_| Err("gate closed".into()));
            result.map_err(AppError::Remote)
        }
    }

    fn test_payload() -> Payload {
        let draft = PayloadDraft {
            prompt: "a red square".into(),
            steps: 4,
            guidance_scale: 3.5,
            num_images: 1,
            enable_safety_checker: true,
            ..Default::default()
        };
        draft
            .text_to_image(ImageSize::default(), &FALLBACK_PARAMS)
            .unwrap()
    }

    fn orchestrator_with(
        remote: Arc<dyn RemoteService>,
    ) -> (JobOrchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ImageStore::new(dir.path()).unwrap());
        (JobOrchestrator::new(remote, store), dir)
    }

    fn wait_for_outcome(orchestrator: &mut JobOrchestrator) -> JobOutcome {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(outcome) = orchestrator.poll() {
                return outcome;
            }
            assert!(Instant::now() < deadline, "no outcome within deadline");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn second_submit_is_rejected_while_pending() {
        let (remote, release) = GatedRemote::new();
        let (mut orchestrator, _dir) = orchestrator_with(remote);

        orchestrator.submit("fal-ai/flux/dev", test_payload()).unwrap();
        let err = orchestrator.submit("fal-ai/flux/dev", test_payload());
        assert!(matches!(err, Err(AppError::Busy)));

        release
            .send(Ok(GenerateResponse {
                images: vec![GeneratedImage {
                    url: tiny_png_data_url(),
                }],
                seed: None,
            }))
            .unwrap();
        wait_for_outcome(&mut orchestrator);

        // slot freed after reconciliation
        orchestrator.submit("fal-ai/flux/dev", test_payload()).unwrap();
    }

    #[test]
    fn success_saves_images_and_finishes() {
        let (remote, release) = GatedRemote::new();
        let (mut orchestrator, dir) = orchestrator_with(remote);

        orchestrator.submit("fal-ai/flux/dev", test_payload()).unwrap();
        release
            .send(Ok(GenerateResponse {
                images: vec![
                    GeneratedImage {
                        url: tiny_png_data_url(),
                    },
                    GeneratedImage {
                        url: tiny_png_data_url(),
                    },
                ],
                seed: Some(42),
            }))
            .unwrap();

        match wait_for_outcome(&mut orchestrator) {
            JobOutcome::Finished {
                images,
                saved_files,
                seed,
                ..
            } => {
                assert_eq!(images.len(), 2);
                assert_eq!(saved_files.len(), 2);
                assert_eq!(seed, Some(42));
                assert!(saved_files[0].starts_with("txt2img_"));
                for file in &saved_files {
                    assert!(dir.path().join(file).exists());
                }
            }
            other => panic!("expected Finished, got {:?}", other),
        }
        assert!(orchestrator.active().is_none());
    }

    #[test]
    fn remote_failure_surfaces_error_text_and_frees_slot() {
        let (remote, release) = GatedRemote::new();
        let (mut orchestrator, _dir) = orchestrator_with(remote);

        orchestrator.submit("fal-ai/flux/dev", test_payload()).unwrap();
        release.send(Err("HTTP 403: quota exceeded".into())).unwrap();

        match wait_for_outcome(&mut orchestrator) {
            JobOutcome::Failed { error, .. } => assert_eq!(error, "HTTP 403: quota exceeded"),
            other => panic!("expected Failed, got {:?}", other),
        }

        orchestrator.submit("fal-ai/flux/dev", test_payload()).unwrap();
    }

    #[test]
    fn cancel_suppresses_late_completion() {
        let (remote, release) = GatedRemote::new();
        let (mut orchestrator, dir) = orchestrator_with(remote);

        orchestrator.submit("fal-ai/flux/dev", test_payload()).unwrap();
        orchestrator.cancel();

        // completion after cancel: result must be discarded, not delivered
        release
            .send(Ok(GenerateResponse {
                images: vec![GeneratedImage {
                    url: tiny_png_data_url(),
                }],
                seed: None,
            }))
            .unwrap();
        thread::sleep(Duration::from_millis(200));

        assert!(orchestrator.poll().is_none());
        assert!(
            std::fs::read_dir(dir.path()).unwrap().next().is_none(),
            "cancelled job must not persist images"
        );

        // cancelled is terminal, so the slot is free immediately
        orchestrator.submit("fal-ai/flux/dev", test_payload()).unwrap();
    }

    /// Remote double that kills its worker thread outright.
    struct CrashingRemote;

    impl RemoteService for CrashingRemote {
        fn generate(&self, _endpoint: &str, _payload: &Payload) -> Result<GenerateResponse, AppError> {
            panic!("remote client crashed");
        }
    }

    #[test]
    fn dead_worker_becomes_failed_outcome_and_frees_slot() {
        let (mut orchestrator, _dir) = orchestrator_with(Arc::new(CrashingRemote));

        orchestrator.submit("fal-ai/flux/dev", test_payload()).unwrap();

        // the worker panics before the handoff, so the channel closes
        // without a message; that must reconcile as a failure
        match wait_for_outcome(&mut orchestrator) {
            JobOutcome::Failed { error, .. } => {
                assert!(error.contains("terminated unexpectedly"), "got: {}", error);
            }
            other => panic!("expected Failed, got {:?}", other),
        }

        assert!(!orchestrator.is_busy());
        orchestrator.submit("fal-ai/flux/dev", test_payload()).unwrap();
    }

    #[test]
    fn cancel_during_persistence_stops_further_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        let (remote, release) = GatedRemote::new();
        release
            .send(Ok(GenerateResponse {
                images: vec![
                    GeneratedImage {
                        url: tiny_png_data_url(),
                    },
                    GeneratedImage {
                        url: tiny_png_data_url(),
                    },
                ],
                seed: None,
            }))
            .unwrap();

        let cancelled = AtomicBool::new(true);
        let outcome = run_job(
            Uuid::new_v4(),
            GenerationMode::TextToImage,
            "fal-ai/flux/dev",
            &test_payload(),
            remote.as_ref(),
            &store,
            &cancelled,
        );

        match outcome {
            JobOutcome::Failed { error, .. } => assert_eq!(error, "cancelled"),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(
            std::fs::read_dir(dir.path()).unwrap().next().is_none(),
            "no image may be written once the job is cancelled"
        );
    }

    #[test]
    fn cancel_without_active_job_is_a_no_op() {
        let (remote, _release) = GatedRemote::new();
        let (mut orchestrator, _dir) = orchestrator_with(remote);
        orchestrator.cancel();
        assert!(orchestrator.poll().is_none());
    }
}
