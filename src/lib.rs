//! effects-kernel: the platform-independent core of a real-time video
//! effects stack.
//!
//! The kernel owns everything between the capture callback and the encoder
//! seam: lifecycle state machines, the frame bus, the effect chain, face
//! tracking, cloud filter fetch and cache, segment recording, and event
//! fan-out to observers. Platform capture and GPU rendering live below the
//! `FrameSource` and `EffectStage` seams and are not part of this crate.
//!
//! The entry point is [`Sdk::initialize`], which returns the process-wide
//! instance. A typical session:
//!
//! ```no_run
//! use effects_kernel::{CameraConfig, RecordingConfig, Sdk, SdkConfig};
//!
//! let sdk = Sdk::initialize(SdkConfig::new("my-api-key"), None)?;
//! sdk.start_camera(CameraConfig::default())?;
//! sdk.load_effect("vintage")?;
//! sdk.start_recording(RecordingConfig::default())?;
//! // ...
//! let stats = sdk.stop_recording()?;
//! println!("recorded {} frames to {}", stats.frames_written, stats.output_path.display());
//! sdk.terminate();
//! # Ok::<(), effects_kernel::Error>(())
//! ```

pub mod bus;
pub mod cloud;
pub mod config;
pub mod effects;
pub mod error;
pub mod events;
pub mod faces;
pub mod frame;
pub mod recording;
pub mod state;

pub use bus::{BusReceiver, FrameBus};
pub use cloud::{CloudFilterManager, FetchHandle, FetchStatus, FilterRef, FilterTransport};
pub use config::{
    CameraConfig, CameraPosition, FlashMode, RecordingConfig, SdkConfig, VideoOrientation,
    VideoQuality,
};
pub use effects::{EffectDescriptor, EffectStage, EffectsPipeline, StageContext, StageOp};
pub use error::{Error, ErrorCode, Result};
pub use events::{Event, EventCategory, EventDispatcher, SubscriptionToken};
pub use faces::{BoundingBox, FaceDetector, FaceInfo, StubFaceDetector};
pub use frame::{CapturedFrame, Frame, FrameSource, SharedFrame, SyntheticSource};
pub use recording::{AudioSource, RecordingStats, SilenceSource};
pub use state::{CameraState, EffectState, RecorderState, SdkState};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cloud::HttpTransport;
use crate::effects::FacesProvider;
use crate::recording::RecordingEngine;
use crate::state::{
    camera_machine, sdk_machine, CameraEvent, SdkEvent, StateMachine,
};

pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// License validation seam. The default implementation checks key shape
/// offline; deployments substitute a verifier that talks to their license
/// service within the configured timeout.
pub trait LicenseVerifier: Send + Sync {
    fn verify(&self, api_key: &str, timeout: Duration) -> Result<()>;
}

/// Offline verifier: accepts any non-empty key, except keys carrying the
/// `expired-` prefix which report as expired. Stands in until a networked
/// verifier is wired up.
pub struct OfflineLicenseVerifier;

impl LicenseVerifier for OfflineLicenseVerifier {
    fn verify(&self, api_key: &str, _timeout: Duration) -> Result<()> {
        if api_key.trim().is_empty() {
            return Err(Error::new(ErrorCode::LicenseInvalid, "empty api key"));
        }
        if api_key.starts_with("expired-") {
            return Err(Error::new(ErrorCode::LicenseExpired, "license expired"));
        }
        Ok(())
    }
}

static INSTANCE: Mutex<Option<Arc<Sdk>>> = Mutex::new(None);

struct CameraSession {
    machine: Arc<Mutex<StateMachine<CameraState, CameraEvent>>>,
    config: CameraConfig,
    output_bus: Arc<FrameBus>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    faces: Option<faces::FaceDetectionModule>,
}

/// Process-wide SDK instance.
pub struct Sdk {
    config: SdkConfig,
    machine: Mutex<StateMachine<SdkState, SdkEvent>>,
    paused: Arc<AtomicBool>,
    dispatcher: Arc<EventDispatcher>,
    cloud: Arc<CloudFilterManager>,
    pipeline: Arc<EffectsPipeline>,
    recorder: RecordingEngine,
    camera: Mutex<Option<CameraSession>>,
}

impl fmt::Debug for Sdk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sdk")
            .field("state", &self.state())
            .field("camera_state", &self.camera_state())
            .finish_non_exhaustive()
    }
}

impl Sdk {
    /// Initialize the SDK and return the process-wide instance.
    ///
    /// Blocks for the license check. Calling again while an instance is
    /// Initializing or Ready returns that instance unchanged. Terminated is
    /// terminal for the process: once `terminate` has run, initialize fails
    /// with `InitializationFailed` rather than building a fresh instance.
    pub fn initialize(
        config: SdkConfig,
        verifier: Option<Box<dyn LicenseVerifier>>,
    ) -> Result<Arc<Sdk>> {
        let mut slot = INSTANCE.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            match existing.state() {
                SdkState::Initializing | SdkState::Ready | SdkState::Paused => {
                    return Ok(existing.clone());
                }
                SdkState::Terminated => {
                    return Err(Error::new(
                        ErrorCode::InitializationFailed,
                        "sdk has been terminated; initialize is once per process",
                    ));
                }
                _ => {}
            }
        }

        config.validate()?;
        if config.debug_logging {
            let _ = env_logger::Builder::from_default_env()
                .filter_level(log::LevelFilter::Debug)
                .try_init();
        }

        let mut machine = sdk_machine();
        machine.handle(SdkEvent::InitRequested)?;

        let verifier = verifier.unwrap_or_else(|| Box::new(OfflineLicenseVerifier));
        if let Err(e) = verifier.verify(&config.api_key, config.license_check_timeout) {
            let _ = machine.handle(SdkEvent::InitFailed);
            log::error!("initialization failed: {}", e);
            return Err(e);
        }
        machine.handle(SdkEvent::InitSucceeded)?;

        let dispatcher = Arc::new(EventDispatcher::new());
        let transport = Arc::new(HttpTransport::new(HTTP_TIMEOUT));
        let cloud = CloudFilterManager::new(config.cloud_cache_path.clone(), transport);
        let pipeline = EffectsPipeline::new(dispatcher.clone(), cloud.clone());
        let recorder = RecordingEngine::new(dispatcher.clone());

        log::info!("effects-kernel {} initialized", SDK_VERSION);
        let sdk = Arc::new(Sdk {
            config,
            machine: Mutex::new(machine),
            paused: Arc::new(AtomicBool::new(false)),
            dispatcher,
            cloud,
            pipeline,
            recorder,
            camera: Mutex::new(None),
        });
        sdk.dispatcher
            .publish(Event::SdkStateChanged(SdkState::Ready));
        *slot = Some(sdk.clone());
        Ok(sdk)
    }

    /// The current instance, if one has been initialized and not
    /// terminated.
    pub fn instance() -> Option<Arc<Sdk>> {
        INSTANCE
            .lock()
            .unwrap()
            .clone()
            .filter(|sdk| sdk.state() != SdkState::Terminated)
    }

    /// Forget the process-wide instance so another lifecycle can run.
    /// Production callers get exactly one initialize per process; this
    /// exists so test binaries can exercise the lifecycle repeatedly.
    #[doc(hidden)]
    pub fn reset_process_state() {
        INSTANCE.lock().unwrap().take();
    }

    pub fn state(&self) -> SdkState {
        self.machine.lock().unwrap().state()
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SdkState::Ready => Ok(()),
            SdkState::Terminated => Err(Error::new(
                ErrorCode::InitializationFailed,
                "sdk has been terminated",
            )),
            other => Err(Error::new(
                ErrorCode::InitializationFailed,
                format!("sdk not ready (state {:?})", other),
            )),
        }
    }

    fn transition(&self, event: SdkEvent) -> Result<SdkState> {
        // Publish under the machine lock so observers see state changes in
        // transition order.
        let mut machine = self.machine.lock().unwrap();
        let next = machine.handle(event)?;
        self.dispatcher.publish(Event::SdkStateChanged(next));
        Ok(next)
    }

    /// Suspend processing, typically on app backgrounding. The capture
    /// loop keeps its session but drops frames until `resume`.
    pub fn pause(&self) -> Result<()> {
        self.transition(SdkEvent::AppBackgrounded)?;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.transition(SdkEvent::AppForegrounded)?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Tear down: stops recording and camera (best effort) and transitions
    /// to Terminated. The instance stays in the process-wide slot as a
    /// tombstone; every operation on it, including a new `initialize`,
    /// fails fast afterwards.
    pub fn terminate(&self) {
        if self.recorder.is_recording() {
            if let Err(e) = self.recorder.stop() {
                log::warn!("recording did not finalize cleanly: {}", e);
            }
        }
        if let Err(e) = self.stop_camera() {
            log::debug!("camera stop during terminate: {}", e);
        }
        let mut machine = self.machine.lock().unwrap();
        if machine.accepts(SdkEvent::TerminateRequested) {
            let _ = machine.handle(SdkEvent::TerminateRequested);
            self.dispatcher
                .publish(Event::SdkStateChanged(SdkState::Terminated));
            log::info!("effects-kernel terminated");
        }
    }

    // -------------------- Camera --------------------

    /// Start the capture session: open the source, spawn the capture loop,
    /// and (when enabled) the face detection worker.
    pub fn start_camera(&self, config: CameraConfig) -> Result<()> {
        self.start_camera_with(config, None)
    }

    /// As `start_camera`, with an explicit source. `None` uses the built-in
    /// synthetic pattern source.
    pub fn start_camera_with(
        &self,
        config: CameraConfig,
        source: Option<Box<dyn FrameSource>>,
    ) -> Result<()> {
        self.ensure_ready()?;
        config.validate()?;
        let mut slot = self.camera.lock().unwrap();
        if slot.is_some() {
            return Err(Error::invalid_parameter("camera already started"));
        }

        let machine = Arc::new(Mutex::new(camera_machine()));
        self.camera_transition(&machine, CameraEvent::StartRequested)?;

        let mut source =
            source.unwrap_or_else(|| Box::new(SyntheticSource::from_config(&config)));
        if let Err(e) = source.open() {
            let _ = self.camera_transition(&machine, CameraEvent::StartFailed);
            let error = Error::with_cause(
                ErrorCode::CameraNotAvailable,
                "capture source failed to open",
                e,
            );
            self.dispatcher.publish(Event::Error(error.clone()));
            return Err(error);
        }

        let raw_bus = Arc::new(FrameBus::new("capture"));
        let output_bus = Arc::new(FrameBus::new("output"));

        let faces = if self.config.face_detection_enabled {
            let module = faces::FaceDetectionModule::spawn(
                raw_bus.subscribe("face-detection"),
                Box::new(StubFaceDetector::new()),
                self.dispatcher.clone(),
            );
            let snapshot = module.snapshot_handle();
            let provider: FacesProvider = Arc::new(move || snapshot.lock().unwrap().clone());
            self.pipeline.set_faces_provider(Some(provider));
            Some(module)
        } else {
            None
        };

        let stop = Arc::new(AtomicBool::new(false));
        let worker = self.spawn_capture_loop(
            source,
            config.frame_interval(),
            raw_bus.clone(),
            output_bus.clone(),
            machine.clone(),
            stop.clone(),
        )?;
        self.camera_transition(&machine, CameraEvent::StartSucceeded)?;
        log::info!(
            "camera started: {} @ {} fps",
            config.session_preset,
            config.frame_rate
        );

        *slot = Some(CameraSession {
            machine,
            config,
            output_bus,
            stop,
            worker: Some(worker),
            faces,
        });
        Ok(())
    }

    fn spawn_capture_loop(
        &self,
        mut source: Box<dyn FrameSource>,
        budget: Duration,
        raw_bus: Arc<FrameBus>,
        output_bus: Arc<FrameBus>,
        machine: Arc<Mutex<StateMachine<CameraState, CameraEvent>>>,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let pipeline = self.pipeline.clone();
        let dispatcher = self.dispatcher.clone();
        let paused = self.paused.clone();
        std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                loop {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if paused.load(Ordering::SeqCst) {
                        // Paused: keep pacing, deliver nothing.
                        std::thread::sleep(budget);
                        continue;
                    }
                    let captured = match source.next_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            let mut m = machine.lock().unwrap();
                            if m.accepts(CameraEvent::Failed) {
                                let _ = m.handle(CameraEvent::Failed);
                                dispatcher
                                    .publish(Event::CameraStateChanged(CameraState::Error));
                            }
                            drop(m);
                            dispatcher.publish(Event::Error(Error::with_cause(
                                ErrorCode::CameraNotAvailable,
                                "capture source failed",
                                e,
                            )));
                            break;
                        }
                    };
                    // Sequence is assigned at ingest; the effects chain runs
                    // synchronously on this thread against the same buffer.
                    let shared = raw_bus.ingest(captured);
                    let processed = pipeline.apply_frame(&shared, budget);
                    output_bus.publish(processed);
                }
                raw_bus.close();
                output_bus.close();
                log::debug!("capture loop exited");
            })
            .map_err(|e| Error::with_cause(ErrorCode::Unknown, "cannot spawn capture loop", e))
    }

    fn camera_transition(
        &self,
        machine: &Arc<Mutex<StateMachine<CameraState, CameraEvent>>>,
        event: CameraEvent,
    ) -> Result<CameraState> {
        let mut m = machine.lock().unwrap();
        let next = m.handle(event)?;
        self.dispatcher.publish(Event::CameraStateChanged(next));
        Ok(next)
    }

    fn camera_transition_if_accepted(
        &self,
        machine: &Arc<Mutex<StateMachine<CameraState, CameraEvent>>>,
        event: CameraEvent,
    ) {
        let mut m = machine.lock().unwrap();
        if m.accepts(event) {
            if let Ok(next) = m.handle(event) {
                self.dispatcher.publish(Event::CameraStateChanged(next));
            }
        }
    }

    /// Stop the capture session and join its workers.
    pub fn stop_camera(&self) -> Result<()> {
        let mut slot = self.camera.lock().unwrap();
        let mut session = slot
            .take()
            .ok_or_else(|| Error::invalid_parameter("camera not started"))?;
        drop(slot);

        // A session whose capture loop already failed sits in Error; the
        // teardown below still runs, just without the stop transitions.
        self.camera_transition_if_accepted(&session.machine, CameraEvent::StopRequested);
        session.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = session.worker.take() {
            let _ = worker.join();
        }
        if let Some(mut module) = session.faces.take() {
            module.stop();
        }
        self.pipeline.set_faces_provider(None);
        self.camera_transition_if_accepted(&session.machine, CameraEvent::StopCompleted);
        log::info!("camera stopped");
        Ok(())
    }

    pub fn camera_state(&self) -> CameraState {
        let slot = self.camera.lock().unwrap();
        match slot.as_ref() {
            Some(session) => session.machine.lock().unwrap().state(),
            None => CameraState::Stopped,
        }
    }

    /// Subscribe a preview consumer to the post-effects stream. Latest-wins:
    /// a slow consumer sees the newest frame, never a backlog.
    pub fn preview_frames(&self) -> Result<BusReceiver> {
        let slot = self.camera.lock().unwrap();
        let session = slot
            .as_ref()
            .ok_or_else(|| Error::invalid_parameter("camera not started"))?;
        Ok(session.output_bus.subscribe("preview"))
    }

    // -------------------- Effects --------------------

    pub fn register_local_effect(
        &self,
        id: impl Into<String>,
        category: impl Into<String>,
        op: StageOp,
    ) {
        self.pipeline.register_local(id, category, op);
    }

    pub fn register_cloud_effect(
        &self,
        id: impl Into<String>,
        category: impl Into<String>,
        filter: FilterRef,
    ) {
        self.pipeline.register_cloud(id, category, filter);
    }

    pub fn load_effect(&self, id: &str) -> Result<EffectState> {
        self.ensure_ready()?;
        self.pipeline.load_effect(id)
    }

    /// Rebuild a loaded effect from its source, e.g. after a remote filter
    /// was republished.
    pub fn reload_effect(&self, id: &str) -> Result<EffectState> {
        self.ensure_ready()?;
        self.pipeline.reload_effect(id)
    }

    pub fn unload_effect(&self, id: &str) -> Result<()> {
        self.ensure_ready()?;
        self.pipeline.unload_effect(id);
        Ok(())
    }

    pub fn list_effects(
        &self,
    ) -> std::collections::BTreeMap<String, Vec<EffectDescriptor>> {
        self.pipeline.list_effects()
    }

    /// Direct access to the cloud filter manager, for prefetching filters
    /// ahead of a load.
    pub fn cloud_filters(&self) -> &Arc<CloudFilterManager> {
        &self.cloud
    }

    // -------------------- Recording --------------------

    /// Start recording the post-effects stream. Requires a running camera.
    pub fn start_recording(&self, config: RecordingConfig) -> Result<()> {
        self.start_recording_with(config, None)
    }

    /// As `start_recording`, with an explicit audio source.
    pub fn start_recording_with(
        &self,
        config: RecordingConfig,
        audio: Option<Box<dyn AudioSource>>,
    ) -> Result<()> {
        self.ensure_ready()?;
        let slot = self.camera.lock().unwrap();
        let session = slot
            .as_ref()
            .ok_or_else(|| Error::invalid_parameter("camera not started"))?;
        if session.machine.lock().unwrap().state() != CameraState::Running {
            return Err(Error::invalid_parameter("camera is not running"));
        }
        let receiver = session
            .output_bus
            .subscribe_with_depth("recorder", RECORDER_MAILBOX_DEPTH);
        let frame_size = session.config.preview_size();
        drop(slot);
        self.recorder.start(receiver, audio, config, frame_size)
    }

    /// Stop the active recording and block until the output file is
    /// finalized.
    pub fn stop_recording(&self) -> Result<RecordingStats> {
        self.recorder.stop()
    }

    pub fn recorder_state(&self) -> RecorderState {
        self.recorder.state()
    }

    // -------------------- Events --------------------

    pub fn subscribe<F>(&self, category: EventCategory, observer: F) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + 'static,
    {
        self.dispatcher.subscribe(category, observer)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.dispatcher.unsubscribe(token)
    }
}

/// Recorder mailbox is deeper than the preview default so short disk stalls
/// drop preview frames before recorded ones.
const RECORDER_MAILBOX_DEPTH: usize = 8;
