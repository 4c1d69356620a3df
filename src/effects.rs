//! The ordered effect chain applied to every frame.
//!
//! The pipeline owns the active chain exclusively; all mutation goes through
//! its synchronous API. `apply_frame` runs on the capture context and must
//! finish inside the frame budget: each stage runs against a scratch buffer
//! and its result is committed only if it finished within the remaining
//! budget, otherwise that stage's contribution is dropped for this frame and
//! a performance warning is published. The pipeline never blocks past
//! budget.
//!
//! Effects are registered in a catalog (local builders or cloud filter
//! references) and loaded on demand. Cloud loads go through the
//! `CloudFilterManager` and complete on its callback; concurrent loads of
//! the same id collapse onto the single in-flight load. Category grouping in
//! `list_effects` is a presentation view only; application order is always
//! insertion order.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cloud::{CloudFilterManager, FetchStatus, FilterRef};
use crate::error::{Error, ErrorCode, Result};
use crate::events::{Event, EventDispatcher};
use crate::faces::FaceInfo;
use crate::frame::{Frame, SharedFrame};
use crate::state::{effect_machine, EffectEvent, EffectState, StateMachine};

/// Context handed to each stage alongside the pixel buffer.
pub struct StageContext<'a> {
    pub width: u32,
    pub height: u32,
    pub pts: Duration,
    /// Latest face snapshot; empty when face detection is off.
    pub faces: &'a [FaceInfo],
}

/// One unit in the effect chain. Stages mutate the packed RGB buffer in
/// place and must be cheap enough to fit the frame budget.
pub trait EffectStage: Send {
    fn apply(&mut self, data: &mut [u8], ctx: &StageContext<'_>);
}

/// Declarative stage description. Cloud filter assets deserialize into this,
/// so a downloaded asset is just a recipe for a built-in operation; real
/// shader programs live below the render seam and are out of scope.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StageOp {
    Grayscale,
    Invert,
    Brightness { delta: i16 },
    /// Pixelates every tracked face box. Face-aware: reads the face
    /// snapshot from the stage context.
    FacePixelate { block: u32 },
}

impl StageOp {
    fn build(&self) -> Box<dyn EffectStage> {
        match self {
            StageOp::Grayscale => Box::new(GrayscaleStage),
            StageOp::Invert => Box::new(InvertStage),
            StageOp::Brightness { delta } => Box::new(BrightnessStage { delta: *delta }),
            StageOp::FacePixelate { block } => Box::new(FacePixelateStage {
                block: (*block).max(2),
            }),
        }
    }
}

struct GrayscaleStage;

impl EffectStage for GrayscaleStage {
    fn apply(&mut self, data: &mut [u8], _ctx: &StageContext<'_>) {
        for px in data.chunks_exact_mut(3) {
            let y = (u16::from(px[0]) * 30 + u16::from(px[1]) * 59 + u16::from(px[2]) * 11) / 100;
            px.fill(y as u8);
        }
    }
}

struct InvertStage;

impl EffectStage for InvertStage {
    fn apply(&mut self, data: &mut [u8], _ctx: &StageContext<'_>) {
        for b in data.iter_mut() {
            *b = 255 - *b;
        }
    }
}

struct BrightnessStage {
    delta: i16,
}

impl EffectStage for BrightnessStage {
    fn apply(&mut self, data: &mut [u8], _ctx: &StageContext<'_>) {
        for b in data.iter_mut() {
            *b = (i16::from(*b) + self.delta).clamp(0, 255) as u8;
        }
    }
}

struct FacePixelateStage {
    block: u32,
}

impl EffectStage for FacePixelateStage {
    fn apply(&mut self, data: &mut [u8], ctx: &StageContext<'_>) {
        for face in ctx.faces {
            let bb = face.bounding_box;
            let x0 = (bb.x * ctx.width as f32) as u32;
            let y0 = (bb.y * ctx.height as f32) as u32;
            let x1 = ((bb.x + bb.width) * ctx.width as f32).min(ctx.width as f32) as u32;
            let y1 = ((bb.y + bb.height) * ctx.height as f32).min(ctx.height as f32) as u32;

            let mut y = y0;
            while y < y1 {
                let mut x = x0;
                while x < x1 {
                    // Sample the block's top-left pixel and flood the block.
                    let src = ((y * ctx.width + x) * 3) as usize;
                    if src + 2 >= data.len() {
                        break;
                    }
                    let (r, g, b) = (data[src], data[src + 1], data[src + 2]);
                    for by in y..(y + self.block).min(y1) {
                        for bx in x..(x + self.block).min(x1) {
                            let dst = ((by * ctx.width + bx) * 3) as usize;
                            if dst + 2 < data.len() {
                                data[dst] = r;
                                data[dst + 1] = g;
                                data[dst + 2] = b;
                            }
                        }
                    }
                    x += self.block;
                }
                y += self.block;
            }
        }
    }
}

// -------------------- Catalog and chain --------------------

/// How an effect's stage is obtained when loaded.
enum EffectSource {
    Local(StageOp),
    Cloud(FilterRef),
}

struct EffectSlot {
    machine: StateMachine<EffectState, EffectEvent>,
    category: String,
    source: EffectSource,
    stage: Option<Box<dyn EffectStage>>,
}

/// Presentation descriptor for one catalog entry.
#[derive(Clone, Debug)]
pub struct EffectDescriptor {
    pub id: String,
    pub category: String,
    pub state: EffectState,
}

struct PipelineInner {
    slots: HashMap<String, EffectSlot>,
    /// Active chain, insertion order. This is the application order.
    chain: Vec<String>,
}

pub type FacesProvider = Arc<dyn Fn() -> Vec<FaceInfo> + Send + Sync>;

pub struct EffectsPipeline {
    inner: Mutex<PipelineInner>,
    dispatcher: Arc<EventDispatcher>,
    cloud: Arc<CloudFilterManager>,
    faces: Mutex<Option<FacesProvider>>,
}

impl EffectsPipeline {
    pub fn new(dispatcher: Arc<EventDispatcher>, cloud: Arc<CloudFilterManager>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PipelineInner {
                slots: HashMap::new(),
                chain: Vec::new(),
            }),
            dispatcher,
            cloud,
            faces: Mutex::new(None),
        })
    }

    /// Wire the face snapshot source (set once at session start when face
    /// detection is enabled; never set when it is disabled).
    pub fn set_faces_provider(&self, provider: Option<FacesProvider>) {
        *self.faces.lock().unwrap() = provider;
    }

    /// Register a locally available effect.
    pub fn register_local(&self, id: impl Into<String>, category: impl Into<String>, op: StageOp) {
        let mut inner = self.inner.lock().unwrap();
        inner.slots.insert(
            id.into(),
            EffectSlot {
                machine: effect_machine(),
                category: category.into(),
                source: EffectSource::Local(op),
                stage: None,
            },
        );
        drop(inner);
        self.dispatcher.publish(Event::FilterListUpdated);
    }

    /// Register an effect backed by a remote filter asset.
    pub fn register_cloud(
        &self,
        id: impl Into<String>,
        category: impl Into<String>,
        filter: FilterRef,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.slots.insert(
            id.into(),
            EffectSlot {
                machine: effect_machine(),
                category: category.into(),
                source: EffectSource::Cloud(filter),
                stage: None,
            },
        );
        drop(inner);
        self.dispatcher.publish(Event::FilterListUpdated);
    }

    /// Load an effect into the active chain.
    ///
    /// Local sources load synchronously; cloud sources transition to Loading
    /// and complete on the fetch callback. A load request while the same id
    /// is already Loading joins the in-flight load instead of duplicating
    /// it; a request while Ready is a no-op success.
    pub fn load_effect(self: &Arc<Self>, id: &str) -> Result<EffectState> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.slots.get_mut(id).ok_or_else(|| {
            Error::new(ErrorCode::ResourceNotFound, format!("unknown effect '{}'", id))
        })?;

        match slot.machine.state() {
            EffectState::Ready => return Ok(EffectState::Ready),
            EffectState::Loading => return Ok(EffectState::Loading),
            EffectState::NotLoaded | EffectState::Error => {}
        }

        slot.machine.handle(EffectEvent::LoadRequested)?;
        self.dispatcher.publish(Event::EffectStateChanged {
            effect_id: id.to_string(),
            state: EffectState::Loading,
        });

        match &slot.source {
            EffectSource::Local(op) => {
                let stage = op.build();
                slot.stage = Some(stage);
                slot.machine.handle(EffectEvent::LoadSucceeded)?;
                if !inner.chain.iter().any(|c| c == id) {
                    inner.chain.push(id.to_string());
                }
                drop(inner);
                self.dispatcher.publish(Event::EffectStateChanged {
                    effect_id: id.to_string(),
                    state: EffectState::Ready,
                });
                self.dispatcher.publish(Event::FilterListUpdated);
                Ok(EffectState::Ready)
            }
            EffectSource::Cloud(filter) => {
                let filter = filter.clone();
                drop(inner);
                let pipeline = self.clone();
                let effect_id = id.to_string();
                let handle = self.cloud.fetch(&filter, None);
                std::thread::spawn(move || {
                    let status = handle.wait();
                    pipeline.finish_cloud_load(&effect_id, status);
                });
                Ok(EffectState::Loading)
            }
        }
    }

    /// Rebuild a loaded effect's stage from its source. The current stage
    /// keeps serving frames until the replacement lands; cloud sources go
    /// back through the filter manager, which serves a verified cache hit
    /// without a transfer.
    pub fn reload_effect(self: &Arc<Self>, id: &str) -> Result<EffectState> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.slots.get_mut(id).ok_or_else(|| {
            Error::new(ErrorCode::ResourceNotFound, format!("unknown effect '{}'", id))
        })?;
        if slot.machine.state() != EffectState::Ready {
            return Err(Error::invalid_parameter(format!(
                "effect '{}' is not loaded",
                id
            )));
        }
        slot.machine.handle(EffectEvent::ReloadRequested)?;
        self.dispatcher.publish(Event::EffectStateChanged {
            effect_id: id.to_string(),
            state: EffectState::Loading,
        });

        match &slot.source {
            EffectSource::Local(op) => {
                slot.stage = Some(op.build());
                slot.machine.handle(EffectEvent::LoadSucceeded)?;
                drop(inner);
                self.dispatcher.publish(Event::EffectStateChanged {
                    effect_id: id.to_string(),
                    state: EffectState::Ready,
                });
                Ok(EffectState::Ready)
            }
            EffectSource::Cloud(filter) => {
                let filter = filter.clone();
                drop(inner);
                let pipeline = self.clone();
                let effect_id = id.to_string();
                let handle = self.cloud.fetch(&filter, None);
                std::thread::spawn(move || {
                    let status = handle.wait();
                    pipeline.finish_cloud_load(&effect_id, status);
                });
                Ok(EffectState::Loading)
            }
        }
    }

    /// Completion path for cloud loads.
    fn finish_cloud_load(&self, id: &str, status: FetchStatus) {
        let mut inner = self.inner.lock().unwrap();
        let Some(slot) = inner.slots.get_mut(id) else {
            return;
        };
        // Unloaded while the fetch was in flight: nothing to finish.
        if slot.machine.state() != EffectState::Loading {
            return;
        }

        let outcome = match status {
            FetchStatus::Completed(path) => match load_stage_asset(&path) {
                Ok(stage) => {
                    slot.stage = Some(stage);
                    let _ = slot.machine.handle(EffectEvent::LoadSucceeded);
                    if !inner.chain.iter().any(|c| c == id) {
                        inner.chain.push(id.to_string());
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            FetchStatus::Cancelled => Err(Error::new(
                ErrorCode::EffectLoadFailed,
                format!("fetch for '{}' was cancelled", id),
            )),
            FetchStatus::Failed(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                drop(inner);
                self.dispatcher.publish(Event::EffectStateChanged {
                    effect_id: id.to_string(),
                    state: EffectState::Ready,
                });
                self.dispatcher.publish(Event::FilterListUpdated);
            }
            Err(error) => {
                let _ = inner
                    .slots
                    .get_mut(id)
                    .map(|slot| slot.machine.handle(EffectEvent::LoadFailed));
                drop(inner);
                self.dispatcher.publish(Event::EffectStateChanged {
                    effect_id: id.to_string(),
                    state: EffectState::Error,
                });
                self.dispatcher.publish(Event::Error(error));
            }
        }
    }

    /// Remove an effect from the chain. Unloading an effect that is not
    /// Ready or Loading is a no-op, not an error, and emits nothing.
    pub fn unload_effect(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(slot) = inner.slots.get_mut(id) else {
            return;
        };
        match slot.machine.state() {
            EffectState::Ready | EffectState::Loading => {
                let _ = slot.machine.handle(EffectEvent::UnloadRequested);
                slot.stage = None;
                inner.chain.retain(|c| c != id);
                drop(inner);
                self.dispatcher.publish(Event::EffectStateChanged {
                    effect_id: id.to_string(),
                    state: EffectState::NotLoaded,
                });
                self.dispatcher.publish(Event::FilterListUpdated);
            }
            EffectState::NotLoaded | EffectState::Error => {}
        }
    }

    pub fn effect_state(&self, id: &str) -> Option<EffectState> {
        let inner = self.inner.lock().unwrap();
        inner.slots.get(id).map(|slot| slot.machine.state())
    }

    /// Category-grouped presentation view over the catalog. Grouping does
    /// not reflect or affect application order.
    pub fn list_effects(&self) -> BTreeMap<String, Vec<EffectDescriptor>> {
        let inner = self.inner.lock().unwrap();
        let mut grouped: BTreeMap<String, Vec<EffectDescriptor>> = BTreeMap::new();
        for (id, slot) in &inner.slots {
            grouped
                .entry(slot.category.clone())
                .or_default()
                .push(EffectDescriptor {
                    id: id.clone(),
                    category: slot.category.clone(),
                    state: slot.machine.state(),
                });
        }
        for descriptors in grouped.values_mut() {
            descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        }
        grouped
    }

    /// Apply the active chain to one frame within `budget`.
    ///
    /// Runs synchronously on the caller's (capture) context. Each stage
    /// works on a scratch copy; if the stage finishes past the remaining
    /// budget its scratch is discarded, so an overrunning stage costs this
    /// frame nothing but its wasted time, and a performance warning is
    /// published out-of-band.
    pub fn apply_frame(&self, frame: &SharedFrame, budget: Duration) -> SharedFrame {
        let faces = {
            let provider = self.faces.lock().unwrap();
            provider.as_ref().map(|p| p()).unwrap_or_default()
        };
        let ctx = StageContext {
            width: frame.width,
            height: frame.height,
            pts: frame.pts,
            faces: &faces,
        };

        let started = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        if inner.chain.is_empty() {
            // Nothing active: the output is the input buffer, untouched.
            return frame.clone();
        }

        let mut data = frame.data.clone();
        let chain: Vec<String> = inner.chain.clone();
        let mut warnings = Vec::new();

        for id in &chain {
            let elapsed = started.elapsed();
            if elapsed >= budget {
                warnings.push((id.clone(), elapsed));
                continue;
            }
            let Some(stage) = inner.slots.get_mut(id).and_then(|s| s.stage.as_mut()) else {
                continue;
            };

            let mut scratch = data.clone();
            let stage_start = Instant::now();
            stage.apply(&mut scratch, &ctx);
            if started.elapsed() > budget {
                // Contribution dropped; frame continues unmodified by this
                // stage.
                warnings.push((id.clone(), stage_start.elapsed()));
            } else {
                data = scratch;
            }
        }
        drop(inner);

        for (stage_id, elapsed) in warnings {
            log::warn!(
                "stage '{}' exceeded frame budget ({:?} > {:?})",
                stage_id,
                elapsed,
                budget
            );
            self.dispatcher.publish(Event::PerformanceWarning {
                stage_id,
                budget,
                elapsed,
            });
        }

        Arc::new(Frame {
            width: frame.width,
            height: frame.height,
            data,
            pts: frame.pts,
            sequence: frame.sequence,
        })
    }
}

/// Parse a downloaded filter asset into a stage.
fn load_stage_asset(path: &Path) -> Result<Box<dyn EffectStage>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::with_cause(
            ErrorCode::EffectLoadFailed,
            format!("filter asset {} unreadable", path.display()),
            e,
        )
    })?;
    let op: StageOp = serde_json::from_str(&raw).map_err(|e| {
        Error::with_cause(
            ErrorCode::EffectLoadFailed,
            format!("filter asset {} malformed", path.display()),
            e,
        )
    })?;
    Ok(op.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::content_checksum;
    use crate::cloud::DownloadOutcome;
    use crate::cloud::FilterTransport;
    use crate::events::EventCategory;
    use crate::frame::CapturedFrame;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc::channel;

    struct AssetTransport {
        body: Vec<u8>,
        calls: AtomicU64,
        delay: Duration,
    }

    impl FilterTransport for AssetTransport {
        fn download(
            &self,
            _url: &str,
            sink: &mut dyn std::io::Write,
            progress: &mut dyn FnMut(f32),
            _cancelled: &dyn Fn() -> bool,
        ) -> crate::error::Result<DownloadOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            sink.write_all(&self.body).unwrap();
            progress(1.0);
            Ok(DownloadOutcome::Completed)
        }
    }

    fn pipeline_with(
        body: &[u8],
        delay: Duration,
    ) -> (Arc<EffectsPipeline>, Arc<EventDispatcher>, tempfile::TempDir, Arc<AssetTransport>) {
        let cache = tempfile::tempdir().unwrap();
        let transport = Arc::new(AssetTransport {
            body: body.to_vec(),
            calls: AtomicU64::new(0),
            delay,
        });
        let cloud = CloudFilterManager::new(Some(cache.path().to_path_buf()), transport.clone());
        let dispatcher = Arc::new(EventDispatcher::new());
        let pipeline = EffectsPipeline::new(dispatcher.clone(), cloud);
        (pipeline, dispatcher, cache, transport)
    }

    fn test_frame() -> SharedFrame {
        Arc::new(Frame {
            width: 4,
            height: 4,
            data: vec![100u8; 48],
            pts: Duration::ZERO,
            sequence: 0,
        })
    }

    fn wide_budget() -> Duration {
        Duration::from_secs(5)
    }

    #[test]
    fn local_effect_loads_synchronously_and_applies() {
        let (pipeline, _dispatcher, _cache, _t) = pipeline_with(b"", Duration::ZERO);
        pipeline.register_local("invert", "basic", StageOp::Invert);

        assert_eq!(pipeline.load_effect("invert").unwrap(), EffectState::Ready);
        let out = pipeline.apply_frame(&test_frame(), wide_budget());
        assert!(out.data.iter().all(|&b| b == 155));
    }

    #[test]
    fn unknown_effect_is_resource_not_found() {
        let (pipeline, _dispatcher, _cache, _t) = pipeline_with(b"", Duration::ZERO);
        let err = pipeline.load_effect("nope").unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceNotFound);
    }

    #[test]
    fn unloading_a_not_loaded_effect_is_a_silent_no_op() {
        let (pipeline, dispatcher, _cache, _t) = pipeline_with(b"", Duration::ZERO);
        pipeline.register_local("gray", "basic", StageOp::Grayscale);

        let (tx, rx) = channel();
        dispatcher.subscribe(EventCategory::StateChange, move |event| {
            tx.send(format!("{:?}", event)).unwrap();
        });

        pipeline.unload_effect("gray");
        pipeline.unload_effect("absent-id");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(pipeline.effect_state("gray"), Some(EffectState::NotLoaded));
    }

    #[test]
    fn cloud_effect_transitions_loading_then_ready() {
        let asset = br#"{"op":"grayscale"}"#.to_vec();
        let (pipeline, _dispatcher, _cache, transport) = pipeline_with(&asset, Duration::ZERO);
        pipeline.register_cloud(
            "sky",
            "cloud",
            FilterRef {
                id: "sky".to_string(),
                url: "https://filters.example/sky".to_string(),
                checksum: content_checksum(&asset),
            },
        );

        assert_eq!(pipeline.load_effect("sky").unwrap(), EffectState::Loading);
        // Wait for the completion callback.
        for _ in 0..100 {
            if pipeline.effect_state("sky") == Some(EffectState::Ready) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pipeline.effect_state("sky"), Some(EffectState::Ready));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let out = pipeline.apply_frame(&test_frame(), wide_budget());
        assert_eq!(out.data[0], out.data[1]);
    }

    #[test]
    fn concurrent_loads_of_one_effect_share_one_fetch() {
        let asset = br#"{"op":"invert"}"#.to_vec();
        let (pipeline, dispatcher, _cache, transport) =
            pipeline_with(&asset, Duration::from_millis(50));
        pipeline.register_cloud(
            "E1",
            "cloud",
            FilterRef {
                id: "E1".to_string(),
                url: "https://filters.example/e1".to_string(),
                checksum: content_checksum(&asset),
            },
        );

        let (tx, rx) = channel();
        dispatcher.subscribe(EventCategory::StateChange, move |event| {
            if let Event::EffectStateChanged { state, .. } = event {
                tx.send(*state).unwrap();
            }
        });

        let p1 = pipeline.clone();
        let p2 = pipeline.clone();
        let t1 = std::thread::spawn(move || p1.load_effect("E1").unwrap());
        let t2 = std::thread::spawn(move || p2.load_effect("E1").unwrap());
        t1.join().unwrap();
        t2.join().unwrap();

        for _ in 0..100 {
            if pipeline.effect_state("E1") == Some(EffectState::Ready) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pipeline.effect_state("E1"), Some(EffectState::Ready));
        // Exactly one transfer despite two callers.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        // Exactly one Loading and one Ready observed.
        let mut seen = Vec::new();
        while let Ok(state) = rx.recv_timeout(Duration::from_millis(200)) {
            seen.push(state);
        }
        assert_eq!(seen, vec![EffectState::Loading, EffectState::Ready]);
    }

    #[test]
    fn reload_of_a_cached_cloud_effect_skips_the_network() {
        let asset = br#"{"op":"grayscale"}"#.to_vec();
        let (pipeline, _dispatcher, _cache, transport) = pipeline_with(&asset, Duration::ZERO);
        pipeline.register_cloud(
            "sky",
            "cloud",
            FilterRef {
                id: "sky".to_string(),
                url: "https://filters.example/sky".to_string(),
                checksum: content_checksum(&asset),
            },
        );

        pipeline.load_effect("sky").unwrap();
        for _ in 0..100 {
            if pipeline.effect_state("sky") == Some(EffectState::Ready) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pipeline.reload_effect("sky").unwrap(), EffectState::Loading);
        for _ in 0..100 {
            if pipeline.effect_state("sky") == Some(EffectState::Ready) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pipeline.effect_state("sky"), Some(EffectState::Ready));
        // The verified cache entry satisfies the reload.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reload_requires_a_loaded_effect() {
        let (pipeline, _dispatcher, _cache, _t) = pipeline_with(b"", Duration::ZERO);
        pipeline.register_local("gray", "basic", StageOp::Grayscale);
        let err = pipeline.reload_effect("gray").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }

    #[test]
    fn corrupt_cloud_asset_surfaces_effect_load_failed() {
        let asset = b"not json at all".to_vec();
        let (pipeline, dispatcher, _cache, _t) = pipeline_with(&asset, Duration::ZERO);
        pipeline.register_cloud(
            "bad",
            "cloud",
            FilterRef {
                id: "bad".to_string(),
                url: "https://filters.example/bad".to_string(),
                checksum: content_checksum(&asset),
            },
        );

        let (tx, rx) = channel();
        dispatcher.subscribe(EventCategory::Error, move |event| {
            if let Event::Error(e) = event {
                tx.send(e.code).unwrap();
            }
        });

        pipeline.load_effect("bad").unwrap();
        let code = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(code, ErrorCode::EffectLoadFailed);
        assert_eq!(pipeline.effect_state("bad"), Some(EffectState::Error));
    }

    #[test]
    fn application_order_is_insertion_order_not_category_order() {
        let (pipeline, _dispatcher, _cache, _t) = pipeline_with(b"", Duration::ZERO);
        // "zz" category registered first; grouping sorts categories but the
        // chain must stay in load order.
        pipeline.register_local("bright", "zz-adjust", StageOp::Brightness { delta: 100 });
        pipeline.register_local("invert", "aa-basic", StageOp::Invert);
        pipeline.load_effect("bright").unwrap();
        pipeline.load_effect("invert").unwrap();

        // 100 +100 -> 200, inverted -> 55. Category order would give
        // (255-100)+100 -> 255.
        let out = pipeline.apply_frame(&test_frame(), wide_budget());
        assert!(out.data.iter().all(|&b| b == 55));

        let grouped = pipeline.list_effects();
        let categories: Vec<&String> = grouped.keys().collect();
        assert_eq!(categories, vec!["aa-basic", "zz-adjust"]);
    }

    #[test]
    fn empty_chain_returns_the_same_buffer() {
        let (pipeline, _dispatcher, _cache, _t) = pipeline_with(b"", Duration::ZERO);
        let frame = test_frame();
        let out = pipeline.apply_frame(&frame, wide_budget());
        assert!(Arc::ptr_eq(&frame, &out));
    }

    #[test]
    fn budget_overrun_drops_stage_contribution_and_warns() {
        struct SlowStage;
        impl EffectStage for SlowStage {
            fn apply(&mut self, data: &mut [u8], _ctx: &StageContext<'_>) {
                std::thread::sleep(Duration::from_millis(30));
                data.fill(0);
            }
        }

        let (pipeline, dispatcher, _cache, _t) = pipeline_with(b"", Duration::ZERO);
        pipeline.register_local("slow", "basic", StageOp::Invert);
        pipeline.load_effect("slow").unwrap();
        // Swap in a stage that will blow a tiny budget.
        {
            let mut inner = pipeline.inner.lock().unwrap();
            inner.slots.get_mut("slow").unwrap().stage = Some(Box::new(SlowStage));
        }

        let (tx, rx) = channel();
        dispatcher.subscribe(EventCategory::Performance, move |event| {
            if let Event::PerformanceWarning { stage_id, .. } = event {
                tx.send(stage_id.clone()).unwrap();
            }
        });

        let frame = test_frame();
        let out = pipeline.apply_frame(&frame, Duration::from_millis(1));
        // Contribution dropped: output pixels unchanged.
        assert_eq!(out.data, frame.data);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            "slow".to_string()
        );
    }

    #[test]
    fn face_pixelate_reads_the_faces_snapshot() {
        use crate::faces::{BoundingBox, FaceInfo};

        let (pipeline, _dispatcher, _cache, _t) = pipeline_with(b"", Duration::ZERO);
        pipeline.register_local("px", "face", StageOp::FacePixelate { block: 2 });
        pipeline.load_effect("px").unwrap();
        pipeline.set_faces_provider(Some(Arc::new(|| {
            vec![FaceInfo {
                bounding_box: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                },
                face_id: 0,
                confidence: 1.0,
                has_landmarks: false,
            }]
        })));

        // A gradient frame gets flattened into blocks.
        let data: Vec<u8> = (0..48).map(|i| i as u8).collect();
        let frame = Arc::new(Frame {
            width: 4,
            height: 4,
            data,
            pts: Duration::ZERO,
            sequence: 0,
        });
        let out = pipeline.apply_frame(&frame, wide_budget());
        // Top-left 2x2 block flooded with pixel (0,0).
        assert_eq!(&out.data[0..3], &[0, 1, 2]);
        assert_eq!(&out.data[3..6], &[0, 1, 2]);
    }

    #[test]
    fn unused_frame_fields_pass_through() {
        let (pipeline, _dispatcher, _cache, _t) = pipeline_with(b"", Duration::ZERO);
        pipeline.register_local("invert", "basic", StageOp::Invert);
        pipeline.load_effect("invert").unwrap();

        let captured = CapturedFrame {
            width: 2,
            height: 2,
            data: vec![0u8; 12],
            pts: Duration::from_millis(330),
        };
        let frame = Arc::new(Frame {
            width: captured.width,
            height: captured.height,
            data: captured.data,
            pts: captured.pts,
            sequence: 42,
        });
        let out = pipeline.apply_frame(&frame, wide_budget());
        assert_eq!(out.pts, frame.pts);
        assert_eq!(out.sequence, frame.sequence);
    }
}
