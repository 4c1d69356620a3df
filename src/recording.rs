//! Segment recording of the post-effects frame stream.
//!
//! The engine consumes a bus subscription on its own worker thread, so a
//! slow disk never stalls capture; the bus simply drops stale frames for
//! the recorder's mailbox. Output is a length-prefixed segment file with
//! source timestamps preserved per record. The segment is written to a
//! `.part` sibling and renamed into place on finalize, so a crash mid-write
//! never leaves a file that looks finished.

use rand::Rng;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::bus::BusReceiver;
use crate::config::RecordingConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::events::{Event, EventDispatcher};
use crate::state::{recorder_machine, RecorderEvent, RecorderState, StateMachine};

const SEGMENT_MAGIC: &[u8; 8] = b"EFKSEG01";
const SEGMENT_EXT: &str = "efkseg";
const RECV_POLL: Duration = Duration::from_millis(50);

const RECORD_VIDEO: u8 = 0;
const RECORD_AUDIO: u8 = 1;

/// Pull seam for the audio track. Chunks are interleaved S16LE mono at
/// `sample_rate`.
pub trait AudioSource: Send {
    fn sample_rate(&self) -> u32 {
        48_000
    }

    /// Produce the samples covering `duration` of the track.
    fn next_chunk(&mut self, duration: Duration) -> Vec<u8>;
}

/// Default audio source when recording with audio but no capture device is
/// wired in.
pub struct SilenceSource {
    sample_rate: u32,
}

impl SilenceSource {
    pub fn new() -> Self {
        Self { sample_rate: 48_000 }
    }
}

impl Default for SilenceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for SilenceSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn next_chunk(&mut self, duration: Duration) -> Vec<u8> {
        let samples = (self.sample_rate as f64 * duration.as_secs_f64()).round() as usize;
        vec![0u8; samples * 2]
    }
}

/// Summary returned when a recording finalizes.
#[derive(Clone, Debug)]
pub struct RecordingStats {
    pub output_path: PathBuf,
    pub frames_written: u64,
    pub duration: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_bps: u32,
    pub has_audio: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRecord {
    pub kind: u8,
    pub pts: Duration,
    pub payload: Vec<u8>,
}

struct EngineShared {
    machine: Mutex<StateMachine<RecorderState, RecorderEvent>>,
    dispatcher: Arc<EventDispatcher>,
}

impl EngineShared {
    /// Apply a recorder event if the machine accepts it from its current
    /// state, publishing the change. Events the machine does not accept
    /// are skipped, which makes stop racing a natural finish harmless.
    fn transition(&self, event: RecorderEvent) -> Option<RecorderState> {
        let mut machine = self.machine.lock().unwrap();
        if !machine.accepts(event) {
            return None;
        }
        let next = machine.handle(event).ok()?;
        // Publish before releasing the lock so observers see recorder
        // states in transition order.
        self.dispatcher.publish(Event::RecorderStateChanged(next));
        Some(next)
    }

    fn fail(&self, error: &Error) {
        self.transition(RecorderEvent::Failed);
        self.dispatcher.publish(Event::Error(error.clone()));
    }
}

struct Session {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<RecordingStats>>>,
}

pub struct RecordingEngine {
    shared: Arc<EngineShared>,
    session: Mutex<Option<Session>>,
}

impl RecordingEngine {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                machine: Mutex::new(recorder_machine()),
                dispatcher,
            }),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.shared.machine.lock().unwrap().state()
    }

    /// Start a recording session over `receiver`.
    ///
    /// The caller hands over a subscription on the post-effects bus; the
    /// engine owns it until the session ends. The output file is created
    /// up front so disk problems surface here, synchronously, with the
    /// recorder still Idle.
    pub fn start(
        &self,
        receiver: BusReceiver,
        audio: Option<Box<dyn AudioSource>>,
        config: RecordingConfig,
        frame_size: (u32, u32),
    ) -> Result<()> {
        config.validate()?;
        let mut session = self.session.lock().unwrap();
        if session.is_some() {
            return Err(Error::invalid_parameter("a recording is already active"));
        }

        let (width, height) = config.video_size.unwrap_or(frame_size);
        let audio = match (config.include_audio, audio) {
            (false, _) => None,
            (true, Some(source)) => Some(source),
            (true, None) => Some(Box::new(SilenceSource::new()) as Box<dyn AudioSource>),
        };
        let header = SegmentHeader {
            width,
            height,
            frame_rate: config.effective_frame_rate(),
            bitrate_bps: config.video_quality.bitrate_bps(),
            has_audio: audio.is_some(),
        };

        let output_dir = config
            .output_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&output_dir).map_err(|e| {
            Error::with_cause(
                ErrorCode::MemoryError,
                format!("cannot create output directory {}", output_dir.display()),
                e,
            )
        })?;
        let final_path = output_dir.join(segment_name());
        let part_path = final_path.with_extension(format!("{}.part", SEGMENT_EXT));
        let writer = SegmentWriter::create(&part_path, &header)?;

        if self.shared.transition(RecorderEvent::StartRequested).is_none() {
            let _ = fs::remove_file(&part_path);
            return Err(Error::invalid_parameter(
                "recorder cannot start from this state",
            ));
        }
        log::info!(
            "recording started: {} ({}x{} @ {} fps, audio={})",
            final_path.display(),
            width,
            height,
            header.frame_rate,
            header.has_audio
        );

        let stop = Arc::new(AtomicBool::new(false));
        let shared = self.shared.clone();
        let stop_flag = stop.clone();
        let worker = std::thread::Builder::new()
            .name("recording".into())
            .spawn(move || {
                let result = run_session(
                    receiver,
                    audio,
                    writer,
                    part_path,
                    final_path,
                    config.max_duration,
                    header.frame_rate,
                    &stop_flag,
                );
                match &result {
                    Ok(stats) => {
                        shared.transition(RecorderEvent::StopRequested);
                        shared.transition(RecorderEvent::Finalized);
                        log::info!(
                            "recording finalized: {} ({} frames, {:?})",
                            stats.output_path.display(),
                            stats.frames_written,
                            stats.duration
                        );
                    }
                    Err(e) => shared.fail(e),
                }
                result
            })
            .map_err(|e| Error::with_cause(ErrorCode::Unknown, "cannot spawn recorder", e))?;

        *session = Some(Session {
            stop,
            worker: Some(worker),
        });
        Ok(())
    }

    /// Stop the active session and block until the segment is finalized.
    ///
    /// Also the way to collect the result of a session that already stopped
    /// itself at the duration bound.
    pub fn stop(&self) -> Result<RecordingStats> {
        let mut slot = self.session.lock().unwrap();
        let mut session = slot
            .take()
            .ok_or_else(|| Error::invalid_parameter("no active recording"))?;
        drop(slot);

        session.stop.store(true, Ordering::SeqCst);
        self.shared.transition(RecorderEvent::StopRequested);

        let worker = session.worker.take();
        let result = match worker {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(Error::new(ErrorCode::Unknown, "recorder thread panicked")),
            },
            None => Err(Error::new(ErrorCode::Unknown, "recorder already joined")),
        };
        if result.is_err() {
            // Error is terminal for the session's machine; the engine itself
            // accepts a fresh session once the failure has been surfaced.
            *self.shared.machine.lock().unwrap() = recorder_machine();
        }
        result
    }

    pub fn is_recording(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }
}

#[allow(clippy::too_many_arguments)]
fn run_session(
    receiver: BusReceiver,
    mut audio: Option<Box<dyn AudioSource>>,
    mut writer: SegmentWriter,
    part_path: PathBuf,
    final_path: PathBuf,
    max_duration: Duration,
    frame_rate: u32,
    stop: &AtomicBool,
) -> Result<RecordingStats> {
    let frame_interval = Duration::from_secs(1) / frame_rate.max(1);
    let bounded = !max_duration.is_zero();
    let mut base_pts: Option<Duration> = None;
    let mut frames_written: u64 = 0;
    let mut recorded: Duration = Duration::ZERO;

    let result = loop {
        match receiver.recv_timeout(RECV_POLL) {
            Some(frame) => {
                let base = *base_pts.get_or_insert(frame.pts);
                let rel = frame.pts.saturating_sub(base);
                // Duration bound is a hard edge: the frame that would
                // cross it is not written.
                if bounded && rel >= max_duration {
                    break Ok(());
                }
                if let Err(e) = writer.write_record(RECORD_VIDEO, rel, &frame.data) {
                    break Err(e);
                }
                if let Some(source) = audio.as_mut() {
                    let chunk = source.next_chunk(frame_interval);
                    if let Err(e) = writer.write_record(RECORD_AUDIO, rel, &chunk) {
                        break Err(e);
                    }
                }
                frames_written += 1;
                recorded = rel + frame_interval;
            }
            None => {
                if stop.load(Ordering::SeqCst) || receiver.is_closed() {
                    break Ok(());
                }
            }
        }
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }
    };

    match result {
        Ok(()) => {
            writer.finalize(&part_path, &final_path)?;
            Ok(RecordingStats {
                output_path: final_path,
                frames_written,
                duration: recorded,
            })
        }
        Err(e) => {
            drop(writer);
            let _ = fs::remove_file(&part_path);
            Err(e)
        }
    }
}

fn segment_name() -> String {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let tag: u32 = rand::thread_rng().gen();
    format!("recording-{}-{:08x}.{}", epoch, tag, SEGMENT_EXT)
}

struct SegmentWriter {
    out: BufWriter<File>,
}

impl SegmentWriter {
    fn create(part_path: &Path, header: &SegmentHeader) -> Result<Self> {
        let file = File::create(part_path).map_err(|e| {
            Error::with_cause(
                ErrorCode::MemoryError,
                format!("cannot create {}", part_path.display()),
                e,
            )
        })?;
        let mut writer = Self {
            out: BufWriter::new(file),
        };
        writer.write_header(header)?;
        Ok(writer)
    }

    fn write_header(&mut self, header: &SegmentHeader) -> Result<()> {
        let mut buf = Vec::with_capacity(8 + 4 * 4 + 1);
        buf.extend_from_slice(SEGMENT_MAGIC);
        buf.extend_from_slice(&header.width.to_le_bytes());
        buf.extend_from_slice(&header.height.to_le_bytes());
        buf.extend_from_slice(&header.frame_rate.to_le_bytes());
        buf.extend_from_slice(&header.bitrate_bps.to_le_bytes());
        buf.push(header.has_audio as u8);
        self.write_all(&buf)
    }

    fn write_record(&mut self, kind: u8, pts: Duration, payload: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(1 + 8 + 4 + payload.len());
        buf.push(kind);
        buf.extend_from_slice(&(pts.as_micros() as u64).to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        self.write_all(&buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.out
            .write_all(bytes)
            .map_err(|e| Error::with_cause(ErrorCode::MemoryError, "segment write failed", e))
    }

    /// Flush, sync, and publish the segment under its final name.
    fn finalize(mut self, part_path: &Path, final_path: &Path) -> Result<()> {
        self.out
            .flush()
            .map_err(|e| Error::with_cause(ErrorCode::MemoryError, "segment flush failed", e))?;
        self.out
            .get_ref()
            .sync_all()
            .map_err(|e| Error::with_cause(ErrorCode::MemoryError, "segment sync failed", e))?;
        drop(self);
        fs::rename(part_path, final_path).map_err(|e| {
            Error::with_cause(
                ErrorCode::MemoryError,
                format!("cannot publish {}", final_path.display()),
                e,
            )
        })
    }
}

/// Parse a finalized segment. Used by inspection tooling and tests.
pub fn read_segment(path: &Path) -> Result<(SegmentHeader, Vec<SegmentRecord>)> {
    let mut raw = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut raw))
        .map_err(|e| {
            Error::with_cause(
                ErrorCode::ResourceNotFound,
                format!("cannot read segment {}", path.display()),
                e,
            )
        })?;
    let malformed = || Error::new(ErrorCode::InvalidParameter, "malformed segment");

    if raw.len() < 25 || &raw[0..8] != SEGMENT_MAGIC {
        return Err(malformed());
    }
    let u32_at = |off: usize| u32::from_le_bytes(raw[off..off + 4].try_into().unwrap());
    let header = SegmentHeader {
        width: u32_at(8),
        height: u32_at(12),
        frame_rate: u32_at(16),
        bitrate_bps: u32_at(20),
        has_audio: raw[24] != 0,
    };

    let mut records = Vec::new();
    let mut off = 25;
    while off < raw.len() {
        if off + 13 > raw.len() {
            return Err(malformed());
        }
        let kind = raw[off];
        let pts = u64::from_le_bytes(raw[off + 1..off + 9].try_into().unwrap());
        let len = u32_at(off + 9) as usize;
        off += 13;
        if off + len > raw.len() {
            return Err(malformed());
        }
        records.push(SegmentRecord {
            kind,
            pts: Duration::from_micros(pts),
            payload: raw[off..off + len].to_vec(),
        });
        off += len;
    }
    Ok((header, records))
}
