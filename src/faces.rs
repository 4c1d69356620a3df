//! Face detection and tracking, off the synchronous frame path.
//!
//! The module owns a bus receiver and a worker thread: frames arrive through
//! a latest-wins mailbox, a `FaceDetector` produces raw detections, and the
//! tracker maps them to stable IDs by bounding-box overlap. Results are
//! published as `FacesDetected` events; face-aware stages read the same
//! snapshot through `latest_faces`.
//!
//! When face detection is disabled in the SDK config this module is never
//! constructed: no subscription, no tracking-table mutations, no events, and
//! zero overhead on the frame path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bus::BusReceiver;
use crate::events::{Event, EventDispatcher};
use crate::frame::Frame;

/// Overlap threshold for associating a detection with an existing track.
const IOU_THRESHOLD: f32 = 0.3;
/// A track missing from this many consecutive analyzed frames expires.
const MAX_MISSED_FRAMES: u32 = 3;

/// Normalized bounding box, coordinates in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        if right <= left || bottom <= top {
            return 0.0;
        }
        let intersection = (right - left) * (bottom - top);
        let union = self.width * self.height + other.width * other.height - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// One detection before tracking has assigned an ID.
#[derive(Clone, Debug)]
pub struct RawDetection {
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    pub has_landmarks: bool,
}

/// One tracked face. IDs are stable only within a continuous camera Running
/// period; a Stop/Start cycle resets tracking. Values are snapshots; retain
/// by copy.
#[derive(Clone, Debug)]
pub struct FaceInfo {
    pub bounding_box: BoundingBox,
    pub face_id: u64,
    pub confidence: f32,
    pub has_landmarks: bool,
}

/// Detector seam. Real landmark models live behind this trait; the kernel
/// ships a luminance-variance stub for tests and demos.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Vec<RawDetection>;
}

/// Stub detector: reports one centered "face" whenever the frame's average
/// luminance crosses a threshold. Deterministic on the synthetic source.
pub struct StubFaceDetector {
    threshold: u8,
}

impl StubFaceDetector {
    pub fn new() -> Self {
        Self { threshold: 96 }
    }
}

impl Default for StubFaceDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceDetector for StubFaceDetector {
    fn detect(&mut self, frame: &Frame) -> Vec<RawDetection> {
        if frame.data.is_empty() {
            return Vec::new();
        }
        let sum: u64 = frame.data.iter().map(|&b| u64::from(b)).sum();
        let mean = (sum / frame.data.len() as u64) as u8;
        if mean >= self.threshold {
            vec![RawDetection {
                bounding_box: BoundingBox {
                    x: 0.35,
                    y: 0.25,
                    width: 0.3,
                    height: 0.4,
                },
                confidence: 0.9,
                has_landmarks: false,
            }]
        } else {
            Vec::new()
        }
    }
}

// -------------------- Tracking --------------------

struct Track {
    id: u64,
    bounding_box: BoundingBox,
    missed: u32,
}

/// Associates detections across consecutive frames. Owned exclusively by the
/// detection worker; nothing else mutates it.
pub struct FaceTracker {
    tracks: Vec<Track>,
    next_id: u64,
    mutations: u64,
}

impl FaceTracker {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 0,
            mutations: 0,
        }
    }

    /// Update the table with one frame's detections and return the tracked
    /// faces. Unmatched detections get fresh IDs; unmatched tracks survive a
    /// few missed frames before expiring.
    pub fn update(&mut self, detections: &[RawDetection]) -> Vec<FaceInfo> {
        self.mutations += 1;
        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut faces = Vec::with_capacity(detections.len());

        for detection in detections {
            let mut best: Option<(usize, f32)> = None;
            for (i, track) in self.tracks.iter().enumerate() {
                if matched_tracks[i] {
                    continue;
                }
                let iou = track.bounding_box.iou(&detection.bounding_box);
                if iou >= IOU_THRESHOLD && best.map_or(true, |(_, b)| iou > b) {
                    best = Some((i, iou));
                }
            }

            let id = match best {
                Some((i, _)) => {
                    matched_tracks[i] = true;
                    self.tracks[i].bounding_box = detection.bounding_box;
                    self.tracks[i].missed = 0;
                    self.tracks[i].id
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id,
                        bounding_box: detection.bounding_box,
                        missed: 0,
                    });
                    matched_tracks.push(true);
                    id
                }
            };

            faces.push(FaceInfo {
                bounding_box: detection.bounding_box,
                face_id: id,
                confidence: detection.confidence.clamp(0.0, 1.0),
                has_landmarks: detection.has_landmarks,
            });
        }

        // Age unmatched tracks; expire the ones missing too long.
        let mut kept = Vec::with_capacity(self.tracks.len());
        for (i, mut track) in self.tracks.drain(..).enumerate() {
            if matched_tracks.get(i).copied().unwrap_or(false) {
                kept.push(track);
            } else {
                track.missed += 1;
                if track.missed <= MAX_MISSED_FRAMES {
                    kept.push(track);
                }
            }
        }
        self.tracks = kept;

        faces
    }

    /// Number of times the table has been touched. Exists so tests can prove
    /// the disabled path performs zero tracking work.
    pub fn mutation_count(&self) -> u64 {
        self.mutations
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }
}

impl Default for FaceTracker {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------- Worker --------------------

/// Running face-detection worker. Dropping the handle stops the thread.
pub struct FaceDetectionModule {
    shutdown: Arc<AtomicBool>,
    latest: Arc<Mutex<Vec<FaceInfo>>>,
    join: Option<JoinHandle<()>>,
}

impl FaceDetectionModule {
    /// Spawn the worker on `receiver`. The worker drains the latest-wins
    /// mailbox, so it analyzes a decimated subsequence whenever the detector
    /// is slower than capture.
    pub fn spawn(
        receiver: BusReceiver,
        mut detector: Box<dyn FaceDetector>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let latest = Arc::new(Mutex::new(Vec::new()));

        let shutdown_thread = shutdown.clone();
        let latest_thread = latest.clone();
        let join = std::thread::spawn(move || {
            let mut tracker = FaceTracker::new();
            loop {
                if shutdown_thread.load(Ordering::SeqCst) {
                    break;
                }
                let Some(frame) = receiver.recv_timeout(Duration::from_millis(100)) else {
                    if receiver.is_closed() {
                        break;
                    }
                    continue;
                };
                let detections = detector.detect(&frame);
                let faces = tracker.update(&detections);
                *latest_thread.lock().unwrap() = faces.clone();
                dispatcher.publish(Event::FacesDetected(faces));
            }
            log::debug!(
                "face detection worker exiting ({} active tracks)",
                tracker.active_tracks()
            );
        });

        Self {
            shutdown,
            latest,
            join: Some(join),
        }
    }

    /// Snapshot of the most recent tracked faces, for face-aware stages.
    pub fn latest_faces(&self) -> Vec<FaceInfo> {
        self.latest.lock().unwrap().clone()
    }

    /// Shared handle to the snapshot slot, for wiring into the effect
    /// pipeline without keeping a borrow of the module alive.
    pub fn snapshot_handle(&self) -> Arc<Mutex<Vec<FaceInfo>>> {
        self.latest.clone()
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for FaceDetectionModule {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
        }
    }

    fn detection(bb: BoundingBox) -> RawDetection {
        RawDetection {
            bounding_box: bb,
            confidence: 0.8,
            has_landmarks: false,
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = boxed(0.1, 0.1, 0.5, 0.5);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = boxed(0.0, 0.0, 0.2, 0.2);
        let b = boxed(0.5, 0.5, 0.2, 0.2);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn overlapping_detection_keeps_its_id() {
        let mut tracker = FaceTracker::new();
        let first = tracker.update(&[detection(boxed(0.1, 0.1, 0.3, 0.3))]);
        assert_eq!(first.len(), 1);
        let id = first[0].face_id;

        // Slightly shifted box; association should hold.
        let second = tracker.update(&[detection(boxed(0.12, 0.11, 0.3, 0.3))]);
        assert_eq!(second[0].face_id, id);
    }

    #[test]
    fn disjoint_detection_gets_new_id() {
        let mut tracker = FaceTracker::new();
        let first = tracker.update(&[detection(boxed(0.0, 0.0, 0.2, 0.2))]);
        let second = tracker.update(&[detection(boxed(0.7, 0.7, 0.2, 0.2))]);
        assert_ne!(first[0].face_id, second[0].face_id);
    }

    #[test]
    fn track_survives_brief_miss_then_expires() {
        let mut tracker = FaceTracker::new();
        let bb = boxed(0.3, 0.3, 0.3, 0.3);
        let id = tracker.update(&[detection(bb)])[0].face_id;

        // Missed for fewer frames than the expiry limit: ID survives.
        tracker.update(&[]);
        tracker.update(&[]);
        let revived = tracker.update(&[detection(bb)]);
        assert_eq!(revived[0].face_id, id);

        // Missed beyond the limit: the old ID is gone.
        for _ in 0..=MAX_MISSED_FRAMES {
            tracker.update(&[]);
        }
        let fresh = tracker.update(&[detection(bb)]);
        assert_ne!(fresh[0].face_id, id);
    }

    #[test]
    fn two_faces_track_independently() {
        let mut tracker = FaceTracker::new();
        let left = boxed(0.1, 0.1, 0.2, 0.2);
        let right = boxed(0.6, 0.6, 0.2, 0.2);
        let faces = tracker.update(&[detection(left), detection(right)]);
        assert_eq!(faces.len(), 2);
        assert_ne!(faces[0].face_id, faces[1].face_id);

        let swapped = tracker.update(&[detection(right), detection(left)]);
        let find = |faces: &[FaceInfo], bb: BoundingBox| {
            faces
                .iter()
                .find(|f| f.bounding_box == bb)
                .map(|f| f.face_id)
                .unwrap()
        };
        assert_eq!(find(&faces, left), find(&swapped, left));
        assert_eq!(find(&faces, right), find(&swapped, right));
    }

    #[test]
    fn untouched_tracker_records_no_mutations() {
        let mut tracker = FaceTracker::new();
        assert_eq!(tracker.mutation_count(), 0);
        tracker.update(&[]);
        tracker.update(&[detection(boxed(0.1, 0.1, 0.3, 0.3))]);
        assert_eq!(tracker.mutation_count(), 2);
    }

    #[test]
    fn confidence_is_clamped() {
        let mut tracker = FaceTracker::new();
        let faces = tracker.update(&[RawDetection {
            bounding_box: boxed(0.1, 0.1, 0.3, 0.3),
            confidence: 1.7,
            has_landmarks: true,
        }]);
        assert_eq!(faces[0].confidence, 1.0);
        assert!(faces[0].has_landmarks);
    }
}
