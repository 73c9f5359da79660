//! Pose data types shared by the estimation engine, the session coordinator,
//! and the wire protocol. `PoseFrame` serializes to the exact JSON shape the
//! relay peers exchange.

use serde::{Deserialize, Serialize};

/// The 17 pose keypoint parts, in model output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(usize)]
pub enum Part {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl Part {
    pub const COUNT: usize = 17;

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Nose),
            1 => Some(Self::LeftEye),
            2 => Some(Self::RightEye),
            3 => Some(Self::LeftEar),
            4 => Some(Self::RightEar),
            5 => Some(Self::LeftShoulder),
            6 => Some(Self::RightShoulder),
            7 => Some(Self::LeftElbow),
            8 => Some(Self::RightElbow),
            9 => Some(Self::LeftWrist),
            10 => Some(Self::RightWrist),
            11 => Some(Self::LeftHip),
            12 => Some(Self::RightHip),
            13 => Some(Self::LeftKnee),
            14 => Some(Self::RightKnee),
            15 => Some(Self::LeftAnkle),
            16 => Some(Self::RightAnkle),
            _ => None,
        }
    }

    /// All parts in index order.
    pub fn all() -> impl Iterator<Item = Part> {
        (0..Self::COUNT).map(|i| Self::from_index(i).unwrap())
    }
}

/// A 2D point in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// A single detected keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub part: Part,
    pub score: f32,
    pub position: Point,
}

impl Keypoint {
    pub fn new(part: Part, x: f32, y: f32, score: f32) -> Self {
        Self {
            part,
            score,
            position: Point { x, y },
        }
    }

    /// Score at or above the threshold.
    pub fn is_valid(&self, threshold: f32) -> bool {
        self.score >= threshold
    }
}

/// One detected person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub score: f32,
    pub keypoints: Vec<Keypoint>,
}

impl Pose {
    pub fn new(score: f32, keypoints: Vec<Keypoint>) -> Self {
        Self { score, keypoints }
    }

    pub fn get(&self, part: Part) -> Option<&Keypoint> {
        self.keypoints.iter().find(|k| k.part == part)
    }
}

/// Intrinsic size of the frame the poses were estimated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Immutable snapshot of one estimation result. This is the unit published
/// to local consumers and sent to the relay, one JSON message per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseFrame {
    pub poses: Vec<Pose>,
    pub image: ImageSize,
}

impl PoseFrame {
    pub fn new(poses: Vec<Pose>, image: ImageSize) -> Self {
        Self { poses, image }
    }
}
