//! Core data model: unified label space, normalized boxes, image records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::fingerprint::Fingerprint;

/// Overflow past the unit square tolerated (and clamped) when parsing boxes.
pub const EDGE_TOLERANCE: f32 = 1e-3;

/// Unified label space shared by every source after class mapping.
///
/// Ordering follows the output class ids: smoke = 0, fire = 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnifiedClass {
    Smoke,
    Fire,
    Background,
}

impl UnifiedClass {
    pub const ALL: [UnifiedClass; 3] = [
        UnifiedClass::Smoke,
        UnifiedClass::Fire,
        UnifiedClass::Background,
    ];

    /// Classes that produce boxes in the output label files.
    pub const OBJECTS: [UnifiedClass; 2] = [UnifiedClass::Smoke, UnifiedClass::Fire];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnifiedClass::Smoke => "smoke",
            UnifiedClass::Fire => "fire",
            UnifiedClass::Background => "background",
        }
    }

    /// Class id written to output label files. Background has none.
    pub fn object_id(&self) -> Option<u32> {
        match self {
            UnifiedClass::Smoke => Some(0),
            UnifiedClass::Fire => Some(1),
            UnifiedClass::Background => None,
        }
    }

    pub fn is_object(&self) -> bool {
        self.object_id().is_some()
    }
}

impl fmt::Display for UnifiedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnifiedClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "smoke" => Ok(UnifiedClass::Smoke),
            "fire" | "flame" => Ok(UnifiedClass::Fire),
            "background" | "negative" | "none" => Ok(UnifiedClass::Background),
            other => Err(format!("unknown unified class '{other}'")),
        }
    }
}

/// Bounding-box schema variant used by a source's label files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelFormat {
    /// `class x_center y_center width height`, normalized.
    #[default]
    Yolo,
    /// `class x0 y0 x1 y1`, normalized corners.
    Xyxy,
}

impl LabelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelFormat::Yolo => "yolo",
            LabelFormat::Xyxy => "xyxy",
        }
    }
}

/// Normalized center-format box. Construction enforces the unit-square invariant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_center: f32,
    pub y_center: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Builds a box from center format. Edges overflowing `[0, 1]` by at most
    /// [`EDGE_TOLERANCE`] are clamped back inside.
    pub fn from_center(x_center: f32, y_center: f32, width: f32, height: f32) -> Result<Self, String> {
        for (name, value) in [
            ("x_center", x_center),
            ("y_center", y_center),
            ("width", width),
            ("height", height),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(format!("{name} {value} outside [0, 1]"));
            }
        }
        if width <= 0.0 || height <= 0.0 {
            return Err(format!("non-positive box size {width}x{height}"));
        }

        let x0 = x_center - width / 2.0;
        let y0 = y_center - height / 2.0;
        let x1 = x_center + width / 2.0;
        let y1 = y_center + height / 2.0;
        Self::from_corners(x0, y0, x1, y1)
    }

    /// Builds a box from normalized corners, with the same clamping rule.
    pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Result<Self, String> {
        for value in [x0, y0, x1, y1] {
            if !value.is_finite() || value < -EDGE_TOLERANCE || value > 1.0 + EDGE_TOLERANCE {
                return Err(format!(
                    "box edges [{x0}, {y0}, {x1}, {y1}] leave the unit square"
                ));
            }
        }
        let (x0, y0) = (x0.max(0.0), y0.max(0.0));
        let (x1, y1) = (x1.min(1.0), y1.min(1.0));
        if x1 <= x0 || y1 <= y0 {
            return Err(format!("degenerate box [{x0}, {y0}, {x1}, {y1}]"));
        }

        Ok(Self {
            x_center: (x0 + x1) / 2.0,
            y_center: (y0 + y1) / 2.0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }

    /// Returns `[x0, y0, x1, y1]`.
    pub fn corners(&self) -> [f32; 4] {
        [
            self.x_center - self.width / 2.0,
            self.y_center - self.height / 2.0,
            self.x_center + self.width / 2.0,
            self.y_center + self.height / 2.0,
        ]
    }

    /// Re-checks the invariant; used by the final consistency pass.
    pub fn is_valid(&self) -> bool {
        let [x0, y0, x1, y1] = self.corners();
        self.width > 0.0
            && self.height > 0.0
            && [x0, y0, x1, y1]
                .iter()
                .all(|v| v.is_finite() && *v >= -EDGE_TOLERANCE && *v <= 1.0 + EDGE_TOLERANCE)
    }
}

/// A single labeled object. Always owned by the record named in `record_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub record_id: String,
    pub class: UnifiedClass,
    pub bbox: BoundingBox,
}

/// One ingested image with its annotations. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub source_id: String,
    /// Registration order of the originating source.
    pub source_index: usize,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fingerprint: Fingerprint,
    /// Negative sample: no object of the unified label space.
    pub background: bool,
    pub annotations: Vec<Annotation>,
}

impl ImageRecord {
    /// Derives a stable record id from the source id and the image path
    /// relative to the source root.
    ///
    /// Characters outside `[A-Za-z0-9._-]` (including `/`) become `_`. When
    /// anything was replaced, a short BLAKE3 digest of the original path is
    /// appended so distinct paths never share an id.
    pub fn derive_id(source_id: &str, relative_path: &str) -> String {
        let sanitized: String = relative_path
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if sanitized == relative_path {
            return format!("{source_id}__{sanitized}");
        }
        let digest = blake3::hash(relative_path.as_bytes());
        format!("{source_id}__{sanitized}-{}", hex::encode(&digest.as_bytes()[..4]))
    }

    /// Distinct object classes present in this image.
    pub fn classes(&self) -> Vec<UnifiedClass> {
        let mut classes: Vec<UnifiedClass> = self.annotations.iter().map(|a| a.class).collect();
        classes.sort();
        classes.dedup();
        classes
    }

    pub fn extension(&self) -> &str {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("jpg")
    }
}

/// Output partition of the split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Train,
    Val,
    Test,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Train, Partition::Val, Partition::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Val => "val",
            Partition::Test => "test",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
