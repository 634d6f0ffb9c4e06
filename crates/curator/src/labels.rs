//! Per-image label files: one object per line, class index then four
//! normalized coordinates.

use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::{CuratorError, Result};
use crate::types::{Annotation, BoundingBox, LabelFormat, UnifiedClass};

pub const LABEL_EXTENSION: &str = "txt";
const FIELDS_PER_LINE: usize = 5;

/// A label line before class mapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawLabel {
    pub class_index: u32,
    pub bbox: BoundingBox,
}

/// Source class index to unified class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassMap {
    entries: BTreeMap<u32, UnifiedClass>,
}

impl ClassMap {
    pub fn new(entries: BTreeMap<u32, UnifiedClass>) -> Self {
        Self { entries }
    }

    pub fn get(&self, class_index: u32) -> Option<UnifiedClass> {
        self.entries.get(&class_index).copied()
    }

    /// Unified classes this source can produce.
    pub fn provided(&self) -> Vec<UnifiedClass> {
        let mut classes: Vec<UnifiedClass> = self.entries.values().copied().collect();
        classes.sort();
        classes.dedup();
        classes
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(u32, UnifiedClass)> for ClassMap {
    fn from_iter<I: IntoIterator<Item = (u32, UnifiedClass)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Parses one line. Blank lines yield `None`.
pub fn parse_line(line: &str, format: LabelFormat, path: &Path, line_no: usize) -> Result<Option<RawLabel>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.is_empty() {
        return Ok(None);
    }
    if fields.len() != FIELDS_PER_LINE {
        return Err(CuratorError::format(
            path,
            line_no,
            format!("expected {FIELDS_PER_LINE} fields, got {}", fields.len()),
        ));
    }

    let class_index: u32 = fields[0].parse().map_err(|_| {
        CuratorError::format(path, line_no, format!("invalid class index '{}'", fields[0]))
    })?;

    let mut coords = [0f32; 4];
    for (slot, raw) in coords.iter_mut().zip(&fields[1..]) {
        *slot = raw.parse().map_err(|_| {
            CuratorError::format(path, line_no, format!("invalid coordinate '{raw}'"))
        })?;
    }

    let [a, b, c, d] = coords;
    let bbox = match format {
        LabelFormat::Yolo => BoundingBox::from_center(a, b, c, d),
        LabelFormat::Xyxy => BoundingBox::from_corners(a, b, c, d),
    }
    .map_err(|message| CuratorError::format(path, line_no, message))?;

    Ok(Some(RawLabel { class_index, bbox }))
}

/// Parses every line of a label file without class mapping.
pub fn parse_raw(content: &str, format: LabelFormat, path: &Path) -> Result<Vec<RawLabel>> {
    let mut labels = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if let Some(label) = parse_line(line, format, path, idx + 1)? {
            labels.push(label);
        }
    }
    Ok(labels)
}

/// Parses a label file into unified annotations for `record_id`.
///
/// Boxes whose source class maps to background are dropped; an unmapped class
/// index is a format error.
pub fn parse_label_file(
    content: &str,
    format: LabelFormat,
    class_map: &ClassMap,
    path: &Path,
    record_id: &str,
) -> Result<Vec<Annotation>> {
    let mut annotations = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let Some(raw) = parse_line(line, format, path, line_no)? else {
            continue;
        };
        let class = class_map.get(raw.class_index).ok_or_else(|| {
            CuratorError::format(
                path,
                line_no,
                format!("unknown class code {}", raw.class_index),
            )
        })?;
        if class.is_object() {
            annotations.push(Annotation {
                record_id: record_id.to_string(),
                class,
                bbox: raw.bbox,
            });
        }
    }
    Ok(annotations)
}

/// Formats an annotation as a center-format label line.
pub fn format_line(annotation: &Annotation) -> Option<String> {
    let class_id = annotation.class.object_id()?;
    let bbox = &annotation.bbox;
    Some(format!(
        "{} {:.6} {:.6} {:.6} {:.6}",
        class_id, bbox.x_center, bbox.y_center, bbox.width, bbox.height
    ))
}

/// Renders a whole label file. Background images produce an empty file.
pub fn render_label_file(annotations: &[Annotation]) -> String {
    let mut out = String::new();
    for line in annotations.iter().filter_map(format_line) {
        out.push_str(&line);
        out.push('\n');
    }
    out
}
