//! Source dataset descriptors and on-disk discovery.
//!
//! Images are found recursively by extension. A label for `dir/img.jpg` is
//! `dir/img.txt` when present, otherwise the mirror path with the `images`
//! component replaced by `labels` (`images/train/img.jpg` ->
//! `labels/train/img.txt`).

use glob::{MatchOptions, Pattern};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use crate::errors::{CuratorError, Result};
use crate::labels::{ClassMap, LABEL_EXTENSION};
use crate::types::{LabelFormat, UnifiedClass};

pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Text files that live in dataset trees but are not per-image labels.
const NON_LABEL_FILES: [&str; 6] = [
    "classes.txt",
    "readme.txt",
    "license.txt",
    "train.txt",
    "val.txt",
    "test.txt",
];

/// A registered annotation source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDataset {
    pub id: String,
    /// Registration order; merge order of the unified corpus.
    pub index: usize,
    pub root: PathBuf,
    pub format: LabelFormat,
    pub class_map: ClassMap,
    /// Treat images without a label file as negatives instead of rejecting them.
    pub unlabeled_as_background: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredImage {
    pub path: PathBuf,
    /// Path relative to the source root, `/`-separated.
    pub relative: String,
    pub label: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceLayout {
    /// Sorted by relative path.
    pub images: Vec<DiscoveredImage>,
    /// Label files with no image on disk.
    pub orphan_labels: Vec<PathBuf>,
}

impl SourceDataset {
    pub fn provided_classes(&self) -> Vec<UnifiedClass> {
        self.class_map.provided()
    }

    /// Walks the source root. A missing root or a root without images is a
    /// dataset-level error.
    pub fn discover(&self) -> Result<SourceLayout> {
        if !self.root.is_dir() {
            return Err(CuratorError::unusable_source(
                &self.id,
                format!("root {} is not a readable directory", self.root.display()),
            ));
        }

        let mut images = BTreeSet::new();
        for ext in IMAGE_EXTENSIONS {
            images.extend(self.glob_files(ext)?);
        }
        if images.is_empty() {
            return Err(CuratorError::unusable_source(
                &self.id,
                format!("no images found under {}", self.root.display()),
            ));
        }

        let labels: BTreeSet<PathBuf> = self
            .glob_files(LABEL_EXTENSION)?
            .into_iter()
            .filter(|path| !is_non_label_file(path))
            .collect();

        let mut claimed = BTreeSet::new();
        let mut discovered: Vec<DiscoveredImage> = images
            .into_iter()
            .map(|path| {
                let relative = relative_string(&self.root, &path);
                let label = find_label_file(&self.root, &path);
                if let Some(label) = &label {
                    claimed.insert(label.clone());
                }
                DiscoveredImage {
                    path,
                    relative,
                    label,
                }
            })
            .collect();
        discovered.sort_by(|a, b| a.relative.cmp(&b.relative));

        let orphan_labels = labels.difference(&claimed).cloned().collect();

        Ok(SourceLayout {
            images: discovered,
            orphan_labels,
        })
    }

    fn glob_files(&self, extension: &str) -> Result<Vec<PathBuf>> {
        let root = self.root.to_str().ok_or_else(|| {
            CuratorError::unusable_source(&self.id, "root path is not valid UTF-8")
        })?;
        let pattern = format!("{}/**/*.{extension}", Pattern::escape(root));
        let options = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::new()
        };

        let entries = glob::glob_with(&pattern, options)
            .map_err(|e| CuratorError::unusable_source(&self.id, e.to_string()))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| CuratorError::Io(e.into_error()))?;
            if path.is_file() {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn is_non_label_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| {
            NON_LABEL_FILES
                .iter()
                .any(|known| name.eq_ignore_ascii_case(known))
        })
}

fn relative_string(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Locates the label file for an image, sibling first, then the
/// `images/` -> `labels/` mirror below the source root.
pub fn find_label_file(root: &Path, image: &Path) -> Option<PathBuf> {
    let sibling = image.with_extension(LABEL_EXTENSION);
    if sibling.is_file() {
        return Some(sibling);
    }

    let relative = image.strip_prefix(root).ok()?;
    let mut replaced = false;
    let mirrored: PathBuf = relative
        .components()
        .map(|component| match component {
            Component::Normal(name) if !replaced && name == "images" => {
                replaced = true;
                Component::Normal("labels".as_ref())
            }
            other => other,
        })
        .collect();

    if !replaced {
        return None;
    }
    let candidate = root.join(mirrored).with_extension(LABEL_EXTENSION);
    candidate.is_file().then_some(candidate)
}
