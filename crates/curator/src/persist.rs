//! Atomic on-disk output of a curated corpus.
//!
//! Everything is written into a staging directory beside the output
//! directory, then renamed into place. A failed run leaves the previous
//! output untouched and no staging files behind.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{CuratorError, Result};
use crate::labels::{LABEL_EXTENSION, render_label_file};
use crate::manifest::{MANIFEST_FILE, Manifest};
use crate::pipeline::CurationOutput;
use crate::types::{ImageRecord, Partition, UnifiedClass};

pub const DATA_YAML: &str = "data.yaml";
const LABELS_DIR: &str = "labels";
const IMAGES_DIR: &str = "images";

#[derive(Debug, Clone, PartialEq)]
pub struct PersistOptions {
    pub output_dir: PathBuf,
    /// Copy images into the output instead of linking them.
    pub copy_images: bool,
}

/// Paths of the persisted artifacts, under the final output directory.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedLayout {
    pub root: PathBuf,
    pub manifest: PathBuf,
    pub data_yaml: PathBuf,
    pub lists: BTreeMap<Partition, PathBuf>,
}

impl PersistedLayout {
    fn under(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            manifest: root.join(MANIFEST_FILE),
            data_yaml: root.join(DATA_YAML),
            lists: Partition::ALL
                .iter()
                .map(|p| (*p, root.join(list_file(*p))))
                .collect(),
        }
    }
}

fn list_file(partition: Partition) -> String {
    format!("{}.txt", partition.as_str())
}

/// Writes the curated corpus, replacing any previous output wholesale.
pub fn persist(output: &CurationOutput, manifest: &Manifest, options: &PersistOptions) -> Result<PersistedLayout> {
    let _span = common::span!("persist", output = %options.output_dir.display());

    let target = &options.output_dir;
    let staging = sibling(target, "staging")?;
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }

    if let Err(e) = write_tree(&staging, output, manifest, options.copy_images) {
        discard(&staging);
        return Err(e);
    }

    if let Err(e) = swap_into_place(&staging, target) {
        discard(&staging);
        return Err(e);
    }

    tracing::info!(
        output = %target.display(),
        records = output.split.assignment.len(),
        copy_images = options.copy_images,
        "Curated corpus persisted"
    );
    Ok(PersistedLayout::under(target))
}

fn sibling(target: &Path, suffix: &str) -> Result<PathBuf> {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            CuratorError::Config(format!(
                "output_dir {} has no usable directory name",
                target.display()
            ))
        })?;
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(parent.join(format!(".{name}.{suffix}-{}", std::process::id())))
}

fn discard(path: &Path) {
    if path.exists()
        && let Err(e) = fs::remove_dir_all(path)
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove staging directory");
    }
}

fn swap_into_place(staging: &Path, target: &Path) -> Result<()> {
    if !target.exists() {
        fs::rename(staging, target)?;
        return Ok(());
    }

    let previous = sibling(target, "previous")?;
    discard(&previous);
    fs::rename(target, &previous)?;
    if let Err(e) = fs::rename(staging, target) {
        // Put the old output back before reporting
        if let Err(restore) = fs::rename(&previous, target) {
            tracing::error!(error = %restore, "Failed to restore previous output");
        }
        return Err(e.into());
    }
    discard(&previous);
    Ok(())
}

fn write_tree(root: &Path, output: &CurationOutput, manifest: &Manifest, copy_images: bool) -> Result<()> {
    fs::create_dir_all(root)?;

    let by_id: HashMap<&str, &ImageRecord> = output
        .corpus
        .records()
        .iter()
        .map(|r| (r.id.as_str(), r))
        .collect();
    let assignment = &output.split.assignment;

    let unassigned: Vec<String> = output
        .corpus
        .records()
        .iter()
        .filter(|r| assignment.get(&r.id).is_none())
        .map(|r| format!("record {} has no partition", r.id))
        .collect();
    if !unassigned.is_empty() {
        return Err(CuratorError::Validation(unassigned));
    }

    for partition in Partition::ALL {
        let labels_dir = root.join(LABELS_DIR).join(partition.as_str());
        fs::create_dir_all(&labels_dir)?;
        let images_dir = root.join(IMAGES_DIR).join(partition.as_str());
        fs::create_dir_all(&images_dir)?;

        let mut list = String::new();
        for id in assignment.members(partition) {
            let record = by_id.get(id).ok_or_else(|| {
                CuratorError::Validation(vec![format!("assigned record {id} is not in the corpus")])
            })?;

            let label_path = labels_dir.join(format!("{id}.{LABEL_EXTENSION}"));
            fs::write(&label_path, render_label_file(&record.annotations))?;

            // images/<partition>/<id>.<ext> mirrors labels/<partition>/<id>.txt
            let file_name = format!("{id}.{}", record.extension());
            let image_path = images_dir.join(&file_name);
            if copy_images {
                fs::copy(&record.path, &image_path).map_err(|e| {
                    CuratorError::missing_file(&record.path, format!("copy failed: {e}"))
                })?;
            } else {
                link_image(&record.path, &image_path)?;
            }
            list.push_str(&format!("./{IMAGES_DIR}/{}/{file_name}\n", partition.as_str()));
        }
        fs::write(root.join(list_file(partition)), list)?;
    }

    fs::write(root.join(DATA_YAML), data_yaml())?;
    manifest.write(&root.join(MANIFEST_FILE))?;
    Ok(())
}

/// Hard link, falling back to a symlink when the source is on another
/// filesystem.
fn link_image(source: &Path, dest: &Path) -> Result<()> {
    if !source.is_file() {
        return Err(CuratorError::missing_file(source, "image disappeared before persist"));
    }
    if fs::hard_link(source, dest).is_ok() {
        return Ok(());
    }
    let source = std::path::absolute(source)?;
    #[cfg(unix)]
    let linked = std::os::unix::fs::symlink(&source, dest);
    #[cfg(not(unix))]
    let linked = fs::copy(&source, dest).map(|_| ());
    linked.map_err(|e| CuratorError::missing_file(&source, format!("link failed: {e}")))
}

fn data_yaml() -> String {
    let mut yaml = String::new();
    for partition in Partition::ALL {
        yaml.push_str(&format!("{partition}: {}\n", list_file(partition)));
    }
    yaml.push_str(&format!("nc: {}\n", UnifiedClass::OBJECTS.len()));
    yaml.push_str("names:\n");
    for class in UnifiedClass::OBJECTS {
        if let Some(id) = class.object_id() {
            yaml.push_str(&format!("  {id}: {class}\n"));
        }
    }
    yaml
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::BalanceReport;
    use crate::config::SplitConfig;
    use crate::corpus::UnifiedCorpus;
    use crate::corpus::fixtures::record;
    use crate::dedup::DedupReport;
    use crate::split::{SplitOptions, split};
    use crate::types::UnifiedClass::{Fire, Smoke};

    fn output_with_files(dir: &Path) -> CurationOutput {
        let mut records = Vec::new();
        for i in 0..30u64 {
            for (prefix, offset, classes) in [("s", 0, &[Smoke][..]), ("f", 1_000, &[Fire][..]), ("b", 2_000, &[][..])] {
                let mut r = record(&format!("{prefix}{i:03}"), 0, offset + i, classes);
                r.path = dir.join(format!("{prefix}{i:03}.jpg"));
                fs::write(&r.path, b"jpeg bytes").unwrap();
                records.push(r);
            }
        }
        let corpus = UnifiedCorpus::new(records);
        let split = split(&corpus, &SplitOptions::default()).unwrap();
        CurationOutput {
            corpus,
            sources: Vec::new(),
            dedup: DedupReport::default(),
            balance: BalanceReport::default(),
            split,
            seed: 42,
            ratios: SplitConfig::default(),
        }
    }

    #[test]
    fn test_writes_lists_labels_yaml_and_manifest() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let output = output_with_files(src.path());
        let manifest = Manifest::from_output(&output);
        let options = PersistOptions {
            output_dir: out.path().join("curated"),
            copy_images: false,
        };

        let layout = persist(&output, &manifest, &options).unwrap();
        assert!(layout.manifest.is_file());

        let train = fs::read_to_string(&layout.lists[&Partition::Train]).unwrap();
        assert_eq!(train.lines().count(), 63);
        let val = fs::read_to_string(&layout.lists[&Partition::Val]).unwrap();
        let test = fs::read_to_string(&layout.lists[&Partition::Test]).unwrap();
        assert_eq!(train.lines().count() + val.lines().count() + test.lines().count(), 90);

        let yaml = fs::read_to_string(&layout.data_yaml).unwrap();
        assert!(yaml.contains("nc: 2"));
        assert!(yaml.contains("  0: smoke\n  1: fire\n"), "{yaml}");

        for line in train.lines() {
            let image = layout.root.join(line.trim_start_matches("./"));
            assert!(image.is_file(), "{line} should resolve inside the output");
            let label = layout
                .root
                .join(line.trim_start_matches("./").replacen("images/", "labels/", 1))
                .with_extension("txt");
            assert!(label.is_file(), "{line} has no normalized label at {}", label.display());
        }

        let partition = output.split.assignment.get("s000").unwrap();
        let label = fs::read_to_string(
            layout.root.join("labels").join(partition.as_str()).join("s000.txt"),
        )
        .unwrap();
        assert_eq!(label, "0 0.500000 0.500000 0.200000 0.200000\n");

        let partition = output.split.assignment.get("b000").unwrap();
        let label = layout.root.join("labels").join(partition.as_str()).join("b000.txt");
        assert_eq!(fs::read_to_string(label).unwrap(), "", "Background gets an empty label file");

        let leftovers: Vec<_> = fs::read_dir(out.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1, "Only the output directory should remain");
    }

    #[test]
    fn test_copies_images_and_replaces_previous_output() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("curated");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale.txt"), "old").unwrap();

        let output = output_with_files(src.path());
        let options = PersistOptions {
            output_dir: target.clone(),
            copy_images: true,
        };
        persist(&output, &Manifest::from_output(&output), &options).unwrap();

        assert!(!target.join("stale.txt").exists(), "Previous output is replaced wholesale");
        let test = fs::read_to_string(target.join("test.txt")).unwrap();
        let first = test.lines().next().unwrap();
        assert!(first.starts_with("./images/test/"), "{first}");
        assert!(target.join(first.trim_start_matches("./")).is_file());
    }

    #[test]
    fn test_linked_images_match_their_sources() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let output = output_with_files(src.path());
        let options = PersistOptions {
            output_dir: out.path().join("curated"),
            copy_images: false,
        };
        let layout = persist(&output, &Manifest::from_output(&output), &options).unwrap();

        let record = &output.corpus.records()[0];
        let partition = output.split.assignment.get(&record.id).unwrap();
        let linked = layout
            .root
            .join("images")
            .join(partition.as_str())
            .join(format!("{}.jpg", record.id));
        assert_eq!(fs::read(linked).unwrap(), fs::read(&record.path).unwrap());
    }

    #[test]
    fn test_missing_image_fails_linking() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let output = output_with_files(src.path());
        fs::remove_file(&output.corpus.records()[0].path).unwrap();
        let options = PersistOptions {
            output_dir: out.path().join("curated"),
            copy_images: false,
        };
        let err = persist(&output, &Manifest::from_output(&output), &options).unwrap_err();
        assert!(matches!(err, CuratorError::MissingFile { .. }), "{err:?}");
        assert!(!options.output_dir.exists());
    }

    #[test]
    fn test_failure_leaves_no_output_and_keeps_previous() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("curated");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("keep.txt"), "previous run").unwrap();

        let output = output_with_files(src.path());
        // Copying fails once the source image is gone
        fs::remove_file(&output.corpus.records()[0].path).unwrap();
        let options = PersistOptions {
            output_dir: target.clone(),
            copy_images: true,
        };
        let err = persist(&output, &Manifest::from_output(&output), &options).unwrap_err();
        assert!(matches!(err, CuratorError::MissingFile { .. }), "{err:?}");

        assert_eq!(fs::read_to_string(target.join("keep.txt")).unwrap(), "previous run");
        let entries: Vec<_> = fs::read_dir(out.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "Staging directory must be cleaned up");
    }
}
