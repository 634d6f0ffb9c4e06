//! Content fingerprints and near-duplicate grouping.
//!
//! Each image carries two fingerprints: a BLAKE3 digest of the file bytes for
//! exact duplicates, and a 64-bit difference hash (dHash) of the decoded pixels
//! for near duplicates such as re-encodes and resized copies.

use image::DynamicImage;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const PERCEPTUAL_BITS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    #[serde(with = "hex")]
    pub content: [u8; 32],
    pub perceptual: u64,
}

impl Fingerprint {
    pub fn new(content: [u8; 32], perceptual: u64) -> Self {
        Self {
            content,
            perceptual,
        }
    }

    /// Fingerprints an image from its raw file bytes and decoded pixels.
    pub fn of_image(bytes: &[u8], image: &DynamicImage) -> Self {
        Self {
            content: *blake3::hash(bytes).as_bytes(),
            perceptual: difference_hash(image),
        }
    }

    pub fn content_hex(&self) -> String {
        hex::encode(self.content)
    }

    /// Hamming distance between the perceptual hashes.
    pub fn distance(&self, other: &Fingerprint) -> u32 {
        (self.perceptual ^ other.perceptual).count_ones()
    }
}

/// dHash: 9x8 grayscale thumbnail, one bit per horizontally adjacent pair.
pub fn difference_hash(image: &DynamicImage) -> u64 {
    let thumb = image.resize_exact(9, 8, FilterType::Triangle).to_luma8();
    let mut hash = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            let left = thumb.get_pixel(x, y)[0];
            let right = thumb.get_pixel(x + 1, y)[0];
            hash = (hash << 1) | u64::from(left > right);
        }
    }
    hash
}

/// Converts a similarity in `[0, 1]` into a maximum Hamming distance.
///
/// 1.0 only matches identical hashes; 0.95 tolerates 3 differing bits.
pub fn max_distance_for(similarity: f64) -> u32 {
    let similarity = similarity.clamp(0.0, 1.0);
    let distance = ((1.0 - similarity) * f64::from(PERCEPTUAL_BITS) + 1e-9).floor();
    (distance as u32).min(PERCEPTUAL_BITS)
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        let mut root = node;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Joins two sets, keeping the smaller index as root for stable output.
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[merge] = keep;
        }
    }
}

/// Groups fingerprints that are identical in content or within `max_distance`
/// bits of each other, closed transitively.
///
/// Groups are ordered by their first member and members are ascending indices,
/// so the output depends only on input order. Candidate pairs come from a
/// multi-index over `max_distance + 1` hash slices: two hashes within the
/// distance must agree exactly on at least one slice.
pub fn group_near_duplicates(fingerprints: &[Fingerprint], max_distance: u32) -> Vec<Vec<usize>> {
    let mut sets = DisjointSet::new(fingerprints.len());

    let mut by_content: HashMap<[u8; 32], usize> = HashMap::new();
    for (index, fingerprint) in fingerprints.iter().enumerate() {
        match by_content.get(&fingerprint.content) {
            Some(&first) => sets.union(first, index),
            None => {
                by_content.insert(fingerprint.content, index);
            }
        }
    }

    if max_distance >= PERCEPTUAL_BITS {
        for index in 1..fingerprints.len() {
            sets.union(0, index);
        }
    } else {
        let slices = max_distance + 1;
        for slice in 0..slices {
            let start = slice * PERCEPTUAL_BITS / slices;
            let end = (slice + 1) * PERCEPTUAL_BITS / slices;
            let width = end - start;
            let mask = if width == PERCEPTUAL_BITS {
                u64::MAX
            } else {
                (1u64 << width) - 1
            };

            let mut buckets: HashMap<u64, Vec<usize>> = HashMap::new();
            for (index, fingerprint) in fingerprints.iter().enumerate() {
                buckets
                    .entry((fingerprint.perceptual >> start) & mask)
                    .or_default()
                    .push(index);
            }

            for members in buckets.values().filter(|m| m.len() > 1) {
                for (i, &a) in members.iter().enumerate() {
                    for &b in &members[i + 1..] {
                        if fingerprints[a].distance(&fingerprints[b]) <= max_distance {
                            sets.union(a, b);
                        }
                    }
                }
            }
        }
    }

    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut group_of_root: HashMap<usize, usize> = HashMap::new();
    for index in 0..fingerprints.len() {
        let root = sets.find(index);
        let slot = *group_of_root.entry(root).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(index);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};

    fn fp(content: u8, perceptual: u64) -> Fingerprint {
        Fingerprint::new([content; 32], perceptual)
    }

    fn gradient(width: u32, height: u32, invert: bool) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, _| {
            let v = (x * 255 / width.max(1)) as u8;
            let v = if invert { 255 - v } else { v };
            Rgb([v, v, v])
        }))
    }

    #[test]
    fn test_max_distance_for_similarity() {
        assert_eq!(max_distance_for(1.0), 0);
        assert_eq!(max_distance_for(0.95), 3);
        assert_eq!(max_distance_for(0.85), 9);
        assert_eq!(max_distance_for(0.0), 64);
        assert_eq!(max_distance_for(2.0), 0, "Similarity is clamped to [0, 1]");
    }

    #[test]
    fn test_difference_hash_survives_resizing() {
        let small = difference_hash(&gradient(90, 80, false));
        let large = difference_hash(&gradient(360, 320, false));
        assert!(
            (small ^ large).count_ones() <= 3,
            "Resized copies should be near duplicates"
        );

        let inverted = difference_hash(&gradient(90, 80, true));
        assert!(
            (small ^ inverted).count_ones() > 32,
            "Inverted gradient should be far away"
        );
    }

    #[test]
    fn test_content_hash_depends_on_bytes() {
        let image = gradient(18, 16, false);
        let a = Fingerprint::of_image(b"first", &image);
        let b = Fingerprint::of_image(b"second", &image);
        assert_ne!(a.content, b.content);
        assert_eq!(a.perceptual, b.perceptual);
        assert_eq!(a.content_hex().len(), 64);
    }

    #[test]
    fn test_groups_exact_content_duplicates() {
        let fingerprints = vec![fp(1, 0), fp(2, u64::MAX), fp(1, 0x0F0F)];
        let groups = group_near_duplicates(&fingerprints, 0);
        assert_eq!(groups, vec![vec![0, 2], vec![1]]);
    }

    #[test]
    fn test_groups_near_duplicates_transitively() {
        // a~b (2 bits) and b~c (2 bits) but a-c differ by 4 bits
        let fingerprints = vec![fp(1, 0b0000), fp(2, 0b0011), fp(3, 0b1111), fp(4, u64::MAX)];
        let groups = group_near_duplicates(&fingerprints, 2);
        assert_eq!(groups, vec![vec![0, 1, 2], vec![3]]);
    }

    #[test]
    fn test_distinct_hashes_stay_apart() {
        let fingerprints = vec![
            fp(1, 0x0123_4567_89AB_CDEF),
            fp(2, 0xFEDC_BA98_7654_3210),
            fp(3, 0x0F0F_0F0F_0F0F_0F0F),
        ];
        let groups = group_near_duplicates(&fingerprints, 3);
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn test_full_distance_groups_everything() {
        let fingerprints = vec![fp(1, 0), fp(2, u64::MAX)];
        assert_eq!(group_near_duplicates(&fingerprints, 64), vec![vec![0, 1]]);
    }
}
