//! Perceptual frame fingerprints for near-duplicate detection.
//!
//! Encoded frames (JPEG, PNG, ...) are decoded with `image` and hashed with
//! a 64-bit gradient hash from `image_hasher`, so two snapshots of the same
//! scene match even when the encoder produced payloads of different size.
//! Payloads that do not decode fall back to a 64-bucket average hash over
//! the raw bytes. Hashes of different kinds never match.
//!
//! Uniform frames all hash to zero, so a mean-brightness check is applied on
//! top of the Hamming distance.

use image::DynamicImage;
use image_hasher::{HashAlg, HasherConfig, ImageHash};

const BUCKETS: usize = 64;

/// Maximum difference of overall mean brightness between two near-identical
/// frames.
const MAX_MEAN_DELTA: u8 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Hash {
    Image(ImageHash),
    Raw { bits: u64, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    hash: Hash,
    mean: u8,
}

impl Fingerprint {
    /// Fingerprint an encoded frame, falling back to the raw bytes when the
    /// payload is not a decodable image.
    ///
    /// Decoding is CPU-bound; async callers go through
    /// [`Fingerprint::compute`].
    pub fn of(payload: &[u8]) -> Self {
        match image::load_from_memory(payload) {
            Ok(img) => Self::of_image(&img),
            Err(_) => Self::of_raw(payload),
        }
    }

    /// [`Fingerprint::of`] on the blocking pool.
    pub async fn compute(payload: std::sync::Arc<[u8]>) -> Self {
        let bytes = payload.clone();
        match tokio::task::spawn_blocking(move || Self::of(&bytes)).await {
            Ok(fingerprint) => fingerprint,
            Err(_) => Self::of_raw(&payload),
        }
    }

    fn of_image(img: &DynamicImage) -> Self {
        let hasher = HasherConfig::new()
            .hash_alg(HashAlg::Gradient)
            .hash_size(8, 8)
            .to_hasher();
        let thumb = img.thumbnail(32, 32).to_luma8();
        let pixels = thumb.as_raw();
        let mean = if pixels.is_empty() {
            0
        } else {
            pixels.iter().map(|&p| p as u64).sum::<u64>() / pixels.len() as u64
        };
        Self {
            hash: Hash::Image(hasher.hash_image(img)),
            mean: mean.min(u8::MAX as u64) as u8,
        }
    }

    /// Average hash over the raw payload: bit `i` is set when bucket `i`'s
    /// mean byte value is above the mean of all buckets.
    pub fn of_raw(payload: &[u8]) -> Self {
        let len = payload.len();
        let mut averages = [0u64; BUCKETS];
        if len > 0 {
            for (i, avg) in averages.iter_mut().enumerate() {
                let start = i * len / BUCKETS;
                let end = ((i + 1) * len / BUCKETS).max(start);
                let bucket = &payload[start..end];
                if !bucket.is_empty() {
                    let sum: u64 = bucket.iter().map(|&b| b as u64).sum();
                    *avg = sum / bucket.len() as u64;
                }
            }
        }
        let total: u64 = averages.iter().sum();
        let mean = total / BUCKETS as u64;
        let bits = averages
            .iter()
            .enumerate()
            .filter(|(_, avg)| **avg > mean)
            .fold(0u64, |acc, (i, _)| acc | (1 << i));
        Self {
            hash: Hash::Raw { bits, len },
            mean: mean.min(u8::MAX as u64) as u8,
        }
    }

    /// `true` when the frame decoded as an image.
    pub fn is_perceptual(&self) -> bool {
        matches!(self.hash, Hash::Image(_))
    }

    /// Hamming distance between the hashes; `None` when they are not
    /// comparable (different kinds, or raw payloads of different length).
    pub fn distance(&self, other: &Fingerprint) -> Option<u32> {
        match (&self.hash, &other.hash) {
            (Hash::Image(a), Hash::Image(b)) => Some(a.dist(b)),
            (Hash::Raw { bits: a, len: la }, Hash::Raw { bits: b, len: lb }) => {
                (la == lb).then(|| (a ^ b).count_ones())
            }
            _ => None,
        }
    }

    pub fn is_near(&self, other: &Fingerprint, max_distance: u32) -> bool {
        self.mean.abs_diff(other.mean) <= MAX_MEAN_DELTA
            && self.distance(other).is_some_and(|d| d <= max_distance)
    }
}
