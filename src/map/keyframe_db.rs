//! KeyframeDatabase - lightweight place recognition index.
//!
//! Backed in a full deployment by a visual vocabulary and an inverted index;
//! here we keep the small subset the rest of the system needs:
//! - add / erase keyframes with a bag-of-words vector
//! - retrieve candidate keyframes for a query vector
//!
//! Scoring is a plain dot product between sparse histograms and can be
//! upgraded without touching the callers. Every keyframe inserted into the
//! map - including those re-inserted during map reconstruction - must be
//! registered here so place-recognition queries see the whole map.

use std::collections::HashMap;

use crate::features::DenseMatrix;

use super::types::KeyframeId;

/// Bag-of-words vector: word id -> weight.
pub type BowVector = HashMap<u32, f64>;

/// Quantize a descriptor block into a bag-of-words vector.
///
/// Stand-in quantization until a trained vocabulary transform is wired in:
/// each descriptor row contributes its leading two bytes as a word id. The
/// resulting histogram is L1-normalized.
pub fn bow_from_descriptors(descriptors: &DenseMatrix) -> BowVector {
    let mut bow = BowVector::new();
    for row in 0..descriptors.rows() {
        if let Some(bytes) = descriptors.row_bytes(row) {
            if bytes.len() >= 2 {
                let word = bytes[0] as u32 | (bytes[1] as u32) << 8;
                *bow.entry(word).or_insert(0.0) += 1.0;
            }
        }
    }
    let total: f64 = bow.values().sum();
    if total > 0.0 {
        for w in bow.values_mut() {
            *w /= total;
        }
    }
    bow
}

/// Candidate keyframe with similarity score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub keyframe_id: KeyframeId,
    pub score: f64,
}

/// Keyframe lookup index for place recognition.
pub struct KeyframeDatabase {
    entries: HashMap<KeyframeId, BowVector>,
}

impl KeyframeDatabase {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Add or update a keyframe entry. Idempotent per keyframe.
    pub fn add(&mut self, kf_id: KeyframeId, bow: BowVector) {
        self.entries.insert(kf_id, bow);
    }

    /// Remove a keyframe from the index.
    pub fn erase(&mut self, kf_id: KeyframeId) {
        self.entries.remove(&kf_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Candidate keyframes similar to the query, best first.
    ///
    /// `exclude` filters out the querying keyframe itself.
    pub fn detect_candidates(
        &self,
        query: &BowVector,
        exclude: Option<KeyframeId>,
        max_results: usize,
    ) -> Vec<Candidate> {
        let mut cands = Vec::new();

        for (kf_id, bow) in &self.entries {
            if Some(*kf_id) == exclude {
                continue;
            }
            let mut score = 0.0;
            for (word_id, weight) in query {
                if let Some(other_w) = bow.get(word_id) {
                    score += weight * other_w;
                }
            }
            if score > 0.0 {
                cands.push(Candidate {
                    keyframe_id: *kf_id,
                    score,
                });
            }
        }

        cands.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.keyframe_id.cmp(&b.keyframe_id))
        });
        cands.truncate(max_results);
        cands
    }
}

impl Default for KeyframeDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bow(words: &[(u32, f64)]) -> BowVector {
        words.iter().copied().collect()
    }

    #[test]
    fn test_detect_candidates_scores_and_sorts() {
        let mut db = KeyframeDatabase::new();
        db.add(KeyframeId::new(1), bow(&[(10, 1.0), (20, 0.5)]));
        db.add(KeyframeId::new(2), bow(&[(10, 0.2)]));
        db.add(KeyframeId::new(3), bow(&[(99, 1.0)]));

        let query = bow(&[(10, 1.0)]);
        let cands = db.detect_candidates(&query, None, 10);

        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].keyframe_id, KeyframeId::new(1));
        assert_eq!(cands[1].keyframe_id, KeyframeId::new(2));
    }

    #[test]
    fn test_detect_candidates_excludes_query_keyframe() {
        let mut db = KeyframeDatabase::new();
        db.add(KeyframeId::new(1), bow(&[(10, 1.0)]));
        db.add(KeyframeId::new(2), bow(&[(10, 1.0)]));

        let cands = db.detect_candidates(&bow(&[(10, 1.0)]), Some(KeyframeId::new(1)), 10);
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].keyframe_id, KeyframeId::new(2));
    }

    #[test]
    fn test_bow_from_descriptors_is_normalized() {
        let rows = vec![vec![1u8; 32], vec![1u8; 32], vec![2u8; 32]];
        let desc = DenseMatrix::from_u8_rows(&rows, 32);
        let bow = bow_from_descriptors(&desc);

        let total: f64 = bow.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(bow.len(), 2);
    }

    #[test]
    fn test_erase() {
        let mut db = KeyframeDatabase::new();
        db.add(KeyframeId::new(1), bow(&[(10, 1.0)]));
        db.erase(KeyframeId::new(1));
        assert!(db.is_empty());
    }
}
