//! Cross-chunk boundary search used by `read_until` (§4.2 "Boundary-scan algorithm").
//!
//! A plain `chunk.find(boundary)` per received chunk misses boundaries that straddle two
//! chunks, so candidate partial matches ("intersections") are carried from one chunk to
//! the next, together with the bytes that might still turn out to be part of the
//! boundary ("held back").

/// Outcome of feeding one chunk into the scan.
pub struct FeedOutcome {
    /// Bytes confirmed not to be part of the boundary; forward these to the consumer.
    pub released: Vec<u8>,
    /// If the boundary was found, how many bytes of the fed chunk it consumed
    /// (i.e. the new chunk offset to resume from).
    pub matched_at: Option<usize>,
}

pub struct BoundaryScan {
    boundary: Vec<u8>,
    /// Candidate boundary-prefix lengths matched at the tail of `held_back`, longest first
    /// (tie-break: "the first, longest-established, wins").
    intersection_sizes: Vec<usize>,
    held_back: Vec<u8>,
}

impl BoundaryScan {
    pub fn new(boundary: Vec<u8>) -> Self {
        assert!(!boundary.is_empty(), "read_until boundary must not be empty");
        Self { boundary, intersection_sizes: Vec::new(), held_back: Vec::new() }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> FeedOutcome {
        let blen = self.boundary.len();
        let mut released = Vec::new();

        if !self.intersection_sizes.is_empty() {
            // Step 1: finish intersections.
            for &k in &self.intersection_sizes.clone() {
                let need = blen - k;
                if chunk.len() >= need && chunk[..need] == self.boundary[k..] {
                    let keep = self.held_back.len().saturating_sub(k);
                    released.extend_from_slice(&self.held_back[..keep]);
                    self.held_back.clear();
                    self.intersection_sizes.clear();
                    return FeedOutcome { released, matched_at: Some(need) };
                }
            }

            // Step 2: continue intersections (chunk too short to complete any candidate).
            let mut survivors = Vec::new();
            for &k in &self.intersection_sizes {
                let need = blen - k;
                if chunk.len() < need && self.boundary[k..k + chunk.len()] == *chunk {
                    survivors.push(k + chunk.len());
                }
            }
            if !survivors.is_empty() {
                self.held_back.extend_from_slice(chunk);
                survivors.sort_unstable_by(|a, b| b.cmp(a));
                self.intersection_sizes = survivors;
                return FeedOutcome { released, matched_at: None };
            }

            // All candidates died: the withheld bytes are definitely not the boundary.
            released.extend_from_slice(&self.held_back);
            self.held_back.clear();
            self.intersection_sizes.clear();
        }

        // Step 3: new-start scan.
        if let Some(pos) = find_subslice(chunk, &self.boundary) {
            released.extend_from_slice(&chunk[..pos]);
            return FeedOutcome { released, matched_at: Some(pos + blen) };
        }

        let max_check = blen.saturating_sub(1).min(chunk.len());
        let mut matches = Vec::new();
        for len in 1..=max_check {
            if chunk[chunk.len() - len..] == self.boundary[..len] {
                matches.push(len);
            }
        }

        match matches.iter().max().copied() {
            Some(max_len) => {
                released.extend_from_slice(&chunk[..chunk.len() - max_len]);
                self.held_back.extend_from_slice(&chunk[chunk.len() - max_len..]);
                matches.sort_unstable_by(|a, b| b.cmp(a));
                self.intersection_sizes = matches;
                FeedOutcome { released, matched_at: None }
            }
            None => {
                released.extend_from_slice(chunk);
                FeedOutcome { released, matched_at: None }
            }
        }
    }

    /// EOF with a live candidate means the held-back bytes were never confirmed as the
    /// boundary; the caller folds them back in as unconsumed leftover.
    pub fn take_held_back(&mut self) -> Vec<u8> {
        self.intersection_sizes.clear();
        std::mem::take(&mut self.held_back)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
