//! Banded locality-sensitive hashing over binary fingerprints.
//!
//! A fingerprint is cut into `bands` contiguous bit ranges. Two photos become
//! candidates when any band matches exactly, which for 64-bit fingerprints in
//! 8 bands catches every pair within 7 bits of each other.

use crate::core::hash::Fingerprint;
use std::collections::{BTreeSet, HashMap};

pub struct LshIndex {
    bands: usize,
    tables: Vec<HashMap<u64, BTreeSet<String>>>,
    signatures: HashMap<String, Vec<u64>>,
}

impl LshIndex {
    pub fn new(bands: usize) -> Self {
        let bands = bands.max(1);
        Self {
            bands,
            tables: vec![HashMap::new(); bands],
            signatures: HashMap::new(),
        }
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn insert(&mut self, id: &str, fingerprint: &Fingerprint) {
        self.remove(id);
        let signature = self.signature(fingerprint);
        for (table, key) in self.tables.iter_mut().zip(&signature) {
            table.entry(*key).or_default().insert(id.to_string());
        }
        self.signatures.insert(id.to_string(), signature);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let Some(signature) = self.signatures.remove(id) else {
            return false;
        };
        for (table, key) in self.tables.iter_mut().zip(&signature) {
            if let Some(bucket) = table.get_mut(key) {
                bucket.remove(id);
                if bucket.is_empty() {
                    table.remove(key);
                }
            }
        }
        true
    }

    /// Ids sharing at least one band with `id`, excluding `id`, sorted.
    pub fn candidates(&self, id: &str) -> Vec<String> {
        let Some(signature) = self.signatures.get(id) else {
            return Vec::new();
        };
        self.collect(signature, Some(id))
    }

    pub fn clear(&mut self) {
        self.tables.iter_mut().for_each(HashMap::clear);
        self.signatures.clear();
    }

    fn signature(&self, fingerprint: &Fingerprint) -> Vec<u64> {
        let width = fingerprint.len().div_ceil(self.bands).max(1);
        (0..self.bands)
            .map(|band| fingerprint.band(band * width, width))
            .collect()
    }

    fn collect(&self, signature: &[u64], exclude: Option<&str>) -> Vec<String> {
        let mut found = BTreeSet::new();
        for (table, key) in self.tables.iter().zip(signature) {
            if let Some(bucket) = table.get(key) {
                found.extend(bucket.iter().filter(|id| Some(id.as_str()) != exclude).cloned());
            }
        }
        found.into_iter().collect()
    }
}
