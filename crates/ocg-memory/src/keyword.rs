//! In-memory inverted keyword index with BM25 scoring.
//!
//! Rebuilt from the SQL rows at startup; kept in step with the store on every
//! write. Tokenisation is lowercase alphanumeric runs — the same projection
//! is applied to stored content and queries.

use std::collections::HashMap;

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

#[derive(Default)]
pub struct KeywordIndex {
    /// term → (doc id → term frequency)
    postings: HashMap<String, HashMap<i64, u32>>,
    /// doc id → token count
    doc_len: HashMap<i64, u32>,
    total_len: u64,
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: i64, text: &str) {
        self.remove(id);
        let tokens = tokenize(text);
        self.total_len += tokens.len() as u64;
        self.doc_len.insert(id, tokens.len() as u32);
        for token in tokens {
            *self.postings.entry(token).or_default().entry(id).or_insert(0) += 1;
        }
    }

    pub fn remove(&mut self, id: i64) {
        let Some(len) = self.doc_len.remove(&id) else {
            return;
        };
        self.total_len -= len as u64;
        self.postings.retain(|_, docs| {
            docs.remove(&id);
            !docs.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.doc_len.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_len.is_empty()
    }

    /// Top-`k` documents by BM25 score, best first. Raw scores — the hybrid
    /// blend normalizes against the best hit.
    pub fn search(&self, query: &str, k: usize) -> Vec<(i64, f32)> {
        let n = self.doc_len.len() as f32;
        if n == 0.0 {
            return Vec::new();
        }
        let avgdl = self.total_len as f32 / n;

        let mut scores: HashMap<i64, f32> = HashMap::new();
        for term in tokenize(query) {
            let Some(docs) = self.postings.get(&term) else {
                continue;
            };
            let df = docs.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (&id, &tf) in docs {
                let dl = *self.doc_len.get(&id).unwrap_or(&1) as f32;
                let tf = tf as f32;
                let score =
                    idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl));
                *scores.entry(id).or_insert(0.0) += score;
            }
        }

        let mut out: Vec<(i64, f32)> = scores.into_iter().collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(k);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_lowercases_and_splits() {
        assert_eq!(tokenize("The Quick-Brown fox!"), vec!["the", "quick", "brown", "fox"]);
    }

    #[test]
    fn matching_doc_outranks_non_matching() {
        let mut idx = KeywordIndex::new();
        idx.add(1, "the quick brown fox");
        idx.add(2, "lazy dog in the sun");

        let hits = idx.search("quick fox", 2);
        assert_eq!(hits[0].0, 1);
        assert!(hits.iter().all(|(id, _)| *id != 2) || hits[0].1 > hits[1].1);
    }

    #[test]
    fn remove_unindexes_document() {
        let mut idx = KeywordIndex::new();
        idx.add(1, "alpha beta");
        idx.remove(1);
        assert!(idx.search("alpha", 5).is_empty());
        assert!(idx.is_empty());
    }

    #[test]
    fn re_add_replaces_old_content() {
        let mut idx = KeywordIndex::new();
        idx.add(1, "alpha beta");
        idx.add(1, "gamma delta");
        assert!(idx.search("alpha", 5).is_empty());
        assert_eq!(idx.search("gamma", 5)[0].0, 1);
    }
}
