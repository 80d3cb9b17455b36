//! Ranked full-text index over cached tool schemas.
//!
//! Documents are tools; the text is the tool name plus its description,
//! tokenized on non-alphanumerics and camelCase boundaries. Scoring is plain
//! BM25 (k1 = 1.2, b = 0.75). The index is immutable once built — the
//! tool-search mode rebuilds it wholesale whenever the schema cache changes,
//! which keeps queries over a few thousand tools comfortably sub-millisecond.

use std::collections::HashMap;

use mcp_types::Tool;

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

/// One searchable tool, carrying everything `discover` needs to render a hit.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedTool {
    /// Host-visible name (`<server>__<tool>` when prefixing applies).
    pub exposed_name: String,
    pub original_name: String,
    pub server: String,
    pub tool: Tool,
}

#[derive(Debug, Clone)]
pub struct SearchHit<'a> {
    pub tool: &'a IndexedTool,
    pub score: f32,
}

#[derive(Default)]
pub struct SearchIndex {
    docs: Vec<IndexedTool>,
    doc_len: Vec<f32>,
    avg_doc_len: f32,
    /// term -> (doc index, term frequency)
    postings: HashMap<String, Vec<(u32, u32)>>,
}

impl SearchIndex {
    pub fn build(docs: Vec<IndexedTool>) -> Self {
        let mut postings: HashMap<String, Vec<(u32, u32)>> = HashMap::new();
        let mut doc_len = Vec::with_capacity(docs.len());

        for (doc_id, doc) in docs.iter().enumerate() {
            let description = doc.tool.description.as_deref().unwrap_or("");
            let text = format!("{} {description}", doc.original_name);
            let tokens = tokenize(&text);
            doc_len.push(tokens.len() as f32);

            let mut term_freq: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *term_freq.entry(token).or_insert(0) += 1;
            }
            for (term, tf) in term_freq {
                postings.entry(term).or_default().push((doc_id as u32, tf));
            }
        }

        let avg_doc_len = if doc_len.is_empty() {
            0.0
        } else {
            doc_len.iter().sum::<f32>() / doc_len.len() as f32
        };

        SearchIndex {
            docs,
            doc_len,
            avg_doc_len,
            postings,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn tools(&self) -> &[IndexedTool] {
        &self.docs
    }

    /// Exact exposed-name lookup, used by `execute` before falling back to
    /// fuzzier resolution.
    pub fn find(&self, exposed_name: &str) -> Option<&IndexedTool> {
        self.docs.iter().find(|d| d.exposed_name == exposed_name)
    }

    /// Top `limit` tools for `query`, ordered by descending BM25 score.
    /// Tools that match no query term are not returned.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit<'_>> {
        let terms = tokenize(query);
        if terms.is_empty() || self.docs.is_empty() {
            return Vec::new();
        }

        let doc_count = self.docs.len() as f32;
        let mut scores: HashMap<u32, f32> = HashMap::new();

        for term in terms {
            let Some(posting) = self.postings.get(&term) else {
                continue;
            };
            let df = posting.len() as f32;
            let idf = ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln();
            for &(doc_id, tf) in posting {
                let tf = tf as f32;
                let len_norm = 1.0 - BM25_B + BM25_B * self.doc_len[doc_id as usize] / self.avg_doc_len;
                let score = idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * len_norm);
                *scores.entry(doc_id).or_insert(0.0) += score;
            }
        }

        let mut ranked: Vec<(u32, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked
            .into_iter()
            .take(limit)
            .map(|(doc_id, score)| SearchHit {
                tool: &self.docs[doc_id as usize],
                score,
            })
            .collect()
    }
}

/// Lowercased terms split on non-alphanumerics and on camelCase boundaries,
/// so `createKVNamespace` yields `create`, `kv`, `namespace`.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let mut current = String::new();
        let chars: Vec<char> = word.chars().collect();
        for (i, &c) in chars.iter().enumerate() {
            let prev = i.checked_sub(1).map(|j| chars[j]);
            let next = chars.get(i + 1);
            let boundary = match prev {
                Some(p) => {
                    // aB  -> split before B; ABc -> split before Bc
                    (p.is_lowercase() && c.is_uppercase())
                        || (p.is_uppercase()
                            && c.is_uppercase()
                            && next.is_some_and(|n| n.is_lowercase()))
                        || (p.is_alphabetic() && c.is_numeric())
                        || (p.is_numeric() && c.is_alphabetic())
                }
                None => false,
            };
            if boundary && !current.is_empty() {
                tokens.push(current.to_lowercase());
                current = String::new();
            }
            current.push(c);
        }
        if !current.is_empty() {
            tokens.push(current.to_lowercase());
        }
    }
    tokens
}
