//! Run-descriptor parsing, canonicalization, and token-subset matching.
//!
//! A run descriptor identifies a requested benchmark computation by a
//! namespace plus key/value parameters, e.g.
//! `"mmlu:subject=philosophy,model=openai/gpt2"`. On-disk run directories
//! are named with the same syntax, but the producer may inject extra
//! default tokens and normalize identifiers, so matching is a token-subset
//! test rather than a string comparison.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("run descriptor must contain ':' separating namespace and parameters: {0:?}")]
    MissingSeparator(String),
    #[error("run descriptor has an empty namespace: {0:?}")]
    EmptyNamespace(String),
}

/// A single parameter value in a run descriptor: either free-form text or a
/// bare flag token with no `=`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenValue {
    Text(String),
    Flag(bool),
}

/// Parsed form of a run descriptor string. Token order is preserved from the
/// input; the descriptor is not mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDescriptor {
    pub namespace: String,
    pub tokens: Vec<(String, TokenValue)>,
}

impl RunDescriptor {
    /// Parse a descriptor string of the form `"<namespace>:<k=v,...>"`.
    ///
    /// Each parameter is split on the first `=`; values may contain further
    /// `=` or `:` characters (e.g. model ids with version suffixes like
    /// `amazon_nova-premier-v1:0`). A parameter without `=` is stored as a
    /// flag. Empty parameter segments are skipped.
    pub fn parse(desc: &str) -> Result<Self, DescriptorError> {
        let (namespace, rest) = desc
            .split_once(':')
            .ok_or_else(|| DescriptorError::MissingSeparator(desc.to_string()))?;
        let namespace = namespace.trim();
        if namespace.is_empty() {
            return Err(DescriptorError::EmptyNamespace(desc.to_string()));
        }
        let mut tokens = Vec::new();
        for part in rest.trim().split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((key, value)) => {
                    tokens.push((key.trim().to_string(), TokenValue::Text(value.trim().to_string())));
                }
                None => {
                    tokens.push((part.to_string(), TokenValue::Flag(true)));
                }
            }
        }
        Ok(Self {
            namespace: namespace.to_string(),
            tokens,
        })
    }

    pub fn token(&self, key: &str) -> Option<&TokenValue> {
        self.tokens.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Apply the known producer-side naming normalizations.
    ///
    /// Currently a single rule: a `model` token has `/` replaced with `_`,
    /// matching how hierarchical model ids become flat directory-name-safe
    /// tokens (`openai/gpt2` -> `openai_gpt2`). Idempotent; no other token
    /// is renamed.
    pub fn canonicalized(&self) -> Self {
        let tokens = self
            .tokens
            .iter()
            .map(|(k, v)| match (k.as_str(), v) {
                ("model", TokenValue::Text(s)) => {
                    (k.clone(), TokenValue::Text(s.replace('/', "_")))
                }
                _ => (k.clone(), v.clone()),
            })
            .collect();
        Self {
            namespace: self.namespace.clone(),
            tokens,
        }
    }

    /// Render each token the way it appears in an on-disk run directory
    /// name: `key=value`, or bare `key` for flags.
    pub fn rendered_tokens(&self) -> Vec<String> {
        self.tokens
            .iter()
            .map(|(k, v)| match v {
                TokenValue::Text(s) => format!("{}={}", k, s),
                TokenValue::Flag(_) => k.clone(),
            })
            .collect()
    }
}

/// Split a run directory basename into its namespace and raw token strings.
///
/// Returns `None` when the name does not contain the namespace separator,
/// i.e. the directory is not a run directory at all.
pub fn split_run_name(name: &str) -> Option<(&str, Vec<&str>)> {
    let (namespace, rest) = name.split_once(':')?;
    let tokens = rest
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    Some((namespace.trim(), tokens))
}

/// A request prepared for matching: the raw descriptor text plus the
/// canonicalized descriptor and its rendered required-token set.
///
/// Parsing and canonicalization happen once here; every candidate
/// comparison afterwards is a cheap set test.
#[derive(Debug, Clone)]
pub struct RunQuery {
    raw: String,
    descriptor: RunDescriptor,
    required: BTreeSet<String>,
}

impl RunQuery {
    pub fn new(desc: &str) -> Result<Self, DescriptorError> {
        let descriptor = RunDescriptor::parse(desc)?.canonicalized();
        let required = descriptor.rendered_tokens().into_iter().collect();
        Ok(Self {
            raw: desc.to_string(),
            descriptor,
            required,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn namespace(&self) -> &str {
        &self.descriptor.namespace
    }

    pub fn descriptor(&self) -> &RunDescriptor {
        &self.descriptor
    }

    /// Token-subset eligibility test against a candidate run directory name.
    ///
    /// The candidate namespace must equal the requested namespace and every
    /// required token must appear verbatim in the candidate's token list.
    /// Extra candidate tokens (producer-injected defaults) never disqualify.
    pub fn matches_run_name(&self, name: &str) -> bool {
        let Some((namespace, tokens)) = split_run_name(name) else {
            return false;
        };
        if namespace != self.descriptor.namespace {
            return false;
        }
        let candidate: BTreeSet<&str> = tokens.into_iter().collect();
        self.required.iter().all(|t| candidate.contains(t.as_str()))
    }

    /// Deterministic score for ranking eligible candidates; lower is better.
    ///
    /// An exact full-string match to the requested text ranks first, then
    /// fewer extra (unrequested) tokens, then lexicographic on the full
    /// candidate name as a stable tie-break.
    pub fn score(&self, name: &str) -> (u8, usize, String) {
        if name == self.raw {
            return (0, 0, name.to_string());
        }
        let extras = match split_run_name(name) {
            Some((_, tokens)) => tokens
                .into_iter()
                .filter(|t| !self.required.contains(*t))
                .count(),
            None => usize::MAX,
        };
        (1, extras, name.to_string())
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write bytes via a temp file + rename so readers never observe a
/// partially written file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_namespace_and_tokens() {
        let desc = RunDescriptor::parse("mmlu:subject=philosophy,model=openai/gpt2")
            .expect("valid descriptor");
        assert_eq!(desc.namespace, "mmlu");
        assert_eq!(
            desc.token("subject"),
            Some(&TokenValue::Text("philosophy".to_string()))
        );
        assert_eq!(
            desc.token("model"),
            Some(&TokenValue::Text("openai/gpt2".to_string()))
        );
    }

    #[test]
    fn parse_keeps_colons_and_equals_inside_values() {
        let desc = RunDescriptor::parse("ifeval:model=amazon_nova-premier-v1:0")
            .expect("valid descriptor");
        assert_eq!(desc.namespace, "ifeval");
        assert_eq!(
            desc.token("model"),
            Some(&TokenValue::Text("amazon_nova-premier-v1:0".to_string()))
        );

        let desc = RunDescriptor::parse("bench:opt=a=b").expect("valid descriptor");
        assert_eq!(desc.token("opt"), Some(&TokenValue::Text("a=b".to_string())));
    }

    #[test]
    fn parse_stores_bare_tokens_as_flags() {
        let desc = RunDescriptor::parse("bench:model=m,verbose").expect("valid descriptor");
        assert_eq!(desc.token("verbose"), Some(&TokenValue::Flag(true)));
        assert_eq!(desc.rendered_tokens(), vec!["model=m", "verbose"]);
    }

    #[test]
    fn parse_rejects_missing_separator_and_empty_namespace() {
        assert!(matches!(
            RunDescriptor::parse("no_separator_here"),
            Err(DescriptorError::MissingSeparator(_))
        ));
        assert!(matches!(
            RunDescriptor::parse(":model=m"),
            Err(DescriptorError::EmptyNamespace(_))
        ));
    }

    #[test]
    fn canonicalize_flattens_model_path_separators() {
        let desc = RunDescriptor::parse("mmlu:subject=philosophy,model=openai/gpt2")
            .expect("valid descriptor");
        let canon = desc.canonicalized();
        assert_eq!(
            canon.token("model"),
            Some(&TokenValue::Text("openai_gpt2".to_string()))
        );
        assert_eq!(
            canon.token("subject"),
            Some(&TokenValue::Text("philosophy".to_string()))
        );
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let desc = RunDescriptor::parse("mmlu:model=openai/gpt2").expect("valid descriptor");
        let once = desc.canonicalized();
        let twice = once.canonicalized();
        assert_eq!(once, twice);
    }

    #[test]
    fn split_run_name_requires_separator() {
        let (namespace, tokens) =
            split_run_name("mmlu:subject=philosophy,method=multiple_choice_joint")
                .expect("run name");
        assert_eq!(namespace, "mmlu");
        assert_eq!(tokens, vec!["subject=philosophy", "method=multiple_choice_joint"]);
        assert!(split_run_name("not_a_run_dir").is_none());
    }

    #[test]
    fn subset_match_allows_extra_candidate_tokens() {
        let query = RunQuery::new("mmlu:subject=philosophy,model=openai/gpt2")
            .expect("valid descriptor");
        assert!(query.matches_run_name(
            "mmlu:subject=philosophy,method=multiple_choice_joint,model=openai_gpt2"
        ));
    }

    #[test]
    fn subset_match_rejects_missing_required_token() {
        let query = RunQuery::new("mmlu:subject=philosophy,model=openai/gpt2")
            .expect("valid descriptor");
        assert!(!query.matches_run_name(
            "mmlu:subject=anatomy,method=multiple_choice_joint,model=openai_gpt2"
        ));
    }

    #[test]
    fn subset_match_rejects_different_namespace() {
        let query = RunQuery::new("mmlu:subject=philosophy,model=openai/gpt2")
            .expect("valid descriptor");
        assert!(!query.matches_run_name("ifeval:model=openai_gpt2"));
    }

    #[test]
    fn score_prefers_fewer_extra_tokens() {
        let query = RunQuery::new("mmlu:subject=philosophy,model=openai/gpt2")
            .expect("valid descriptor");
        let a = "mmlu:subject=philosophy,model=openai_gpt2";
        let b = "mmlu:subject=philosophy,method=multiple_choice_joint,model=openai_gpt2";
        assert!(query.score(a) < query.score(b));
    }

    #[test]
    fn score_ranks_exact_text_match_first() {
        let query = RunQuery::new("mmlu:subject=philosophy,model=openai_gpt2")
            .expect("valid descriptor");
        let exact = query.score("mmlu:subject=philosophy,model=openai_gpt2");
        let other = query.score("mmlu:model=openai_gpt2,subject=philosophy");
        assert_eq!(exact.0, 0);
        assert!(exact < other);
    }

    #[test]
    fn score_tie_breaks_lexicographically() {
        let query = RunQuery::new("mmlu:model=openai/gpt2").expect("valid descriptor");
        let a = "mmlu:method=aaa,model=openai_gpt2";
        let b = "mmlu:method=bbb,model=openai_gpt2";
        assert!(query.score(a) < query.score(b));
        // Stable across repeated computations.
        assert_eq!(query.score(a), query.score(a));
    }

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let root = std::env::temp_dir().join(format!(
            "helmcache_core_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let target = root.join("nested").join("out.json");
        atomic_write_bytes(&target, b"first").expect("first write");
        atomic_write_bytes(&target, b"second").expect("second write");
        let data = fs::read_to_string(&target).expect("read back");
        assert_eq!(data, "second");
        let _ = fs::remove_dir_all(root);
    }
}
