use indexmap::IndexMap;
use serde::Serialize;

pub const DEFAULT_MODEL: &str = "sense-chat-pro";
const OWNED_BY: &str = "sensetime";

/// Client-facing model names and how they map onto upstream model ids.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    mapping: IndexMap<String, String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

fn split_wildcard(pattern: &str) -> Option<(&str, &str)> {
    let mut parts = pattern.split('*');
    let prefix = parts.next()?;
    let suffix = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((prefix, suffix))
}

/// Captured `*` part of `name` for a single-wildcard `pattern`.
fn capture<'a>(pattern: &str, name: &'a str) -> Option<&'a str> {
    let (prefix, suffix) = split_wildcard(pattern)?;
    if name.len() < prefix.len() + suffix.len() {
        return None;
    }
    name.strip_prefix(prefix)?.strip_suffix(suffix)
}

impl ModelCatalog {
    pub fn new(mapping: IndexMap<String, String>) -> Self {
        Self { mapping }
    }

    /// Upstream model id for a requested name. Exact aliases win, then the
    /// most specific wildcard alias; unknown names pass through unchanged.
    pub fn resolve(&self, requested: &str) -> String {
        // Patterns are not model names; never expand one into another pattern.
        if requested.contains('*') {
            return requested.to_string();
        }
        if let Some(target) = self.mapping.get(requested) {
            return target.clone();
        }

        let best = self
            .mapping
            .iter()
            .filter_map(|(pattern, target)| {
                let captured = capture(pattern, requested)?;
                let specificity = pattern.len() - 1;
                Some((specificity, pattern.as_str(), target.as_str(), captured))
            })
            // Ties broken by pattern text, not declaration order.
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(a.1)));

        match best {
            Some((_, _, target, captured)) if target.contains('*') => {
                target.replacen('*', captured, 1)
            }
            Some((_, _, target, _)) => target.to_string(),
            None => requested.to_string(),
        }
    }

    /// Default model first, then concrete aliases in declaration order.
    /// Wildcard patterns are not model ids and stay unlisted.
    pub fn model_ids(&self) -> Vec<String> {
        std::iter::once(DEFAULT_MODEL)
            .chain(
                self.mapping
                    .keys()
                    .map(String::as_str)
                    .filter(|id| *id != DEFAULT_MODEL && !id.contains('*')),
            )
            .map(str::to_string)
            .collect()
    }

    pub fn list(&self, created: u64) -> ModelList {
        ModelList {
            object: "list",
            data: self
                .model_ids()
                .into_iter()
                .map(|id| ModelEntry {
                    id,
                    object: "model",
                    created,
                    owned_by: OWNED_BY,
                })
                .collect(),
        }
    }
}
