use crate::constants::FALLBACK_PATH_VALUE;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static VAR: OnceLock<Regex> = OnceLock::new();
    VAR.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").expect("static regex")
    })
}

fn split_kv(entry: &str) -> Option<(&str, &str)> {
    match entry.split_once('=') {
        Some((k, v)) if !k.is_empty() => Some((k, v)),
        _ => None,
    }
}

/// Expand `${VAR}` and `$VAR` in one pass against the base environment
fn substitute(value: &str, original: &HashMap<&str, &str>) -> String {
    if !value.contains('$') {
        return value.to_string();
    }
    placeholder()
        .replace_all(value, |caps: &Captures| {
            let (name, braced) = match caps.get(1) {
                Some(m) => (m.as_str(), true),
                None => (&caps[2], false),
            };
            match original.get(name) {
                Some(v) => v.to_string(),
                None if braced && name == "PATH" => FALLBACK_PATH_VALUE.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Apply `KEY=VALUE` overrides to an image environment.
///
/// Existing keys keep their position, new keys are appended in the order
/// given. Placeholders refer to the environment before any override.
pub fn apply_env_overrides(existing: &[String], desired: &[String]) -> Vec<String> {
    let mut wanted: Vec<(&str, &str)> = Vec::new();
    for kv in desired {
        if let Some((k, v)) = split_kv(kv) {
            match wanted.iter_mut().find(|(name, _)| *name == k) {
                Some(slot) => slot.1 = v,
                None => wanted.push((k, v)),
            }
        }
    }
    if wanted.is_empty() {
        return existing.to_vec();
    }

    let original: HashMap<&str, &str> = existing.iter().filter_map(|e| split_kv(e)).collect();

    let mut out = Vec::with_capacity(existing.len() + wanted.len());
    let mut replaced: Vec<&str> = Vec::new();
    for entry in existing {
        match split_kv(entry).and_then(|(k, _)| wanted.iter().find(|(name, _)| *name == k)) {
            Some(&(k, v)) => {
                out.push(format!("{}={}", k, substitute(v, &original)));
                replaced.push(k);
            }
            None => out.push(entry.clone()),
        }
    }
    for (k, v) in &wanted {
        if !replaced.contains(k) {
            out.push(format!("{}={}", k, substitute(v, &original)));
        }
    }
    out
}
