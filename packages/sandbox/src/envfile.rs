// ABOUTME: Parse/merge/serialize for the agent env file inside an instance
// ABOUTME: Also hosts the per-instance lock registry guarding read-merge-write updates

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

/// Parse the `KEY="value"` line format written by setup and env updates.
///
/// Accepts an optional `export ` prefix, unquoted values, and `#` comments.
/// Lines that do not look like assignments are skipped with a warning so a
/// hand-edited file cannot wedge env updates.
pub fn parse_env_file(content: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

        let Some((key, value)) = line.split_once('=') else {
            warn!(line = %line, "skipping unparseable env file line");
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !is_valid_key(key) {
            warn!(line = %line, "skipping env file line with invalid key");
            continue;
        }
        vars.insert(key.to_string(), unquote(value.trim()));
    }

    vars
}

/// Merge updates into an existing env map. Updated keys win; keys absent
/// from the updates are preserved. Nothing is ever dropped.
pub fn merge_env(
    existing: &BTreeMap<String, String>,
    updates: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = existing.clone();
    for (key, value) in updates {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Serialize an env map back to file form. Keys come out sorted so the file
/// is byte-stable for identical contents, which keeps rewrites idempotent.
pub fn serialize_env_file(vars: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in vars {
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape(value));
        out.push_str("\"\n");
    }
    out
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> String {
    let inner = if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
        || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
    {
        &value[1..value.len() - 1]
    } else {
        value
    };
    unescape(inner)
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Hands out one async mutex per instance name.
///
/// Env updates are read-merge-write against a file inside the instance; two
/// concurrent updates for the same instance would silently lose one set of
/// keys. Every provider routes its env updates through a lock from this
/// registry. Locks are created lazily and kept for the life of the process.
#[derive(Default)]
pub struct InstanceLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the update lock for one instance, waiting if another update
    /// for the same instance is in flight. Different instances never block
    /// each other.
    pub async fn acquire(&self, instance: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(instance.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_lines() {
        let parsed = parse_env_file("FOO=\"bar\"\nBAZ=\"qux\"\n");
        assert_eq!(parsed.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(parsed.get("BAZ").map(String::as_str), Some("qux"));
    }

    #[test]
    fn test_parse_export_prefix_and_unquoted() {
        let parsed = parse_env_file("export TOKEN=abc123\nPLAIN=value\n");
        assert_eq!(parsed.get("TOKEN").map(String::as_str), Some("abc123"));
        assert_eq!(parsed.get("PLAIN").map(String::as_str), Some("value"));
    }

    #[test]
    fn test_parse_skips_comments_blanks_and_garbage() {
        let parsed = parse_env_file("# comment\n\nnot an assignment\n1BAD=x\nOK=\"1\"\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("OK").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_merge_new_wins_nothing_dropped() {
        let existing: BTreeMap<_, _> = [("A", "1"), ("B", "2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let updates: HashMap<_, _> = [("B", "3"), ("C", "4")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let merged = merge_env(&existing, &updates);
        assert_eq!(merged.get("A").map(String::as_str), Some("1"));
        assert_eq!(merged.get("B").map(String::as_str), Some("3"));
        assert_eq!(merged.get("C").map(String::as_str), Some("4"));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_serialize_is_sorted_and_quoted() {
        let vars: BTreeMap<_, _> = [("ZED", "z"), ("ALPHA", "a")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(serialize_env_file(&vars), "ALPHA=\"a\"\nZED=\"z\"\n");
    }

    #[test]
    fn test_round_trip_with_special_characters() {
        let mut vars = BTreeMap::new();
        vars.insert("MSG".to_string(), "he said \"hi\"\nbye \\ slash".to_string());
        let text = serialize_env_file(&vars);
        assert_eq!(parse_env_file(&text), vars);
    }

    #[tokio::test]
    async fn test_instance_locks_serialize_same_instance() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let locks = Arc::new(InstanceLocks::new());
        let running = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let locks = locks.clone();
            let running = running.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("box-1").await;
                let now = running.fetch_add(1, Ordering::SeqCst);
                assert_eq!(now, 0, "two updates held the same instance lock");
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_instance_locks_are_independent_per_instance() {
        let locks = InstanceLocks::new();
        let _a = locks.acquire("box-a").await;
        // Must not deadlock: a different instance uses a different mutex.
        let _b = locks.acquire("box-b").await;
    }
}
