/// The rolling summary: `summary.md`, a fixed header followed by a
/// bullet-only body, capped at `summary_max_chars`.
///
/// Grounded on `sessions.rs::build_prior_context`'s approach to injecting
/// prior context under a token budget (walk newest-first, stop once the
/// budget is used, then present in chronological order) — here applied to
/// bullet lines instead of whole turns.
use crate::error::Result;
use crate::fsstore::Store;

const SUMMARY_FILE: &str = "summary.md";
const HEADER: &str = "# Summary\n\n";

fn dedup_key(line: &str) -> String {
    line.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

pub fn read(store: &Store) -> Result<String> {
    let raw = store.read_text(SUMMARY_FILE)?;
    if raw.is_empty() {
        Ok(HEADER.to_string())
    } else {
        Ok(raw)
    }
}

fn bullets_of(body: &str) -> Vec<String> {
    body.lines()
        .filter(|l| l.trim_start().starts_with("- "))
        .map(|l| l.trim().to_string())
        .collect()
}

/// Merge `new_bullets` into the existing summary, deduplicating case- and
/// whitespace-insensitively, then truncating from the oldest bullet until
/// the whole document fits `max_chars`.
pub fn merge_bullets(store: &Store, new_bullets: &[String], max_chars: usize) -> Result<String> {
    let current = read(store)?;
    let mut bullets = bullets_of(&current);
    let mut seen: std::collections::HashSet<String> =
        bullets.iter().map(|b| dedup_key(b)).collect();

    for b in new_bullets {
        let line = if b.trim_start().starts_with("- ") {
            b.trim().to_string()
        } else {
            format!("- {}", b.trim())
        };
        let key = dedup_key(&line);
        if seen.insert(key) {
            bullets.push(line);
        }
    }

    let mut doc = render(&bullets);
    while doc.len() > max_chars && !bullets.is_empty() {
        bullets.remove(0);
        doc = render(&bullets);
    }

    store.write_text_atomic(SUMMARY_FILE, &doc)?;
    Ok(doc)
}

fn render(bullets: &[String]) -> String {
    let mut doc = HEADER.to_string();
    for b in bullets {
        doc.push_str(b);
        doc.push('\n');
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join(".contextfs")).unwrap();
        (dir, store)
    }

    #[test]
    fn empty_summary_has_header() {
        let (_dir, store) = open_store();
        assert_eq!(read(&store).unwrap(), HEADER);
    }

    #[test]
    fn merge_adds_new_bullets() {
        let (_dir, store) = open_store();
        let doc = merge_bullets(&store, &["first fact".to_string()], 4000).unwrap();
        assert!(doc.contains("- first fact"));
    }

    #[test]
    fn merge_dedupes_case_and_whitespace_insensitively() {
        let (_dir, store) = open_store();
        merge_bullets(&store, &["Uses Postgres".to_string()], 4000).unwrap();
        let doc = merge_bullets(&store, &["uses   postgres".to_string()], 4000).unwrap();
        assert_eq!(bullets_of(&doc).len(), 1);
    }

    #[test]
    fn truncates_oldest_bullets_to_fit_budget() {
        let (_dir, store) = open_store();
        let bullets: Vec<String> = (0..50).map(|i| format!("fact number {i}")).collect();
        let doc = merge_bullets(&store, &bullets, 200).unwrap();
        assert!(doc.len() <= 200);
        // the newest bullet survives, the oldest is dropped
        assert!(doc.contains("fact number 49"));
        assert!(!doc.contains("fact number 0\n"));
    }
}
