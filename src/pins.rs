/// The pin store: `pins.md`, one constraint per line.
///
/// Grounded on the teacher's `history.rs` line-oriented, human-scannable
/// persistence style (one record per line, re-derived on every read rather
/// than kept in a richer structured format).
use crate::error::Result;
use crate::fsstore::Store;
use serde::Serialize;
use sha2::{Digest, Sha256};

const PINS_FILE: &str = "pins.md";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Pin {
    pub id: String,
    pub text: String,
}

/// Normalize a pin for dedup comparison: case-folded, whitespace-collapsed,
/// surrounding quotes stripped, truncated to a 24-char prefix so near
/// duplicates ("Remember: X" vs "remember:  X ") collapse to the same key.
fn dedup_key(line: &str) -> String {
    let collapsed: String = line.split_whitespace().collect::<Vec<_>>().join(" ");
    let unquoted = collapsed
        .trim_matches(|c| c == '"' || c == '\'')
        .to_ascii_lowercase();
    unquoted.chars().take(24).collect()
}

/// `P-` + short hash of the normalized (dedup-key) text, per spec §3. Keyed
/// off the normalized form so near-duplicate pins share an id.
fn pin_id(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dedup_key(text));
    format!("P-{:x}", hasher.finalize())[..10].to_string()
}

/// Parse one persisted line, which is either `- [P-xxxx] text` (current
/// format) or a bare `- text` (legacy pins.md written before ids existed,
/// or hand-edited) — an id is derived on read in the legacy case so old
/// files keep working.
fn parse_line(line: &str) -> Option<Pin> {
    let trimmed = line.trim_start_matches("- ").trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let id = rest[..end].to_string();
            let text = rest[end + 1..].trim().to_string();
            if !text.is_empty() {
                return Some(Pin { id, text });
            }
        }
    }
    Some(Pin {
        id: pin_id(trimmed),
        text: trimmed.to_string(),
    })
}

pub fn read_all(store: &Store) -> Result<Vec<Pin>> {
    let raw = store.read_text(PINS_FILE)?;
    Ok(raw.lines().filter_map(parse_line).collect())
}

fn write_all(store: &Store, pins: &[Pin]) -> Result<()> {
    let mut buf = String::new();
    for p in pins {
        buf.push_str(&format!("- [{}] {}\n", p.id, p.text));
    }
    store.write_text_atomic(PINS_FILE, &buf)
}

/// Add `text` as a new pin, collapsing near-duplicates and enforcing
/// `max_items` by dropping the oldest pin once the cap is exceeded.
pub fn add(store: &Store, text: &str, max_items: usize) -> Result<Vec<Pin>> {
    let mut pins = read_all(store)?;
    let key = dedup_key(text);
    pins.retain(|p| dedup_key(&p.text) != key);
    let text = text.trim().to_string();
    pins.push(Pin {
        id: pin_id(&text),
        text,
    });
    if pins.len() > max_items {
        let overflow = pins.len() - max_items;
        pins.drain(0..overflow);
    }
    write_all(store, &pins)?;
    Ok(pins)
}

pub fn remove(store: &Store, text: &str) -> Result<Vec<Pin>> {
    let key = dedup_key(text);
    let mut pins = read_all(store)?;
    pins.retain(|p| dedup_key(&p.text) != key);
    write_all(store, &pins)?;
    Ok(pins)
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
    fn add_and_read_roundtrip() {
        let (_dir, store) = open_store();
        add(&store, "always use feature branches", 50).unwrap();
        let pins = read_all(&store).unwrap();
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].text, "always use feature branches");
        assert!(pins[0].id.starts_with("P-"));
    }

    #[test]
    fn near_duplicate_collapses() {
        let (_dir, store) = open_store();
        add(&store, "Remember: use feature branches", 50).unwrap();
        add(&store, "remember:  use feature branches ", 50).unwrap();
        let pins = read_all(&store).unwrap();
        assert_eq!(pins.len(), 1);
    }

    #[test]
    fn cap_drops_oldest() {
        let (_dir, store) = open_store();
        for i in 0..5 {
            add(&store, &format!("pin number {i}"), 3).unwrap();
        }
        let pins = read_all(&store).unwrap();
        assert_eq!(pins.len(), 3);
        assert!(pins[0].text.contains('2'));
        assert!(pins[2].text.contains('4'));
    }

    #[test]
    fn remove_drops_matching_pin() {
        let (_dir, store) = open_store();
        add(&store, "pin a", 50).unwrap();
        add(&store, "pin b", 50).unwrap();
        remove(&store, "pin a").unwrap();
        let pins = read_all(&store).unwrap();
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].text, "pin b");
    }

    #[test]
    fn id_is_stable_across_near_duplicate_text() {
        let id1 = pin_id("Remember: X");
        let id2 = pin_id("remember:  X ");
        assert_eq!(id1, id2);
    }

    #[test]
    fn legacy_line_without_id_still_parses() {
        let (_dir, store) = open_store();
        store.write_text_atomic(PINS_FILE, "- a legacy pin\n").unwrap();
        let pins = read_all(&store).unwrap();
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].text, "a legacy pin");
        assert!(pins[0].id.starts_with("P-"));
    }
}
