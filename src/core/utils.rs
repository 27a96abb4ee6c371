use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-process counter mixed into scratch names so that two executions of the
/// same source within one clock tick still get distinct files
static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Scratch file name for one execution: `<sha256(source, time, counter)>.pseudo`
pub fn scratch_file_name(source: &str, created_at: SystemTime) -> String {
    let nanos = created_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let counter = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(format!(" {} {}", nanos, counter).as_bytes());
    format!("{:x}.pseudo", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_name_shape() {
        let name = scratch_file_name("OUTPUT 1", SystemTime::now());
        assert!(name.ends_with(".pseudo"));
        // 64 hex chars + extension
        assert_eq!(name.len(), 64 + ".pseudo".len());
    }

    #[test]
    fn test_same_source_same_instant_differs() {
        let now = SystemTime::now();
        assert_ne!(scratch_file_name("x", now), scratch_file_name("x", now));
    }
}
