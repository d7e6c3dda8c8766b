//! Pluggable derivation of the on-disk filename for an external entry.
//!
//! The default, lowercase hex MD5 of the key, is compatibility-relevant: it
//! determines the on-disk layout other tools might read, so it lives here as
//! the crate's built-in default rather than left to the caller.

use std::sync::Arc;

/// Derives the filename under `data/` for a given key.
pub trait FilenameProvider: Send + Sync {
    fn filename_for_key(&self, key: &str) -> String;
}

/// Lowercase hex MD5 of the key, so existing on-disk layouts stay readable
/// by other tools that assume this derivation.
pub struct Md5Filename;

impl FilenameProvider for Md5Filename {
    fn filename_for_key(&self, key: &str) -> String {
        format!("{:x}", md5::compute(key.as_bytes()))
    }
}

pub type FilenameCallback = Arc<dyn FilenameProvider>;

pub fn default_filename_callback() -> FilenameCallback {
    Arc::new(Md5Filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_filename_is_stable_hex() {
        let f = Md5Filename;
        let name = f.filename_for_key("hello");
        assert_eq!(name, format!("{:x}", md5::compute(b"hello")));
        assert_eq!(name.len(), 32);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn distinct_keys_yield_distinct_filenames() {
        let f = Md5Filename;
        assert_ne!(f.filename_for_key("a"), f.filename_for_key("b"));
    }
}
