//! Scratch directories for tests.

use crate::file::Config;
use rand::{rngs::OsRng, RngCore};
use std::{env, fs, path::PathBuf};

/// A pair of cache and metadata directories removed on drop.
pub struct Scratch {
    root: PathBuf,
}

impl Scratch {
    pub fn new() -> Self {
        let root = env::temp_dir().join(format!("pcache-{:016x}", OsRng.next_u64()));
        fs::create_dir_all(root.join("cache")).unwrap();
        fs::create_dir_all(root.join("meta")).unwrap();
        Self { root }
    }

    pub fn cache_directory(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn meta_directory(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn config(&self, alignment: u64) -> Config {
        Config {
            cache_directory: self.cache_directory(),
            meta_directory: self.meta_directory(),
            alignment,
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}
