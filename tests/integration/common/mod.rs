#![allow(dead_code)]

use std::sync::{Arc, Once};

use cowtree::{BlockStore, MemStore, Registry, TreeOptions};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("cowtree=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Small blocks so a few thousand entries build a multi-level tree.
pub fn small_options() -> TreeOptions {
    TreeOptions {
        default_block_size: 512,
        min_block_size: 512,
        max_block_size: 1024,
        merge_threshold_pct: 50,
    }
}

pub fn registry() -> Arc<Registry> {
    Arc::new(Registry::standard())
}

pub fn store() -> (Arc<MemStore>, Arc<dyn BlockStore>) {
    let mem = Arc::new(MemStore::default());
    let dyn_store: Arc<dyn BlockStore> = mem.clone();
    (mem, dyn_store)
}
