//! Enrichment stage of an asset-management platform.
//!
//! Discovers files under a root, decides which images are worth OCR, reads
//! text with word boxes, pulls images out of PDF and OOXML containers, embeds
//! document chunks and profiles loosely-structured JSON payloads. Calls into
//! external engines go through [`pipeline::resilience`].

pub mod config;
pub mod pipeline;
pub mod pipeline_config;

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides
/// [`config::default_log_filter`]. Returns `false` when a subscriber was
/// already installed.
pub fn init_tracing() -> bool {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("{} v{} tracing initialized", config::APP_NAME, config::APP_VERSION);
    }
    installed
}
