use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "asset-enrich";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable naming a JSON pipeline config file.
pub const CONFIG_ENV_VAR: &str = "ASSET_ENRICH_CONFIG";

/// Filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "asset_enrich=debug,info"
    } else {
        "asset_enrich=info,warn"
    }
}

/// Get the application data directory.
/// Platform data dir (e.g. ~/.local/share/asset-enrich), or a relative
/// fallback when the platform reports none.
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Get the models directory (for ONNX embeddings, etc.)
pub fn models_dir() -> PathBuf {
    app_data_dir().join("models")
}

/// Default ONNX embedding model directory (nomic-embed-text, 768 dims).
pub fn embedding_model_dir() -> PathBuf {
    models_dir().join("nomic-embed-text-v1.5")
}

/// Default root for the filesystem artifact store.
pub fn artifacts_dir() -> PathBuf {
    app_data_dir().join("artifacts")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirs_nest_under_app_data() {
        let app = app_data_dir();
        assert!(app.ends_with(APP_NAME));
        assert!(models_dir().starts_with(&app));
        assert!(embedding_model_dir().starts_with(models_dir()));
        assert!(artifacts_dir().starts_with(&app));
    }

    #[test]
    fn log_filter_targets_crate() {
        assert!(default_log_filter().contains("asset_enrich="));
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }
}
