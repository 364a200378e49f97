use rollcall_core::GateConfig;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD model file name inside `model_dir`.
    pub detector_model: String,
    /// ArcFace model file name inside `model_dir`.
    pub embedder_model: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity required to accept a match.
    pub similarity_threshold: f32,
    /// Combined liveness confidence required to pass.
    pub liveness_threshold: f32,
    /// Best and runner-up identities closer than this are ambiguous.
    pub tie_epsilon: f32,
    /// Side of the aligned face crop in pixels.
    pub crop_size: u32,
    /// Dimensionality of every stored and produced embedding.
    pub embedding_dim: usize,
    /// Minimum SCRFD score for a detection to count as a face.
    pub detector_confidence: f32,
    /// Laplacian variance below which a frame is rejected as blurred.
    pub min_sharpness: f32,
    /// Retry detection on a CLAHE-enhanced copy when no face is found.
    pub enhance_contrast: bool,
    /// Upper bound on a single D-Bus request, in seconds.
    pub request_timeout_secs: u64,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
    /// Most synthetic identities a single scale-test request may create.
    pub max_synthetic_batch: usize,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = lookup("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));

        let db_path = lookup("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("attendance.db"));

        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| !matches!(v.trim(), "0" | "false" | "no" | "off"))
                .unwrap_or(default)
        };

        Self {
            model_dir,
            detector_model: lookup("ROLLCALL_DETECTOR_MODEL")
                .unwrap_or_else(|| "det_10g.onnx".to_string()),
            embedder_model: lookup("ROLLCALL_EMBEDDER_MODEL")
                .unwrap_or_else(|| "w600k_r50.onnx".to_string()),
            db_path,
            similarity_threshold: env_or(&lookup, "ROLLCALL_SIMILARITY_THRESHOLD", 0.65),
            liveness_threshold: env_or(&lookup, "ROLLCALL_LIVENESS_THRESHOLD", 0.5),
            tie_epsilon: env_or(&lookup, "ROLLCALL_TIE_EPSILON", rollcall_core::matcher::DEFAULT_TIE_EPSILON),
            crop_size: env_or(&lookup, "ROLLCALL_CROP_SIZE", 112),
            embedding_dim: env_or(&lookup, "ROLLCALL_EMBEDDING_DIM", 512),
            detector_confidence: env_or(&lookup, "ROLLCALL_DETECTOR_CONFIDENCE", 0.5),
            min_sharpness: env_or(&lookup, "ROLLCALL_MIN_SHARPNESS", 15.0),
            enhance_contrast: flag("ROLLCALL_ENHANCE_CONTRAST", true),
            request_timeout_secs: env_or(&lookup, "ROLLCALL_REQUEST_TIMEOUT_SECS", 10),
            session_bus: flag("ROLLCALL_SESSION_BUS", false),
            max_synthetic_batch: env_or(
                &lookup,
                "ROLLCALL_MAX_SYNTHETIC_BATCH",
                crate::service::DEFAULT_SYNTHETIC_LIMIT,
            ),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join(&self.embedder_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            crop_size: self.crop_size,
            min_sharpness: self.min_sharpness,
            enhance_contrast: self.enhance_contrast,
            ..GateConfig::default()
        }
    }
}

fn env_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("HOME", "/home/att")]);
        assert_eq!(c.similarity_threshold, 0.65);
        assert_eq!(c.liveness_threshold, 0.5);
        assert_eq!(c.tie_epsilon, 1e-4);
        assert_eq!(c.crop_size, 112);
        assert_eq!(c.embedding_dim, 512);
        assert!(c.enhance_contrast);
        assert!(!c.session_bus);
        assert_eq!(c.max_synthetic_batch, 10_000);
        assert_eq!(c.db_path, PathBuf::from("/home/att/.local/share/rollcall/attendance.db"));
        assert_eq!(c.detector_model_path(), "/home/att/.local/share/rollcall/models/det_10g.onnx");
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("ROLLCALL_SIMILARITY_THRESHOLD", "0.8"),
            ("ROLLCALL_EMBEDDING_DIM", "128"),
            ("ROLLCALL_DB_PATH", "/var/lib/rollcall/db.sqlite"),
            ("ROLLCALL_ENHANCE_CONTRAST", "0"),
            ("ROLLCALL_SESSION_BUS", "1"),
            ("ROLLCALL_CROP_SIZE", "160"),
            ("ROLLCALL_MAX_SYNTHETIC_BATCH", "2500"),
        ]);
        assert_eq!(c.similarity_threshold, 0.8);
        assert_eq!(c.embedding_dim, 128);
        assert_eq!(c.db_path, PathBuf::from("/var/lib/rollcall/db.sqlite"));
        assert!(!c.enhance_contrast);
        assert!(c.session_bus);
        assert_eq!(c.gate_config().crop_size, 160);
        assert_eq!(c.max_synthetic_batch, 2500);
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let c = config(&[("ROLLCALL_LIVENESS_THRESHOLD", "high")]);
        assert_eq!(c.liveness_threshold, 0.5);
    }
}
