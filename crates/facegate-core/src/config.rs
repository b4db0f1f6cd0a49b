use crate::detector::ScanParams;
use crate::enroll::EnrollLimits;
use crate::lbph::LbphParams;
use crate::normalizer::NormalizerParams;
use crate::store::StoreOptions;
use crate::verify::DecisionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Environment variable naming a TOML config file.
pub const CONFIG_ENV: &str = "FACEGATE_CONFIG";
const CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";
/// Where OpenCV packages install the stock cascades.
const SYSTEM_CASCADE_DIRS: &[&str] = &[
    "/usr/share/opencv4/haarcascades",
    "/usr/share/opencv/haarcascades",
    "/usr/local/share/opencv4/haarcascades",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration.
///
/// Sources, lowest precedence first: built-in defaults, an optional TOML
/// file, then `FACEGATE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory holding the appearance model snapshot.
    pub data_dir: PathBuf,
    /// OpenCV cascade XML or cascade JSON. When unset, the stock frontal-face
    /// cascade is looked up in `data_dir`, then in the OpenCV install dirs.
    pub cascade_path: Option<PathBuf>,

    pub patch_size: u32,
    pub min_face_size: u32,
    pub min_luminance: f64,
    pub max_luminance: f64,

    pub scale_factor: f32,
    pub min_neighbors: u32,

    pub lbph_radius: u32,
    pub lbph_neighbors: u32,
    pub lbph_grid: u32,

    pub accept_threshold: f64,
    pub distance_scale: f64,

    pub min_enroll_images: usize,
    pub max_enroll_images: usize,
    pub min_valid_images: usize,

    /// Patches kept per identity for full retrains (0 disables).
    pub corpus_per_identity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let normalizer = NormalizerParams::default();
        let scan = ScanParams::default();
        let lbph = LbphParams::default();
        let policy = DecisionPolicy::default();
        let limits = EnrollLimits::default();
        let store = StoreOptions::default();
        Self {
            data_dir: default_data_dir(),
            cascade_path: None,
            patch_size: normalizer.patch_size,
            min_face_size: normalizer.min_face_size,
            min_luminance: normalizer.min_luminance,
            max_luminance: normalizer.max_luminance,
            scale_factor: scan.scale_factor,
            min_neighbors: scan.min_neighbors,
            lbph_radius: lbph.radius,
            lbph_neighbors: lbph.neighbors,
            lbph_grid: lbph.grid_x,
            accept_threshold: policy.accept_threshold,
            distance_scale: policy.distance_scale,
            min_enroll_images: limits.min_images,
            max_enroll_images: limits.max_images,
            min_valid_images: limits.min_valid,
            corpus_per_identity: store.corpus_per_identity,
        }
    }
}

impl EngineConfig {
    /// Load from an explicit file, else `$FACEGATE_CONFIG`, else defaults; then apply env overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `FACEGATE_*` overrides from `lookup`; unparsable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FACEGATE_MODEL_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("FACEGATE_CASCADE_PATH") {
            self.cascade_path = Some(PathBuf::from(path));
        }
        override_with(&lookup, "FACEGATE_PATCH_SIZE", &mut self.patch_size);
        override_with(&lookup, "FACEGATE_MIN_FACE_SIZE", &mut self.min_face_size);
        override_with(&lookup, "FACEGATE_MIN_LUMINANCE", &mut self.min_luminance);
        override_with(&lookup, "FACEGATE_MAX_LUMINANCE", &mut self.max_luminance);
        override_with(&lookup, "FACEGATE_SCALE_FACTOR", &mut self.scale_factor);
        override_with(&lookup, "FACEGATE_MIN_NEIGHBORS", &mut self.min_neighbors);
        override_with(&lookup, "FACEGATE_ACCEPT_THRESHOLD", &mut self.accept_threshold);
        override_with(&lookup, "FACEGATE_DISTANCE_SCALE", &mut self.distance_scale);
        override_with(&lookup, "FACEGATE_MIN_ENROLL_IMAGES", &mut self.min_enroll_images);
        override_with(&lookup, "FACEGATE_MAX_ENROLL_IMAGES", &mut self.max_enroll_images);
        override_with(&lookup, "FACEGATE_MIN_VALID_IMAGES", &mut self.min_valid_images);
        override_with(&lookup, "FACEGATE_CORPUS_PER_IDENTITY", &mut self.corpus_per_identity);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if !(0.0..=1.0).contains(&self.accept_threshold) {
            return invalid(format!("accept_threshold {} outside [0, 1]", self.accept_threshold));
        }
        if self.distance_scale <= 0.0 {
            return invalid(format!("distance_scale must be positive, got {}", self.distance_scale));
        }
        if self.min_luminance >= self.max_luminance {
            return invalid(format!(
                "min_luminance {} must be below max_luminance {}",
                self.min_luminance, self.max_luminance
            ));
        }
        if self.scale_factor.is_nan() || self.scale_factor <= 1.0 {
            return invalid(format!("scale_factor must be > 1.0, got {}", self.scale_factor));
        }
        if self.min_enroll_images > self.max_enroll_images {
            return invalid(format!(
                "min_enroll_images {} exceeds max_enroll_images {}",
                self.min_enroll_images, self.max_enroll_images
            ));
        }
        if self.min_valid_images == 0 || self.min_valid_images > self.max_enroll_images {
            return invalid(format!(
                "min_valid_images must be in 1..={}, got {}",
                self.max_enroll_images, self.min_valid_images
            ));
        }
        if self.lbph_neighbors == 0 || self.lbph_neighbors > 16 {
            return invalid(format!("lbph_neighbors must be in 1..=16, got {}", self.lbph_neighbors));
        }
        if self.lbph_radius == 0 || self.lbph_grid == 0 {
            return invalid("lbph_radius and lbph_grid must be positive".to_string());
        }
        let usable = self.patch_size.saturating_sub(2 * self.lbph_radius);
        if usable < self.lbph_grid {
            return invalid(format!(
                "patch_size {} too small for an {}x{} grid at radius {}",
                self.patch_size, self.lbph_grid, self.lbph_grid, self.lbph_radius
            ));
        }
        Ok(())
    }

    pub fn cascade_path(&self) -> PathBuf {
        let system: Vec<PathBuf> = SYSTEM_CASCADE_DIRS
            .iter()
            .map(|dir| Path::new(dir).join(CASCADE_FILE))
            .collect();
        resolve_cascade(self.cascade_path.as_deref(), &self.data_dir, &system)
    }

    pub fn normalizer_params(&self) -> NormalizerParams {
        NormalizerParams {
            patch_size: self.patch_size,
            min_face_size: self.min_face_size,
            min_luminance: self.min_luminance,
            max_luminance: self.max_luminance,
        }
    }

    pub fn scan_params(&self) -> ScanParams {
        ScanParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: self.min_face_size,
            max_size: None,
        }
    }

    pub fn lbph_params(&self) -> LbphParams {
        LbphParams {
            radius: self.lbph_radius,
            neighbors: self.lbph_neighbors,
            grid_x: self.lbph_grid,
            grid_y: self.lbph_grid,
        }
    }

    pub fn decision_policy(&self) -> DecisionPolicy {
        DecisionPolicy {
            accept_threshold: self.accept_threshold,
            distance_scale: self.distance_scale,
        }
    }

    pub fn enroll_limits(&self) -> EnrollLimits {
        EnrollLimits {
            min_images: self.min_enroll_images,
            max_images: self.max_enroll_images,
            min_valid: self.min_valid_images,
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lbph: self.lbph_params(),
            corpus_per_identity: self.corpus_per_identity,
        }
    }
}

/// Explicit path, else the first existing candidate, else the data-dir default.
fn resolve_cascade(explicit: Option<&Path>, data_dir: &Path, system: &[PathBuf]) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let local = data_dir.join(CASCADE_FILE);
    if local.exists() {
        return local;
    }
    system.iter().find(|p| p.exists()).cloned().unwrap_or(local)
}

/// `$XDG_DATA_HOME/facegate`, falling back to `~/.local/share/facegate`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

fn override_with<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let c = EngineConfig::default();
        assert_eq!(c.patch_size, 200);
        assert_eq!(c.min_face_size, 100);
        assert_eq!((c.min_luminance, c.max_luminance), (30.0, 220.0));
        assert_eq!(c.accept_threshold, 0.6);
        assert_eq!(c.distance_scale, 100.0);
        assert_eq!((c.min_enroll_images, c.max_enroll_images, c.min_valid_images), (3, 10, 3));
        assert_eq!(c.corpus_per_identity, 10);
        assert_eq!(c.min_neighbors, 5);
        assert!(c.data_dir.ends_with("facegate"));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_cascade_defaults_into_data_dir() {
        let data_dir = Path::new("/nonexistent/facegate");
        assert_eq!(
            resolve_cascade(None, data_dir, &[]),
            data_dir.join("haarcascade_frontalface_default.xml")
        );
    }

    #[test]
    fn test_cascade_falls_back_to_installed_opencv() {
        let dir = TempDir::new().unwrap();
        let installed = dir.path().join("haarcascades").join(CASCADE_FILE);
        std::fs::create_dir_all(installed.parent().unwrap()).unwrap();
        std::fs::write(&installed, "<opencv_storage/>").unwrap();
        let data_dir = dir.path().join("data");
        let missing = dir.path().join("elsewhere").join(CASCADE_FILE);

        let system = [missing, installed.clone()];
        assert_eq!(resolve_cascade(None, &data_dir, &system), installed);

        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join(CASCADE_FILE), "<opencv_storage/>").unwrap();
        assert_eq!(resolve_cascade(None, &data_dir, &system), data_dir.join(CASCADE_FILE));

        let explicit = Path::new("/etc/facegate/custom.json");
        assert_eq!(resolve_cascade(Some(explicit), &data_dir, &system), explicit);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("facegate.toml");
        std::fs::write(
            &path,
            "data_dir = \"/srv/faces\"\naccept_threshold = 0.7\ncorpus_per_identity = 4\n",
        )
        .unwrap();
        let c = EngineConfig::from_file(&path).unwrap();
        assert_eq!(c.data_dir, PathBuf::from("/srv/faces"));
        assert_eq!(c.accept_threshold, 0.7);
        assert_eq!(c.corpus_per_identity, 4);
        assert_eq!(c.min_face_size, 100);
    }

    #[test]
    fn test_unknown_toml_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("facegate.toml");
        std::fs::write(&path, "acept_threshold = 0.7\n").unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = EngineConfig::from_file(Path::new("/nonexistent/facegate.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_env_overrides_win() {
        let mut c = EngineConfig::default();
        c.apply_overrides(env(&[
            ("FACEGATE_MODEL_DIR", "/tmp/fg"),
            ("FACEGATE_ACCEPT_THRESHOLD", "0.75"),
            ("FACEGATE_MIN_FACE_SIZE", "80"),
            ("FACEGATE_CORPUS_PER_IDENTITY", "0"),
        ]));
        assert_eq!(c.data_dir, PathBuf::from("/tmp/fg"));
        assert_eq!(c.accept_threshold, 0.75);
        assert_eq!(c.min_face_size, 80);
        assert_eq!(c.scan_params().min_size, 80);
        assert_eq!(c.corpus_per_identity, 0);
    }

    #[test]
    fn test_unparsable_override_ignored() {
        let mut c = EngineConfig::default();
        c.apply_overrides(env(&[("FACEGATE_ACCEPT_THRESHOLD", "high")]));
        assert_eq!(c.accept_threshold, 0.6);
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let bad = [
            EngineConfig {
                accept_threshold: 1.5,
                ..EngineConfig::default()
            },
            EngineConfig {
                min_luminance: 200.0,
                max_luminance: 100.0,
                ..EngineConfig::default()
            },
            EngineConfig {
                min_enroll_images: 12,
                ..EngineConfig::default()
            },
            EngineConfig {
                scale_factor: 1.0,
                ..EngineConfig::default()
            },
            EngineConfig {
                patch_size: 4,
                ..EngineConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{config:?}");
        }
    }

    #[test]
    fn test_builders_carry_values() {
        let c = EngineConfig {
            lbph_grid: 4,
            max_enroll_images: 6,
            ..EngineConfig::default()
        };
        assert_eq!(c.lbph_params().grid_y, 4);
        assert_eq!(c.enroll_limits().max_images, 6);
        assert_eq!(c.store_options().lbph, c.lbph_params());
        assert_eq!(c.decision_policy(), DecisionPolicy::default());
    }
}
