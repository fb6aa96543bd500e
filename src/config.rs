use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::executor::DEFAULT_CONCURRENCY;
use crate::processor::DEFAULT_CHUNK_SIZE;

const DEFAULT_GEOCODER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_NOMINATIM_MIN_INTERVAL_MS: u64 = 1_000;
const DEFAULT_NOMINATIM_BASE_URL: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_ORS_BASE_URL: &str = "https://api.openrouteservice.org";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub cache_database_file: String,
    pub checkpoint_dir_name: String,
    pub chunk_size: usize,
    pub max_workers: usize,
    pub geocoder_timeout_secs: u64,
    pub nominatim_base_url: String,
    pub nominatim_user_agent: String,
    pub nominatim_min_interval_ms: u64,
    pub ors_base_url: String,
    pub ors_api_key: Option<SecretString>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub cache_database_file: String,
    pub checkpoint_dir_name: String,
    pub chunk_size: usize,
    pub max_workers: usize,
    pub geocoder_timeout_secs: u64,
    pub nominatim_base_url: String,
    pub nominatim_min_interval_ms: u64,
    pub ors_base_url: String,
    pub has_ors_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            data_dir: env::var("DATA_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".cache")),
            cache_database_file: env::var("CACHE_DATABASE_FILE")
                .unwrap_or_else(|_| "geocoding-cache.db".to_string()),
            checkpoint_dir_name: env::var("CHECKPOINT_DIR_NAME")
                .unwrap_or_else(|_| "temp_batches".to_string()),
            chunk_size: parse_env("BATCH_CHUNK_SIZE", DEFAULT_CHUNK_SIZE).max(1),
            max_workers: parse_env("MAX_WORKERS", DEFAULT_CONCURRENCY).max(1),
            geocoder_timeout_secs: parse_env(
                "GEOCODER_TIMEOUT_SECS",
                DEFAULT_GEOCODER_TIMEOUT_SECS,
            )
            .max(1),
            nominatim_base_url: env::var("NOMINATIM_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_NOMINATIM_BASE_URL.to_string()),
            nominatim_user_agent: env::var("NOMINATIM_USER_AGENT")
                .unwrap_or_else(|_| format!("dual-distance/{}", env!("CARGO_PKG_VERSION"))),
            nominatim_min_interval_ms: parse_env(
                "NOMINATIM_MIN_INTERVAL_MS",
                DEFAULT_NOMINATIM_MIN_INTERVAL_MS,
            ),
            ors_base_url: env::var("ORS_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_ORS_BASE_URL.to_string()),
            ors_api_key: env::var("API_ORS")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
        }
    }

    pub fn cache_database_path(&self) -> PathBuf {
        self.data_dir.join(&self.cache_database_file)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join(&self.checkpoint_dir_name)
    }

    pub fn geocoder_timeout(&self) -> Duration {
        Duration::from_secs(self.geocoder_timeout_secs)
    }

    pub fn nominatim_min_interval(&self) -> Duration {
        Duration::from_millis(self.nominatim_min_interval_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            cache_database_file: self.cache_database_file.clone(),
            checkpoint_dir_name: self.checkpoint_dir_name.clone(),
            chunk_size: self.chunk_size,
            max_workers: self.max_workers,
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            nominatim_base_url: self.nominatim_base_url.clone(),
            nominatim_min_interval_ms: self.nominatim_min_interval_ms,
            ors_base_url: self.ors_base_url.clone(),
            has_ors_key: self.ors_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}
