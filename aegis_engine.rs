//! # Aegis Engine - Usage Metrics Aggregation
//!
//! A batch metrics aggregation engine for endpoint-security module usage
//! exports. Aegis ingests per-host usage records from many files, cloud
//! accounts, and environments, classifies each record along several
//! taxonomies, and derives consistent, non-double-counted utilization and
//! activation statistics.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            AEGIS ENGINE                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  LOADER → PREPROCESSOR → {CONCURRENCY, SLICE, MONTHLY} → ORCHESTRATOR   │
//! │                                                         → metrics.json │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Threshold-based activation**: a host only counts as activated once its
//!   cumulative module-active duration clears a configurable minimum
//! - **Multi-dimensional slicing**: environment × cloud provider × service
//!   category, materialized sparsely
//! - **Sweep-line concurrency**: maximum simultaneously-open host intervals
//! - **Monthly trends**: per-month activation snapshots with new/lost
//!   instance accounting and growth statistics
//! - **Double-count safe**: host-level set arithmetic everywhere a naive
//!   per-slice sum would overcount
//!
//! ## Author
//!
//! Aegis Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// All external crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};

// ----------------------------------------------------------------------------
// Parallelism
// ----------------------------------------------------------------------------
use rayon::prelude::*;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use once_cell::sync::Lazy;
use regex::Regex;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::providers::{Env, Format, Toml};
use figment::Figment;

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior of the engine.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "aegis-engine";
pub const ENGINE_FULL_NAME: &str = "Aegis Usage Metrics Engine";

// ----------------------------------------------------------------------------
// Protection Modules
// ----------------------------------------------------------------------------

/// The fixed set of protection modules reported by the product. Order is the
/// canonical tie-break order for `most_common_module`; identity is by name.
pub const MODULE_NAMES: [&str; 9] = ["AM", "WRS", "DC", "AC", "IM", "LI", "FW", "DPI", "SAP"];

/// Number of protection modules (fixed arity).
pub const MODULE_COUNT: usize = MODULE_NAMES.len();

// ----------------------------------------------------------------------------
// Time Conversions
// ----------------------------------------------------------------------------

pub const SECONDS_PER_HOUR: f64 = 3600.0;

/// Tolerance when comparing a source-provided duration against the duration
/// derived from the record interval. Disagreements beyond this are logged,
/// never silently reconciled.
pub const DURATION_MISMATCH_TOLERANCE_SECS: f64 = 1.0;

// ----------------------------------------------------------------------------
// Analysis Defaults
// ----------------------------------------------------------------------------

/// Default minimum cumulative module-active duration (in hours) for a host to
/// count as activated within a slice.
pub const DEFAULT_ACTIVATION_MIN_HOURS: f64 = 24.0;

/// Default configuration file name.
pub const DEFAULT_CONFIG_PATH: &str = "aegis.toml";

/// Default output directory for the metrics document.
pub const DEFAULT_OUTPUT_DIR: &str = "output";

/// File name of the serialized metrics document.
pub const METRICS_FILE_NAME: &str = "metrics.json";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The fundamental data types flowing through the engine:
// - ModuleFlags: fixed-arity protection module booleans (bitmask-backed)
// - Categorical tags: Environment, CloudProvider, ServiceCategory
// - UsageRecord: one normalized row of input, immutable after preprocessing
// - Calendar month helpers for the trend calculator
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Module Flags - Fixed Set of Protection Module Booleans
// ----------------------------------------------------------------------------

/// The per-record protection module flags, one bit per module in
/// [`MODULE_NAMES`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ModuleFlags(u16);

impl ModuleFlags {
    /// No modules set.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create from a raw bitmask. Bits beyond [`MODULE_COUNT`] are cleared.
    #[inline]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & ((1 << MODULE_COUNT) - 1))
    }

    /// Raw bitmask value.
    #[inline]
    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// Set the flag for the module at `index` in [`MODULE_NAMES`] order.
    #[inline]
    pub fn set(&mut self, index: usize) {
        if index < MODULE_COUNT {
            self.0 |= 1 << index;
        }
    }

    /// Whether the module at `index` is flagged.
    #[inline]
    pub const fn is_set(&self, index: usize) -> bool {
        index < MODULE_COUNT && (self.0 >> index) & 1 == 1
    }

    /// Whether any module is flagged.
    #[inline]
    pub const fn any(&self) -> bool {
        self.0 != 0
    }

    /// Number of flagged modules.
    #[inline]
    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate over the indices of flagged modules, in canonical order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MODULE_COUNT).filter(move |&i| self.is_set(i))
    }

    /// Iterate over the names of flagged modules, in canonical order.
    pub fn iter_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.iter_set().map(|i| MODULE_NAMES[i])
    }
}

impl Display for ModuleFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for name in self.iter_names() {
            if !first {
                write!(f, "+")?;
            }
            write!(f, "{}", name)?;
            first = false;
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Categorical Tags
// ----------------------------------------------------------------------------

/// Deployment environment assigned to a record, once, during preprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Environment {
    Production,
    Development,
    Test,
    Staging,
    Dr,
    Uat,
    Integration,
    Internal,
    Dmz,
    EnvironmentSpecific,
    Unknown,
}

impl Environment {
    /// The label used in reports and document keys.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "Production",
            Environment::Development => "Development",
            Environment::Test => "Test",
            Environment::Staging => "Staging",
            Environment::Dr => "DR",
            Environment::Uat => "UAT",
            Environment::Integration => "Integration",
            Environment::Internal => "Internal",
            Environment::Dmz => "DMZ",
            Environment::EnvironmentSpecific => "Environment-Specific",
            Environment::Unknown => "Unknown",
        }
    }
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cloud provider that produced the usage export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CloudProvider {
    Aws,
    Azure,
    Gcp,
    Oci,
    Unknown,
}

impl CloudProvider {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "AWS",
            CloudProvider::Azure => "Azure",
            CloudProvider::Gcp => "GCP",
            CloudProvider::Oci => "OCI",
            CloudProvider::Unknown => "Unknown",
        }
    }
}

impl Display for CloudProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse service grouping derived from a selector match against the record's
/// group name. A host's membership is resolved to a single final value based
/// on its most recent record before any slicing happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceCategory {
    CommonServices,
    MissionPartners,
}

impl ServiceCategory {
    /// Both categories, in report order.
    pub const ALL: [ServiceCategory; 2] =
        [ServiceCategory::CommonServices, ServiceCategory::MissionPartners];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ServiceCategory::CommonServices => "common services",
            ServiceCategory::MissionPartners => "mission partners",
        }
    }
}

impl Display for ServiceCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.3 Usage Record - One Normalized Row of Input
// ----------------------------------------------------------------------------

/// Host identity. Not globally unique across environments, but the dedup and
/// grouping key within one dataset.
pub type HostId = CompactString;

/// One normalized usage record. Created once by the preprocessor and treated
/// as immutable afterwards; the only later mutation is the one-time
/// final-service-category correction applied before aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Host identity (dedup/grouping key).
    pub host: HostId,
    /// Interval start. Invariant: `stop >= start`.
    pub start: DateTime<Utc>,
    /// Interval stop.
    pub stop: DateTime<Utc>,
    /// Authoritative duration in seconds. Sourced from the export when
    /// present, derived from the interval otherwise.
    pub duration_secs: f64,
    /// Protection module flags.
    pub modules: ModuleFlags,
    /// Derived: OR over all module flags.
    pub has_modules: bool,
    /// Deployment environment tag.
    pub environment: Environment,
    /// Cloud provider tag.
    pub cloud_provider: CloudProvider,
    /// Service category tag.
    pub service_category: ServiceCategory,
}

impl UsageRecord {
    /// Duration in hours.
    #[inline]
    pub fn hours(&self) -> f64 {
        self.duration_secs / SECONDS_PER_HOUR
    }

    /// Whether the record's interval overlaps `[window_start, window_end]`.
    #[inline]
    pub fn overlaps(&self, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> bool {
        self.start <= window_end && self.stop >= window_start
    }
}

// ----------------------------------------------------------------------------
// 3.4 Calendar Month Helpers
// ----------------------------------------------------------------------------

/// `YYYY-MM` key for a timestamp. Lexicographic order is chronological.
#[inline]
pub fn month_key(ts: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}", ts.year(), ts.month())
}

/// First instant of the given calendar month.
pub fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    let date = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_default();
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

/// Last second of the given calendar month.
pub fn month_end(year: i32, month: u32) -> DateTime<Utc> {
    let (ny, nm) = next_month(year, month);
    month_start(ny, nm) - chrono::Duration::seconds(1)
}

/// The month following `(year, month)`.
#[inline]
pub const fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month >= 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Every `(year, month)` from `min`'s month through `max`'s month inclusive.
/// Analysis ranges rarely exceed a year, so the list stays inline.
pub fn months_spanning(min: DateTime<Utc>, max: DateTime<Utc>) -> SmallVec<[(i32, u32); 12]> {
    let mut months = SmallVec::new();
    let (mut y, mut m) = (min.year(), min.month());
    let (last_y, last_m) = (max.year(), max.month());
    while (y, m) <= (last_y, last_m) {
        months.push((y, m));
        let (ny, nm) = next_month(y, m);
        y = ny;
        m = nm;
    }
    months
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem, designed for:
// - Clear error categorization
// - Easy propagation with context
// - A best-effort policy: the engine prefers emitting a report with logged
//   warnings over halting, so only a handful of conditions are fatal
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the Aegis engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum EngineError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Ingestion Errors ----
    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Serialization Errors ----
    #[error("Serialization failed: {0}")]
    Serialization(String),

    // ---- Fatal Analysis Conditions ----
    #[error("No records to analyze")]
    NoData,

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Check if this error is recoverable (the run can continue).
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Config(_) => false,
            EngineError::Ingest(e) => e.is_recoverable(),
            EngineError::Io(_) => false,
            EngineError::Serialization(_) => false,
            EngineError::NoData => false,
            EngineError::Internal(_) => false,
        }
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Ingest(_) => "ingest",
            EngineError::Io(_) => "io",
            EngineError::Serialization(_) => "serialization",
            EngineError::NoData => "no_data",
            EngineError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Ingestion Errors
// ----------------------------------------------------------------------------

/// Errors from the loader and preprocessor. Per-row defects are not errors:
/// they are dropped with logged counts. These cover whole-file and
/// whole-dataset failures.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("No input files found in {dir}")]
    NoInputFiles { dir: String },

    #[error("No valid records remained after preprocessing")]
    NoValidRecords,

    #[error("Missing required column '{column}' in {file}")]
    MissingColumn { file: String, column: String },

    #[error("No recognizable date columns in {file}")]
    NoDateColumns { file: String },

    #[error("Failed to read {file}: {message}")]
    ReadFailed { file: String, message: String },
}

impl IngestError {
    pub fn is_recoverable(&self) -> bool {
        // A single unreadable or malformed file is skipped; the dataset-level
        // conditions are fatal.
        matches!(
            self,
            IngestError::MissingColumn { .. }
                | IngestError::NoDateColumns { .. }
                | IngestError::ReadFailed { .. }
        )
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (AEGIS_ prefix)
// - Validation
// - Sensible defaults
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the entire Aegis engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Analysis settings (activation threshold, time range)
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Classifier settings (service category selectors)
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Input/output locations
    #[serde(default)]
    pub io: IoConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract_from(path)
    }

    /// Like [`EngineConfig::load`], but a missing file falls back to
    /// defaults. Environment overrides apply either way.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract_from(path.as_ref())
    }

    fn extract_from(path: &Path) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("AEGIS_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.analysis.activation_min_hours.is_finite() || self.analysis.activation_min_hours < 0.0
        {
            return Err(ConfigError::invalid_value(
                "analysis.activation_min_hours",
                "must be a non-negative number of hours",
            ));
        }

        if let (Some(start), Some(end)) = (self.analysis.start_date, self.analysis.end_date) {
            if end < start {
                return Err(ConfigError::invalid_value(
                    "analysis.end_date",
                    "must not be before analysis.start_date",
                ));
            }
        }

        if self.classifier.common_services_selectors.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::invalid_value(
                "classifier.common_services_selectors",
                "selectors must be non-empty strings",
            ));
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Analysis Configuration
// ----------------------------------------------------------------------------

/// Analysis settings consumed by the metrics calculators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Minimum cumulative module-active duration, in hours, for a host to
    /// count as activated within a slice.
    #[serde(default = "default_activation_min_hours")]
    pub activation_min_hours: f64,

    /// Optional analysis window start (records are clipped to the window)
    #[serde(default)]
    pub start_date: Option<NaiveDate>,

    /// Optional analysis window end, inclusive of the whole day
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl AnalysisConfig {
    /// The activation threshold in seconds.
    #[inline]
    pub fn activation_min_secs(&self) -> f64 {
        self.activation_min_hours * SECONDS_PER_HOUR
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            activation_min_hours: default_activation_min_hours(),
            start_date: None,
            end_date: None,
        }
    }
}

fn default_activation_min_hours() -> f64 {
    DEFAULT_ACTIVATION_MIN_HOURS
}

// ----------------------------------------------------------------------------
// 5.3 Classifier Configuration
// ----------------------------------------------------------------------------

/// Settings for the categorical classifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Substrings matched (case-insensitively) against a record's group name.
    /// A match assigns the record to "common services"; anything else is
    /// "mission partners".
    #[serde(default = "default_common_services_selectors")]
    pub common_services_selectors: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            common_services_selectors: default_common_services_selectors(),
        }
    }
}

fn default_common_services_selectors() -> Vec<String> {
    vec!["common".into(), "shared".into(), "core services".into()]
}

// ----------------------------------------------------------------------------
// 5.4 IO Configuration
// ----------------------------------------------------------------------------

/// Input and output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// Directory scanned for usage export files
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,

    /// Directory the metrics document is written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_input_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: pretty, compact, json
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Optional log file (in addition to stderr)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Include source file/line in log output
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            file: None,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with:
// - Log levels and EnvFilter-based filtering
// - pretty / compact / json output formats
// - Optional log file in addition to stderr
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> EngineResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    // Build the subscriber based on format
    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_file(config.source_location)
                        .with_line_number(config.source_location),
                )
                .with(config.file.as_deref().map(|path| {
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_target(true)
                        .with_writer(file_appender(path))
                }));
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_ansi(config.colors)
                        .with_target(true),
                )
                .with(config.file.as_deref().map(|path| {
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_target(true)
                        .with_writer(file_appender(path))
                }));
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            // Pretty format (default)
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_ansi(config.colors)
                        .with_target(true)
                        .with_file(config.source_location)
                        .with_line_number(config.source_location),
                )
                .with(config.file.as_deref().map(|path| {
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_target(true)
                        .with_writer(file_appender(path))
                }));
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "aegis::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

/// Non-rolling file appender for the optional log file; one analysis run
/// appends to one file.
fn file_appender(path: &Path) -> tracing_appender::rolling::RollingFileAppender {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("aegis.log"));
    tracing_appender::rolling::never(dir, name)
}

// ============================================================================
// SECTION 7: CLASSIFICATION TAXONOMIES
// ============================================================================
// Hostname, filename, and computer-group classification:
// - Environment detection from hostname naming conventions
// - Environment and cloud provider hints from source filenames
// - Service category assignment from computer group selectors
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Pattern Tables
// ----------------------------------------------------------------------------

/// Ordered environment patterns. Each entry pairs plain substrings with
/// compiled regexes; the first environment with any match wins, so the order
/// of this table is part of the classification contract.
static ENVIRONMENT_PATTERNS: Lazy<Vec<(Environment, Vec<&'static str>, Vec<Regex>)>> =
    Lazy::new(|| {
        let rx = |p: &str| Regex::new(p).expect("static environment pattern");
        vec![
            (
                Environment::Production,
                vec![
                    "prod", "-prod", "prd", "production", "live", "prod-", "-prd-",
                    "production-",
                ],
                vec![rx(r"\bprd\d+\b"), rx(r"\bp\d+\b")],
            ),
            (
                Environment::Development,
                vec!["dev", "development", "develop-", "-dev-", "development-"],
                vec![rx(r"\bdev\d+\b")],
            ),
            (
                Environment::Test,
                vec!["test", "tst", "qa", "testing-", "-test-", "qa-", "-qa-"],
                vec![rx(r"\btst\d+\b")],
            ),
            (
                Environment::Staging,
                vec!["stage", "staging", "stg", "stage-", "-stg-", "staging-"],
                vec![rx(r"\bstg\d+\b")],
            ),
            (
                Environment::Dr,
                vec![
                    "dr",
                    "disaster",
                    "recovery",
                    "dr-site",
                    "disaster-recovery",
                    "backup-site",
                ],
                vec![],
            ),
            (
                Environment::Uat,
                vec!["uat", "acceptance", "uat-", "-uat-", "user-acceptance"],
                vec![rx(r"\buat\d+\b")],
            ),
            (
                Environment::Integration,
                vec!["int", "integration", "integration-", "-int-"],
                vec![rx(r"\bint\d+\b")],
            ),
        ]
    });

/// Network-domain patterns checked after the environment table. Private IP
/// ranges and internal DNS suffixes map to Internal; perimeter names to DMZ.
static DOMAIN_PATTERNS: Lazy<Vec<(Environment, Vec<Regex>)>> = Lazy::new(|| {
    let rx = |p: &str| Regex::new(p).expect("static domain pattern");
    vec![
        (
            Environment::Internal,
            vec![
                rx(r"10\.\d+\.\d+\.\d+"),
                rx(r"192\.168\.\d+\.\d+"),
                rx(r"172\.(1[6-9]|2[0-9]|3[0-1])\.\d+\.\d+"),
                rx(r"\.internal\."),
                rx(r"\.local\."),
                rx(r"\.intranet\."),
            ],
        ),
        (
            Environment::Dmz,
            vec![rx("dmz"), rx("perimeter"), rx(r"\.dmz\."), rx("border")],
        ),
    ]
});

// ----------------------------------------------------------------------------
// 7.2 Hostname Classification
// ----------------------------------------------------------------------------

/// Classify a hostname into an environment.
///
/// A source hint (typically derived from the filename the record came from)
/// takes precedence over any hostname-derived signal. Otherwise patterns are
/// tried in table order, then domain patterns, then a handful of weaker
/// naming-convention heuristics.
pub fn classify_environment(hostname: &str, source_env: Option<Environment>) -> Environment {
    if let Some(env) = source_env {
        return env;
    }

    let hostname = hostname.trim().to_lowercase();
    if hostname.is_empty() {
        return Environment::Unknown;
    }

    for (env, keywords, regexes) in ENVIRONMENT_PATTERNS.iter() {
        if keywords.iter().any(|k| hostname.contains(k))
            || regexes.iter().any(|r| r.is_match(&hostname))
        {
            return *env;
        }
    }

    for (env, regexes) in DOMAIN_PATTERNS.iter() {
        if regexes.iter().any(|r| r.is_match(&hostname)) {
            return *env;
        }
    }

    // Role prefixes paired with an environment fragment
    if ["app", "api", "web", "srv"].iter().any(|x| hostname.contains(x)) {
        if hostname.contains("prod") || hostname.contains("prd") {
            return Environment::Production;
        } else if hostname.contains("dev") {
            return Environment::Development;
        }
    }

    // Environment name embedded in a dotted hostname part
    let parts: Vec<&str> = hostname.split('.').collect();
    if parts.len() > 1 {
        for part in &parts {
            for (env, _, _) in ENVIRONMENT_PATTERNS.iter() {
                if part.contains(&env.as_str().to_lowercase()) {
                    return *env;
                }
            }
        }
    }

    // Numbered environments without a recognizable name
    if ["env1", "env2", "e1", "e2"].iter().any(|p| hostname.contains(p)) {
        return Environment::EnvironmentSpecific;
    }

    Environment::Unknown
}

// ----------------------------------------------------------------------------
// 7.3 Filename Hints
// ----------------------------------------------------------------------------

/// Derive an environment hint from an input filename, if it carries one.
pub fn environment_from_filename(filename: &str) -> Option<Environment> {
    let name = filename.to_lowercase();
    if name.contains("dev") || name.contains("development") {
        Some(Environment::Development)
    } else if name.contains("prod") || name.contains("production") {
        Some(Environment::Production)
    } else if name.contains("test") || name.contains("qa") {
        Some(Environment::Test)
    } else if name.contains("int") || name.contains("integration") {
        Some(Environment::Integration)
    } else if name.contains("stage") || name.contains("staging") {
        Some(Environment::Staging)
    } else if name.contains("uat") || name.contains("acceptance") {
        Some(Environment::Uat)
    } else if name.contains("dr") || name.contains("disaster") {
        Some(Environment::Dr)
    } else {
        None
    }
}

/// Derive a cloud provider from an input filename.
pub fn cloud_provider_from_filename(filename: &str) -> CloudProvider {
    let name = filename.to_lowercase();
    if name.contains("aws") || name.contains("amazon") {
        CloudProvider::Aws
    } else if name.contains("azure") {
        CloudProvider::Azure
    } else if name.contains("gcp") || name.contains("google") {
        CloudProvider::Gcp
    } else if name.contains("oci") || name.contains("oracle") {
        CloudProvider::Oci
    } else {
        CloudProvider::Unknown
    }
}

// ----------------------------------------------------------------------------
// 7.4 Service Category Classification
// ----------------------------------------------------------------------------

/// Classify a computer group into a service category. A group matching any
/// configured selector (case-insensitive substring) is a common service;
/// everything else, including a missing group, belongs to mission partners.
pub fn classify_service_category(group: Option<&str>, selectors: &[String]) -> ServiceCategory {
    let group = match group {
        Some(g) if !g.trim().is_empty() => g.to_lowercase(),
        _ => return ServiceCategory::MissionPartners,
    };
    if selectors
        .iter()
        .any(|s| group.contains(&s.to_lowercase()))
    {
        ServiceCategory::CommonServices
    } else {
        ServiceCategory::MissionPartners
    }
}

// ============================================================================
// SECTION 8: CSV INGESTION
// ============================================================================
// Reads raw usage exports from a directory of CSV files:
// - Case-insensitive header resolution with two timestamp layouts
//   (split date+time columns, or combined start/stop columns)
// - Per-row timestamp parsing across the formats seen in real exports
// - Filename-derived environment and cloud provider hints
// - Per-file failures are logged and skipped; an empty directory is fatal
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Raw Row Model
// ----------------------------------------------------------------------------

/// One usage row as read from disk, before classification and filtering.
#[derive(Debug, Clone)]
pub struct RawUsageRow {
    pub host: HostId,
    pub group: Option<String>,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    /// Duration column value, when the export carries one.
    pub duration_secs: Option<f64>,
    pub modules: ModuleFlags,
    /// Environment hint from the source filename, if any.
    pub source_env: Option<Environment>,
    /// Cloud provider derived from the source filename.
    pub cloud: CloudProvider,
}

// ----------------------------------------------------------------------------
// 8.2 Header Resolution
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum DateColumns {
    /// Separate "Start Date"/"Start Time" and "Stop Date"/"Stop Time" columns.
    Split {
        start_date: usize,
        start_time: usize,
        stop_date: usize,
        stop_time: usize,
    },
    /// Combined "Start" and optional "Stop" timestamp columns.
    Combined { start: usize, stop: Option<usize> },
}

#[derive(Debug)]
struct ColumnMap {
    hostname: usize,
    group: Option<usize>,
    dates: DateColumns,
    duration: Option<usize>,
    modules: [Option<usize>; MODULE_COUNT],
}

impl ColumnMap {
    fn resolve(file: &Path, headers: &csv::StringRecord) -> Result<Self, IngestError> {
        let mut index: AHashMap<String, usize> = AHashMap::new();
        for (i, name) in headers.iter().enumerate() {
            index.entry(name.trim().to_lowercase()).or_insert(i);
        }
        let file_name = file.display().to_string();

        let hostname = *index.get("hostname").ok_or_else(|| IngestError::MissingColumn {
            file: file_name.clone(),
            column: "Hostname".to_string(),
        })?;
        let group = index.get("computer group").copied();

        let dates = match (
            index.get("start date"),
            index.get("start time"),
            index.get("stop date"),
            index.get("stop time"),
        ) {
            (Some(&sd), Some(&st), Some(&ed), Some(&et)) => DateColumns::Split {
                start_date: sd,
                start_time: st,
                stop_date: ed,
                stop_time: et,
            },
            _ => match index.get("start") {
                Some(&start) => DateColumns::Combined {
                    start,
                    stop: index.get("stop").copied(),
                },
                None => return Err(IngestError::NoDateColumns { file: file_name }),
            },
        };

        let duration = index.get("duration (seconds)").copied();

        let mut modules = [None; MODULE_COUNT];
        for (slot, name) in modules.iter_mut().zip(MODULE_NAMES.iter()) {
            *slot = index.get(&name.to_lowercase()).copied();
        }

        Ok(ColumnMap {
            hostname,
            group,
            dates,
            duration,
            modules,
        })
    }
}

// ----------------------------------------------------------------------------
// 8.3 Field Parsing
// ----------------------------------------------------------------------------

/// Timestamp layouts accepted in export files, tried in order.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y"];

/// Parse a timestamp string, trying RFC 3339 first, then the known
/// datetime layouts, then bare dates (interpreted as midnight). All
/// timestamps are treated as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

/// A module column marks the module as in use only when its value is 1.
fn module_flag(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.parse::<f64>().map(|v| v == 1.0).unwrap_or(false)
}

fn field<'r>(record: &'r csv::StringRecord, idx: usize) -> &'r str {
    record.get(idx).unwrap_or("")
}

// ----------------------------------------------------------------------------
// 8.4 File & Directory Loading
// ----------------------------------------------------------------------------

fn load_csv_file(path: &Path) -> Result<Vec<RawUsageRow>, IngestError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let source_env = environment_from_filename(&file_name);
    let cloud = cloud_provider_from_filename(&file_name);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| IngestError::ReadFailed {
            file: path.display().to_string(),
            message: e.to_string(),
        })?;

    let headers = reader
        .headers()
        .map_err(|e| IngestError::ReadFailed {
            file: path.display().to_string(),
            message: e.to_string(),
        })?
        .clone();
    let columns = ColumnMap::resolve(path, &headers)?;

    let mut rows = Vec::new();
    let mut skipped = 0usize;

    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };

        let host = field(&record, columns.hostname).trim();
        if host.is_empty() {
            skipped += 1;
            continue;
        }

        let start = match &columns.dates {
            DateColumns::Split {
                start_date,
                start_time,
                ..
            } => parse_timestamp(&format!(
                "{} {}",
                field(&record, *start_date).trim(),
                field(&record, *start_time).trim()
            )),
            DateColumns::Combined { start, .. } => parse_timestamp(field(&record, *start)),
        };

        let stop = match &columns.dates {
            DateColumns::Split {
                stop_date,
                stop_time,
                ..
            } => parse_timestamp(&format!(
                "{} {}",
                field(&record, *stop_date).trim(),
                field(&record, *stop_time).trim()
            )),
            DateColumns::Combined { stop, .. } => {
                stop.and_then(|idx| parse_timestamp(field(&record, idx)))
            }
        };

        let duration_secs = columns
            .duration
            .and_then(|idx| field(&record, idx).trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0);

        let start = match start {
            Some(s) => s,
            None => {
                skipped += 1;
                continue;
            }
        };
        // A missing stop can be reconstructed from the duration column.
        let stop = match (stop, duration_secs) {
            (Some(s), _) => s,
            (None, Some(d)) => start + chrono::Duration::seconds(d.round() as i64),
            (None, None) => {
                skipped += 1;
                continue;
            }
        };

        let mut modules = ModuleFlags::empty();
        for (bit, idx) in columns.modules.iter().enumerate() {
            if let Some(idx) = idx {
                if module_flag(field(&record, *idx)) {
                    modules.set(bit);
                }
            }
        }

        let group = columns
            .group
            .map(|idx| field(&record, idx).trim().to_string())
            .filter(|g| !g.is_empty());

        rows.push(RawUsageRow {
            host: HostId::from(host),
            group,
            start,
            stop,
            duration_secs,
            modules,
            source_env,
            cloud,
        });
    }

    if skipped > 0 {
        warn!(
            file = %path.display(),
            skipped,
            "Skipped unparseable rows in input file"
        );
    }

    Ok(rows)
}

/// Load every CSV file in a directory into raw usage rows.
///
/// File-level failures (unreadable file, missing required columns) are
/// logged and skipped so one bad export cannot sink a whole run. A
/// directory with no CSV files at all is an error.
pub fn load_directory(dir: &Path) -> Result<Vec<RawUsageRow>, IngestError> {
    let entries = fs::read_dir(dir).map_err(|e| IngestError::ReadFailed {
        file: dir.display().to_string(),
        message: e.to_string(),
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("csv"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(IngestError::NoInputFiles {
            dir: dir.display().to_string(),
        });
    }

    let mut rows = Vec::new();
    for file in &files {
        match load_csv_file(file) {
            Ok(mut file_rows) => {
                info!(
                    file = %file.display(),
                    rows = file_rows.len(),
                    "Loaded input file"
                );
                rows.append(&mut file_rows);
            }
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Skipping input file");
            }
        }
    }

    info!(
        files = files.len(),
        rows = rows.len(),
        "Finished loading input directory"
    );
    Ok(rows)
}

// ============================================================================
// SECTION 9: PREPROCESSOR
// ============================================================================
// Turns raw rows into clean, classified usage records:
// - Environment / cloud / service category classification per row
// - Duration reconciliation between the duration column and the interval
// - Invalid-interval rejection and exact-duplicate removal
// - Optional analysis window filter with interval clipping
// - Final service category resolution per host
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Record Construction & Cleaning
// ----------------------------------------------------------------------------

/// Convert raw rows into classified usage records and apply the cleaning
/// pipeline. Returns an error only when nothing survives cleaning.
pub fn preprocess(
    rows: Vec<RawUsageRow>,
    config: &EngineConfig,
) -> Result<Vec<UsageRecord>, IngestError> {
    let total = rows.len();
    let mut records = Vec::with_capacity(total);
    let mut invalid_intervals = 0usize;
    let mut duration_mismatches = 0usize;

    for row in rows {
        if row.stop < row.start {
            invalid_intervals += 1;
            continue;
        }

        let interval_secs = (row.stop - row.start).num_seconds() as f64;
        // The duration column is authoritative when present; the interval is
        // the fallback. Disagreements beyond tolerance are counted, not fixed.
        let duration_secs = match row.duration_secs {
            Some(d) => {
                if (d - interval_secs).abs() > DURATION_MISMATCH_TOLERANCE_SECS {
                    duration_mismatches += 1;
                }
                d
            }
            None => interval_secs,
        };

        let environment = classify_environment(&row.host, row.source_env);
        let service_category =
            classify_service_category(row.group.as_deref(), &config.classifier.common_services_selectors);
        let has_modules = row.modules.any();

        records.push(UsageRecord {
            host: row.host,
            start: row.start,
            stop: row.stop,
            duration_secs,
            modules: row.modules,
            has_modules,
            environment,
            cloud_provider: row.cloud,
            service_category,
        });
    }

    if invalid_intervals > 0 {
        warn!(
            count = invalid_intervals,
            "Dropped records with stop before start"
        );
    }
    if duration_mismatches > 0 {
        warn!(
            count = duration_mismatches,
            tolerance_secs = DURATION_MISMATCH_TOLERANCE_SECS,
            "Duration column disagrees with interval length"
        );
    }

    let before_dedup = records.len();
    dedup_exact(&mut records);
    let duplicates = before_dedup - records.len();
    if duplicates > 0 {
        info!(count = duplicates, "Removed exact duplicate records");
    }

    let before_filter = records.len();
    apply_analysis_window(&mut records, &config.analysis);
    let filtered = before_filter - records.len();
    if filtered > 0 {
        info!(count = filtered, "Records outside the analysis window");
    }

    if records.is_empty() {
        return Err(IngestError::NoValidRecords);
    }

    info!(
        raw = total,
        clean = records.len(),
        hosts = records.iter().map(|r| r.host.as_str()).collect::<AHashSet<_>>().len(),
        "Preprocessing complete"
    );
    Ok(records)
}

/// Remove exact duplicates, keeping first occurrence order.
fn dedup_exact(records: &mut Vec<UsageRecord>) {
    let mut seen: AHashSet<(
        HostId,
        i64,
        i64,
        u64,
        u16,
        Environment,
        CloudProvider,
        ServiceCategory,
    )> = AHashSet::with_capacity(records.len());
    records.retain(|r| {
        seen.insert((
            r.host.clone(),
            r.start.timestamp(),
            r.stop.timestamp(),
            r.duration_secs.to_bits(),
            r.modules.bits(),
            r.environment,
            r.cloud_provider,
            r.service_category,
        ))
    });
}

// ----------------------------------------------------------------------------
// 9.2 Analysis Window
// ----------------------------------------------------------------------------

/// Drop records entirely outside the configured window and clip the rest to
/// it. The end date is inclusive: the window extends to the last second of
/// that day. Durations are recomputed only for records that were clipped.
fn apply_analysis_window(records: &mut Vec<UsageRecord>, analysis: &AnalysisConfig) {
    let window_start = analysis
        .start_date
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive));
    let window_end = analysis
        .end_date
        .and_then(|d| d.succ_opt())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive) - chrono::Duration::seconds(1));

    if window_start.is_none() && window_end.is_none() {
        return;
    }

    records.retain_mut(|r| {
        if let Some(ws) = window_start {
            if r.stop < ws {
                return false;
            }
        }
        if let Some(we) = window_end {
            if r.start > we {
                return false;
            }
        }
        let mut clipped = false;
        if let Some(ws) = window_start {
            if r.start < ws {
                r.start = ws;
                clipped = true;
            }
        }
        if let Some(we) = window_end {
            if r.stop > we {
                r.stop = we;
                clipped = true;
            }
        }
        if clipped {
            r.duration_secs = (r.stop - r.start).num_seconds() as f64;
        }
        true
    });
}

// ----------------------------------------------------------------------------
// 9.3 Final Service Category Resolution
// ----------------------------------------------------------------------------

/// Give every host a single service category: the category of its record
/// with the latest stop time. Without this a host whose group membership
/// changed mid-period would be counted as activated in both categories,
/// breaking the identity that per-category activated counts sum to the
/// overall activated count.
///
/// Returns the number of hosts whose records were rewritten.
pub fn resolve_final_service_categories(records: &mut [UsageRecord]) -> usize {
    let mut latest: AHashMap<HostId, (DateTime<Utc>, ServiceCategory)> = AHashMap::new();
    for r in records.iter() {
        match latest.get(&r.host) {
            Some((stop, _)) if *stop >= r.stop => {}
            _ => {
                latest.insert(r.host.clone(), (r.stop, r.service_category));
            }
        }
    }

    let mut rewritten: AHashSet<HostId> = AHashSet::new();
    for r in records.iter_mut() {
        let (_, category) = latest[&r.host];
        if r.service_category != category {
            r.service_category = category;
            rewritten.insert(r.host.clone());
        }
    }

    if !rewritten.is_empty() {
        debug!(
            hosts = rewritten.len(),
            "Resolved hosts to a single service category"
        );
    }
    rewritten.len()
}

// ============================================================================
// SECTION 10: FOUNDATION TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Parse a timestamp literal, panicking on bad test input.
    pub fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    /// Build a usage record with sensible defaults: Production / AWS /
    /// mission partners, duration derived from the interval.
    pub fn record(host: &str, start: &str, stop: &str, module_bits: u16) -> UsageRecord {
        let start = ts(start);
        let stop = ts(stop);
        let modules = ModuleFlags::from_bits(module_bits);
        UsageRecord {
            host: HostId::from(host),
            start,
            stop,
            duration_secs: (stop - start).num_seconds() as f64,
            has_modules: modules.any(),
            modules,
            environment: Environment::Production,
            cloud_provider: CloudProvider::Aws,
            service_category: ServiceCategory::MissionPartners,
        }
    }

    pub fn raw(host: &str, start: &str, stop: &str, module_bits: u16) -> RawUsageRow {
        RawUsageRow {
            host: HostId::from(host),
            group: None,
            start: ts(start),
            stop: ts(stop),
            duration_secs: None,
            modules: ModuleFlags::from_bits(module_bits),
            source_env: None,
            cloud: CloudProvider::Unknown,
        }
    }
}


#[cfg(test)]
mod ingest_tests {
    use super::testutil::ts;
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_split_date_columns() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "aws_prod_usage.csv",
            "Hostname,Computer Group,Start Date,Start Time,Stop Date,Stop Time,Duration (Seconds),AM,WRS\n\
             web-01,Shared Core,2025-01-01,08:00:00,2025-01-01,18:00:00,36000,1,0\n",
        );

        let rows = load_directory(dir.path()).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.host, "web-01");
        assert_eq!(row.group.as_deref(), Some("Shared Core"));
        assert_eq!(row.start, ts("2025-01-01 08:00:00"));
        assert_eq!(row.stop, ts("2025-01-01 18:00:00"));
        assert_eq!(row.duration_secs, Some(36000.0));
        assert!(row.modules.is_set(0));
        assert!(!row.modules.is_set(1));
        assert_eq!(row.source_env, Some(Environment::Production));
        assert_eq!(row.cloud, CloudProvider::Aws);
    }

    #[test]
    fn loads_combined_date_columns_and_headers_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "usage.csv",
            "HOSTNAME,start,stop,am\n\
             db-01,2025-03-01 00:00:00,2025-03-02 00:00:00,1\n",
        );

        let rows = load_directory(dir.path()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].host, "db-01");
        assert_eq!(rows[0].stop, ts("2025-03-02 00:00:00"));
        assert!(rows[0].modules.is_set(0));
        assert_eq!(rows[0].source_env, None);
        assert_eq!(rows[0].cloud, CloudProvider::Unknown);
    }

    #[test]
    fn missing_stop_is_reconstructed_from_duration() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "usage.csv",
            "Hostname,Start,Duration (Seconds),AM\n\
             app-01,2025-03-01 00:00:00,7200,1\n",
        );

        let rows = load_directory(dir.path()).unwrap();
        assert_eq!(rows[0].stop, ts("2025-03-01 02:00:00"));
    }

    #[test]
    fn unparseable_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "usage.csv",
            "Hostname,Start,Stop,AM\n\
             ,2025-03-01 00:00:00,2025-03-02 00:00:00,1\n\
             ok-host,not-a-date,2025-03-02 00:00:00,1\n\
             good-host,2025-03-01 00:00:00,2025-03-02 00:00:00,1\n",
        );

        let rows = load_directory(dir.path()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].host, "good-host");
    }

    #[test]
    fn file_without_required_columns_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "bad.csv", "Name,Value\nx,1\n");
        write_file(
            dir.path(),
            "good.csv",
            "Hostname,Start,Stop,AM\nh1,2025-03-01 00:00:00,2025-03-02 00:00:00,1\n",
        );

        let rows = load_directory(dir.path()).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn empty_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_directory(dir.path()).unwrap_err();
        assert!(matches!(err, IngestError::NoInputFiles { .. }));
    }

    #[test]
    fn non_one_module_values_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "usage.csv",
            "Hostname,Start,Stop,AM,WRS,DC\n\
             h1,2025-03-01 00:00:00,2025-03-02 00:00:00,0,yes,1.0\n",
        );

        let rows = load_directory(dir.path()).unwrap();
        assert!(!rows[0].modules.is_set(0));
        assert!(!rows[0].modules.is_set(1));
        assert!(rows[0].modules.is_set(2));
    }
}

// ============================================================================
// SECTION 11: CONCURRENCY CALCULATOR
// ============================================================================
// Sweep-line maximum-overlap computation over usage intervals. Concurrency
// here is the domain notion (how many host intervals are open at once), not
// anything to do with threads.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Sweep Line
// ----------------------------------------------------------------------------

/// Maximum number of simultaneously open usage intervals.
///
/// Each record contributes a +1 event at its (optionally clipped) start and
/// a -1 event at its stop. Events are sorted by timestamp with stops before
/// starts at ties, which makes the result deterministic and independent of
/// input order, and treats intervals as half-open: a stop and a start at the
/// same instant do not overlap.
pub fn max_concurrent_usage<'a, I>(
    records: I,
    clip_start: Option<DateTime<Utc>>,
    clip_stop: Option<DateTime<Utc>>,
) -> u32
where
    I: IntoIterator<Item = &'a UsageRecord>,
{
    let mut events: Vec<(i64, i32)> = Vec::new();
    for r in records {
        let mut start = r.start;
        let mut stop = r.stop;
        if let Some(cs) = clip_start {
            start = start.max(cs);
        }
        if let Some(ce) = clip_stop {
            stop = stop.min(ce);
        }
        if start <= stop {
            events.push((start.timestamp(), 1));
            events.push((stop.timestamp(), -1));
        }
    }

    events.sort_unstable();

    let mut current: i64 = 0;
    let mut max_concurrent: i64 = 0;
    for (_, delta) in events {
        current += i64::from(delta);
        max_concurrent = max_concurrent.max(current);
    }
    max_concurrent as u32
}

// ============================================================================
// SECTION 12: SLICE METRICS
// ============================================================================
// Per-slice aggregation over an arbitrary subset of records:
// - Threshold-based host activation
// - Hour totals split by module activity
// - Record-level module usage counts and pairwise module correlation
// - Environment-style slices add percentages, concurrency, and averages
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Host Activation
// ----------------------------------------------------------------------------

/// Hosts whose accumulated module-active duration within this record set
/// meets the activation threshold. Exact equality activates.
pub fn activated_hosts<'a>(records: &[&'a UsageRecord], threshold_secs: f64) -> AHashSet<&'a str> {
    let mut module_time: AHashMap<&str, f64> = AHashMap::new();
    for r in records.iter().filter(|r| r.has_modules) {
        *module_time.entry(r.host.as_str()).or_insert(0.0) += r.duration_secs;
    }
    module_time
        .into_iter()
        .filter(|(_, secs)| *secs >= threshold_secs)
        .map(|(host, _)| host)
        .collect()
}

// ----------------------------------------------------------------------------
// 12.2 Base Slice Metrics
// ----------------------------------------------------------------------------

/// Metrics common to every slice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SliceMetrics {
    pub total_instances: u64,
    pub activated_instances: u64,
    pub inactive_instances: u64,
    pub total_hours: f64,
    pub activated_hours: f64,
    pub inactive_hours: f64,
    /// Per-module count of records with the flag set (record-level, not
    /// deduplicated by host).
    pub module_usage: BTreeMap<String, u64>,
    /// Pairwise Pearson correlation between module flag columns. Empty for
    /// slices with fewer than two records.
    pub correlation_matrix: BTreeMap<String, BTreeMap<String, f64>>,
}

impl SliceMetrics {
    /// Compute the base metrics for a slice. An empty slice yields zeroed
    /// counts and empty structures.
    pub fn compute(records: &[&UsageRecord], threshold_secs: f64) -> Self {
        let mut module_usage: BTreeMap<String, u64> =
            MODULE_NAMES.iter().map(|m| (m.to_string(), 0)).collect();
        if records.is_empty() {
            return SliceMetrics {
                module_usage,
                ..SliceMetrics::default()
            };
        }

        let total_hosts: AHashSet<&str> = records.iter().map(|r| r.host.as_str()).collect();
        let activated = activated_hosts(records, threshold_secs);

        let total_hours: f64 = records.iter().map(|r| r.hours()).sum();
        let activated_hours: f64 = records
            .iter()
            .filter(|r| r.has_modules)
            .map(|r| r.hours())
            .sum();

        for r in records {
            for name in r.modules.iter_names() {
                *module_usage.entry(name.to_string()).or_insert(0) += 1;
            }
        }

        SliceMetrics {
            total_instances: total_hosts.len() as u64,
            activated_instances: activated.len() as u64,
            inactive_instances: (total_hosts.len() - activated.len()) as u64,
            total_hours,
            activated_hours,
            inactive_hours: total_hours - activated_hours,
            module_usage,
            correlation_matrix: module_correlation_matrix(records),
        }
    }

    /// Check the arithmetic invariants of a computed slice, logging any
    /// violation as a warning. The document is still emitted either way.
    pub fn validate(&self, slice_name: &str) {
        if self.total_instances != self.activated_instances + self.inactive_instances {
            warn!(
                slice = slice_name,
                total = self.total_instances,
                activated = self.activated_instances,
                inactive = self.inactive_instances,
                "Instance counts do not add up"
            );
        }
        if self.total_hours + 1e-6 < self.activated_hours {
            warn!(
                slice = slice_name,
                total_hours = self.total_hours,
                activated_hours = self.activated_hours,
                "Activated hours exceed total hours"
            );
        }
        if self.total_hours < 0.0 || self.activated_hours < 0.0 || self.inactive_hours < -1e-6 {
            warn!(slice = slice_name, "Negative hour totals");
        }
    }
}

// ----------------------------------------------------------------------------
// 12.3 Module Correlation
// ----------------------------------------------------------------------------

/// Pearson correlation between every pair of module flag columns.
///
/// Flags are 0/1, so all the sums reduce to counts: with n records, c_i
/// records flagging module i, and p_ij records flagging both, the
/// correlation is (n*p_ij - c_i*c_j) / sqrt((n*c_i - c_i^2)(n*c_j - c_j^2)).
/// A constant column has zero variance; its entries are reported as 0.0 so
/// the output stays plain JSON numbers.
fn module_correlation_matrix(
    records: &[&UsageRecord],
) -> BTreeMap<String, BTreeMap<String, f64>> {
    if records.len() < 2 {
        return BTreeMap::new();
    }

    let n = records.len() as f64;
    let mut counts = [0.0_f64; MODULE_COUNT];
    let mut pair_counts = [[0.0_f64; MODULE_COUNT]; MODULE_COUNT];
    for r in records {
        for i in r.modules.iter_set() {
            counts[i] += 1.0;
            for j in r.modules.iter_set() {
                pair_counts[i][j] += 1.0;
            }
        }
    }

    let mut matrix = BTreeMap::new();
    for (i, name_i) in MODULE_NAMES.iter().enumerate() {
        let mut row = BTreeMap::new();
        for (j, name_j) in MODULE_NAMES.iter().enumerate() {
            let var_i = n * counts[i] - counts[i] * counts[i];
            let var_j = n * counts[j] - counts[j] * counts[j];
            let denom = (var_i * var_j).sqrt();
            let r = if denom > 0.0 {
                (n * pair_counts[i][j] - counts[i] * counts[j]) / denom
            } else {
                0.0
            };
            row.insert(name_j.to_string(), r);
        }
        matrix.insert(name_i.to_string(), row);
    }
    matrix
}

// ----------------------------------------------------------------------------
// 12.4 Environment-Style Slice Metrics
// ----------------------------------------------------------------------------

/// Base metrics plus the per-slice extras reported for environment, cloud,
/// and category breakdowns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvSliceMetrics {
    #[serde(flatten)]
    pub base: SliceMetrics,
    /// Unique-host usage per module as a percentage of hosts in the slice.
    pub module_usage_percentage: BTreeMap<String, f64>,
    /// Module with the widest unique-host usage; "None" when nothing is used.
    pub most_common_module: String,
    /// Mean per-record count of set module flags.
    pub avg_modules_per_host: f64,
    pub max_concurrent: u32,
    pub total_utilization_hours: f64,
}

impl EnvSliceMetrics {
    pub fn compute(records: &[&UsageRecord], threshold_secs: f64) -> Self {
        let base = SliceMetrics::compute(records, threshold_secs);

        let mut hosts_per_module: Vec<AHashSet<&str>> =
            vec![AHashSet::new(); MODULE_COUNT];
        for r in records {
            for i in r.modules.iter_set() {
                hosts_per_module[i].insert(r.host.as_str());
            }
        }

        let total_hosts = base.total_instances;
        let module_usage_percentage: BTreeMap<String, f64> = MODULE_NAMES
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let pct = if total_hosts > 0 {
                    hosts_per_module[i].len() as f64 / total_hosts as f64 * 100.0
                } else {
                    0.0
                };
                (name.to_string(), pct)
            })
            .collect();

        // Stable max over the fixed module ordering: the first module with
        // the highest unique-host count wins ties.
        let most_common_module = if hosts_per_module.iter().all(|hosts| hosts.is_empty()) {
            "None".to_string()
        } else {
            let mut best = 0;
            for i in 1..MODULE_COUNT {
                if hosts_per_module[i].len() > hosts_per_module[best].len() {
                    best = i;
                }
            }
            MODULE_NAMES[best].to_string()
        };

        let avg_modules_per_host = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| f64::from(r.modules.count())).sum::<f64>()
                / records.len() as f64
        };

        let total_utilization_hours = base.total_hours;

        EnvSliceMetrics {
            max_concurrent: max_concurrent_usage(records.iter().copied(), None, None),
            module_usage_percentage,
            most_common_module,
            avg_modules_per_host,
            total_utilization_hours,
            base,
        }
    }
}

// ============================================================================
// SECTION 13: MONTHLY TREND CALCULATOR
// ============================================================================
// Calendar-month snapshots of activation state with month-over-month deltas:
// - Within-month thresholded activation
// - Running ever-activated set driving new/lost instance counts
// - Data gap tracking for months with no overlapping records
// - Average of positive month-over-month growth
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Trend Types
// ----------------------------------------------------------------------------

/// One month's activation snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySnapshot {
    /// Month key in "YYYY-MM" form.
    pub month: String,
    /// Hosts meeting the activation threshold within this month's window.
    pub activated_instances: u64,
    /// Activated this month, never activated in any earlier month.
    pub new_instances: u64,
    /// Activated in some earlier month but not in this one.
    pub lost_instances: u64,
    pub max_concurrent: u32,
    pub avg_modules_per_host: f64,
    /// Module-active hours accumulated within the month's record set.
    pub total_hours: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonthlyMetrics {
    /// Snapshots in ascending month order, one per non-empty month.
    pub data: Vec<MonthlySnapshot>,
    /// Months inside the date range with no overlapping records.
    pub data_gaps: Vec<String>,
    pub total_months: usize,
    /// "YYYY-MM to YYYY-MM", empty when there is no data.
    pub date_range: String,
    /// Mean of the positive month-over-month activated-count deltas.
    pub average_monthly_growth: f64,
}

// ----------------------------------------------------------------------------
// 13.2 Trend Computation
// ----------------------------------------------------------------------------

/// Compute monthly trends over every month between the earliest and latest
/// record start, inclusive. A record belongs to a month when its interval
/// overlaps the month window.
pub fn compute_monthly_metrics(records: &[&UsageRecord], threshold_secs: f64) -> MonthlyMetrics {
    let mut metrics = MonthlyMetrics::default();
    if records.is_empty() {
        return metrics;
    }

    let min_start = records.iter().map(|r| r.start).min().unwrap_or_default();
    let max_start = records.iter().map(|r| r.start).max().unwrap_or_default();
    metrics.date_range = format!("{} to {}", month_key(&min_start), month_key(&max_start));

    let mut cumulative: AHashSet<&str> = AHashSet::new();
    let mut previous_count: u64 = 0;
    let mut total_growth: u64 = 0;
    let mut growth_months: u64 = 0;

    for (year, month) in months_spanning(min_start, max_start) {
        let window_start = month_start(year, month);
        let window_end = month_end(year, month);
        let key = month_key(&window_start);

        let month_records: Vec<&UsageRecord> = records
            .iter()
            .copied()
            .filter(|r| r.overlaps(window_start, window_end))
            .collect();

        if month_records.is_empty() {
            metrics.data_gaps.push(key);
            continue;
        }

        let module_active: Vec<&UsageRecord> = month_records
            .iter()
            .copied()
            .filter(|r| r.has_modules)
            .collect();

        let activated_current = activated_hosts(&module_active, threshold_secs);
        let total_hours: f64 = module_active.iter().map(|r| r.hours()).sum();
        let avg_modules_per_host = if module_active.is_empty() {
            0.0
        } else {
            module_active
                .iter()
                .map(|r| f64::from(r.modules.count()))
                .sum::<f64>()
                / module_active.len() as f64
        };
        let max_concurrent = max_concurrent_usage(module_active.iter().copied(), None, None);

        // Deltas against the ever-activated set are taken before the union.
        let new_instances = activated_current.difference(&cumulative).count() as u64;
        let lost_instances = cumulative.difference(&activated_current).count() as u64;
        cumulative.extend(activated_current.iter().copied());

        let current_count = activated_current.len() as u64;
        if current_count > previous_count {
            total_growth += current_count - previous_count;
            growth_months += 1;
        }
        previous_count = current_count;

        metrics.data.push(MonthlySnapshot {
            month: key,
            activated_instances: current_count,
            new_instances,
            lost_instances,
            max_concurrent,
            avg_modules_per_host,
            total_hours,
        });
    }

    if growth_months > 0 {
        metrics.average_monthly_growth = total_growth as f64 / growth_months as f64;
    }
    metrics.data.sort_by(|a, b| a.month.cmp(&b.month));
    metrics.total_months = metrics.data.len();

    if !metrics.data_gaps.is_empty() {
        debug!(
            gaps = metrics.data_gaps.len(),
            range = %metrics.date_range,
            "Months without overlapping records"
        );
    }
    metrics
}

// ============================================================================
// SECTION 14: CALCULATOR TESTS
// ============================================================================

#[cfg(test)]
mod calculator_tests {
    use super::testutil::{record, ts};
    use super::*;
    use pretty_assertions::assert_eq;

    const DAY_SECS: f64 = 24.0 * 3600.0;

    #[test]
    fn concurrency_of_empty_set_is_zero() {
        assert_eq!(
            max_concurrent_usage(std::iter::empty::<&UsageRecord>(), None, None),
            0
        );
    }

    #[test]
    fn concurrency_of_three_overlapping_intervals() {
        // Hours 0-10, 5-15, 12-20 on the same day: at most two open at once.
        let records = vec![
            record("a", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 1),
            record("b", "2025-01-01 05:00:00", "2025-01-01 15:00:00", 1),
            record("c", "2025-01-01 12:00:00", "2025-01-01 20:00:00", 1),
        ];
        assert_eq!(max_concurrent_usage(records.iter(), None, None), 2);
    }

    #[test]
    fn concurrency_treats_touching_intervals_as_disjoint() {
        let records = vec![
            record("a", "2025-01-01 00:00:00", "2025-01-01 05:00:00", 1),
            record("a", "2025-01-01 05:00:00", "2025-01-01 10:00:00", 1),
        ];
        assert_eq!(max_concurrent_usage(records.iter(), None, None), 1);
    }

    #[test]
    fn concurrency_is_order_independent() {
        let mut records = vec![
            record("a", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 1),
            record("b", "2025-01-01 05:00:00", "2025-01-01 15:00:00", 1),
            record("c", "2025-01-01 12:00:00", "2025-01-01 20:00:00", 1),
        ];
        let forward = max_concurrent_usage(records.iter(), None, None);
        records.reverse();
        assert_eq!(max_concurrent_usage(records.iter(), None, None), forward);
    }

    #[test]
    fn concurrency_clips_to_window() {
        // Both intervals overlap only outside the clip window.
        let records = vec![
            record("a", "2025-01-01 00:00:00", "2025-01-01 08:00:00", 1),
            record("b", "2025-01-01 06:00:00", "2025-01-01 20:00:00", 1),
        ];
        let full = max_concurrent_usage(records.iter(), None, None);
        assert_eq!(full, 2);
        let clipped = max_concurrent_usage(
            records.iter(),
            Some(ts("2025-01-01 10:00:00")),
            Some(ts("2025-01-01 20:00:00")),
        );
        assert_eq!(clipped, 1);
    }

    #[test]
    fn activation_threshold_is_inclusive() {
        // Host a accumulates exactly 24h across two records, host b is one
        // second short.
        let records = vec![
            record("a", "2025-01-01 00:00:00", "2025-01-01 12:00:00", 1),
            record("a", "2025-01-02 00:00:00", "2025-01-02 12:00:00", 1),
            record("b", "2025-01-01 00:00:00", "2025-01-01 12:00:00", 1),
            record("b", "2025-01-02 00:00:00", "2025-01-02 11:59:59", 1),
        ];
        let refs: Vec<&UsageRecord> = records.iter().collect();
        let activated = activated_hosts(&refs, DAY_SECS);
        assert!(activated.contains("a"));
        assert!(!activated.contains("b"));
    }

    #[test]
    fn activation_ignores_records_without_modules() {
        let records = vec![record("a", "2025-01-01 00:00:00", "2025-01-03 00:00:00", 0)];
        let refs: Vec<&UsageRecord> = records.iter().collect();
        assert!(activated_hosts(&refs, DAY_SECS).is_empty());
    }

    #[test]
    fn slice_metrics_counts_and_hours() {
        // Host x: 10 module-active hours. Host y: 30 module-active hours.
        let records = vec![
            record("x", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 1),
            record("y", "2025-01-01 00:00:00", "2025-01-02 06:00:00", 3),
        ];
        let refs: Vec<&UsageRecord> = records.iter().collect();
        let metrics = SliceMetrics::compute(&refs, DAY_SECS);

        assert_eq!(metrics.total_instances, 2);
        assert_eq!(metrics.activated_instances, 1);
        assert_eq!(metrics.inactive_instances, 1);
        assert_eq!(metrics.total_hours, 40.0);
        assert_eq!(metrics.activated_hours, 40.0);
        assert_eq!(metrics.inactive_hours, 0.0);
        assert_eq!(metrics.module_usage["AM"], 2);
        assert_eq!(metrics.module_usage["WRS"], 1);
        assert_eq!(metrics.module_usage["FW"], 0);
    }

    #[test]
    fn slice_metrics_on_empty_slice() {
        let metrics = SliceMetrics::compute(&[], DAY_SECS);
        assert_eq!(metrics.total_instances, 0);
        assert_eq!(metrics.activated_instances, 0);
        assert_eq!(metrics.total_hours, 0.0);
        assert!(metrics.correlation_matrix.is_empty());
        assert!(metrics.module_usage.values().all(|&count| count == 0));
    }

    #[test]
    fn correlation_needs_two_records() {
        let records = vec![record("a", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 3)];
        let refs: Vec<&UsageRecord> = records.iter().collect();
        assert!(SliceMetrics::compute(&refs, DAY_SECS)
            .correlation_matrix
            .is_empty());
    }

    #[test]
    fn correlation_of_identical_columns_is_one() {
        // AM and WRS always set together; DC never set with them.
        let records = vec![
            record("a", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 0b011),
            record("b", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 0b100),
        ];
        let refs: Vec<&UsageRecord> = records.iter().collect();
        let matrix = SliceMetrics::compute(&refs, DAY_SECS).correlation_matrix;
        assert!((matrix["AM"]["WRS"] - 1.0).abs() < 1e-9);
        assert!((matrix["AM"]["DC"] + 1.0).abs() < 1e-9);
    }

    #[test]
    fn correlation_of_constant_column_is_zero() {
        // FW is never set; its variance is zero everywhere.
        let records = vec![
            record("a", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 1),
            record("b", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 0),
        ];
        let refs: Vec<&UsageRecord> = records.iter().collect();
        let matrix = SliceMetrics::compute(&refs, DAY_SECS).correlation_matrix;
        assert_eq!(matrix["FW"]["AM"], 0.0);
        assert_eq!(matrix["FW"]["FW"], 0.0);
    }

    #[test]
    fn env_slice_percentages_use_unique_hosts() {
        // Host a flags AM in two records; percentages count it once.
        let records = vec![
            record("a", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 1),
            record("a", "2025-01-02 00:00:00", "2025-01-02 10:00:00", 1),
            record("b", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 0),
        ];
        let refs: Vec<&UsageRecord> = records.iter().collect();
        let metrics = EnvSliceMetrics::compute(&refs, DAY_SECS);

        assert_eq!(metrics.base.module_usage["AM"], 2);
        assert_eq!(metrics.module_usage_percentage["AM"], 50.0);
        assert_eq!(metrics.most_common_module, "AM");
        assert_eq!(metrics.total_utilization_hours, 30.0);
        assert!((metrics.avg_modules_per_host - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn most_common_module_tie_breaks_by_order() {
        // AM and WRS each used by one host; AM comes first in the fixed
        // module ordering.
        let records = vec![
            record("a", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 0b10),
            record("b", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 0b01),
        ];
        let refs: Vec<&UsageRecord> = records.iter().collect();
        assert_eq!(EnvSliceMetrics::compute(&refs, DAY_SECS).most_common_module, "AM");
    }

    #[test]
    fn most_common_module_none_sentinel() {
        let records = vec![record("a", "2025-01-01 00:00:00", "2025-01-01 10:00:00", 0)];
        let refs: Vec<&UsageRecord> = records.iter().collect();
        assert_eq!(EnvSliceMetrics::compute(&refs, DAY_SECS).most_common_module, "None");
    }

    #[test]
    fn monthly_metrics_empty_input() {
        let metrics = compute_monthly_metrics(&[], DAY_SECS);
        assert!(metrics.data.is_empty());
        assert_eq!(metrics.date_range, "");
        assert_eq!(metrics.total_months, 0);
    }

    #[test]
    fn monthly_lost_instance_scenario() {
        // Host z activated in January only; host w keeps February non-empty
        // without meeting the threshold.
        let records = vec![
            record("z", "2025-01-05 00:00:00", "2025-01-07 00:00:00", 1),
            record("w", "2025-02-10 00:00:00", "2025-02-10 06:00:00", 1),
        ];
        let refs: Vec<&UsageRecord> = records.iter().collect();
        let metrics = compute_monthly_metrics(&refs, DAY_SECS);

        assert_eq!(metrics.date_range, "2025-01 to 2025-02");
        assert_eq!(metrics.total_months, 2);
        let jan = &metrics.data[0];
        assert_eq!(jan.month, "2025-01");
        assert_eq!(jan.activated_instances, 1);
        assert_eq!(jan.new_instances, 1);
        assert_eq!(jan.lost_instances, 0);
        let feb = &metrics.data[1];
        assert_eq!(feb.month, "2025-02");
        assert_eq!(feb.activated_instances, 0);
        assert_eq!(feb.new_instances, 0);
        assert_eq!(feb.lost_instances, 1);
    }

    #[test]
    fn monthly_data_gap_between_active_months() {
        let records = vec![
            record("a", "2025-01-05 00:00:00", "2025-01-07 00:00:00", 1),
            record("a", "2025-03-05 00:00:00", "2025-03-07 00:00:00", 1),
        ];
        let refs: Vec<&UsageRecord> = records.iter().collect();
        let metrics = compute_monthly_metrics(&refs, DAY_SECS);
        assert_eq!(metrics.data_gaps, vec!["2025-02".to_string()]);
        assert_eq!(metrics.total_months, 2);
        // Host a is not new again in March.
        assert_eq!(metrics.data[1].new_instances, 0);
        assert_eq!(metrics.data[1].lost_instances, 0);
    }

    #[test]
    fn monthly_growth_averages_positive_deltas_only() {
        // January: a, b activated (growth +2). February: only a (no growth).
        // March: a, b, c (growth +2). Average = 2.0.
        let mut records = Vec::new();
        for host in ["a", "b"] {
            records.push(record(host, "2025-01-05 00:00:00", "2025-01-07 00:00:00", 1));
        }
        records.push(record("a", "2025-02-05 00:00:00", "2025-02-07 00:00:00", 1));
        for host in ["a", "b", "c"] {
            records.push(record(host, "2025-03-05 00:00:00", "2025-03-07 00:00:00", 1));
        }
        let refs: Vec<&UsageRecord> = records.iter().collect();
        let metrics = compute_monthly_metrics(&refs, DAY_SECS);

        let counts: Vec<u64> = metrics.data.iter().map(|m| m.activated_instances).collect();
        assert_eq!(counts, vec![2, 1, 3]);
        assert_eq!(metrics.average_monthly_growth, 2.0);
    }

    #[test]
    fn monthly_record_spanning_two_months_counts_in_both() {
        // Host a's interval crosses the month boundary; host b anchors the
        // enumerated range into February.
        let records = vec![
            record("a", "2025-01-20 00:00:00", "2025-02-10 00:00:00", 1),
            record("b", "2025-02-15 00:00:00", "2025-02-15 06:00:00", 0),
        ];
        let refs: Vec<&UsageRecord> = records.iter().collect();
        let metrics = compute_monthly_metrics(&refs, DAY_SECS);
        assert_eq!(metrics.total_months, 2);
        // The spanning record is attributed to both months it overlaps.
        assert_eq!(metrics.data[0].activated_instances, 1);
        assert_eq!(metrics.data[1].activated_instances, 1);
    }
}

// ============================================================================
// SECTION 15: AGGREGATION ORCHESTRATOR
// ============================================================================
// Slices the record set along every reported dimension and assembles the
// final metrics document. Slices over different values of one dimension are
// independent, so each dimension's slices are computed on the rayon pool and
// joined only at document assembly.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Document Types
// ----------------------------------------------------------------------------

/// The whole-dataset slice plus activation distributions per label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallSlice {
    #[serde(flatten)]
    pub base: SliceMetrics,
    /// Environment label -> activated instance count, zero counts omitted.
    pub environment_distribution: BTreeMap<String, u64>,
    /// Cloud provider label -> activated instance count, zero counts omitted.
    pub cloud_provider_distribution: BTreeMap<String, u64>,
}

/// Host-level summary block computed from set arithmetic over the whole
/// dataset (or one category), never by summing slices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallTotals {
    pub max_concurrent_overall: u32,
    pub total_unique_instances: u64,
    pub total_activated_instances: u64,
    pub total_inactive_instances: u64,
}

/// Per-cloud-provider slice with its own monthly breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudProviderSlice {
    #[serde(flatten)]
    pub slice: EnvSliceMetrics,
    pub monthly: MonthlyMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryOverall {
    #[serde(flatten)]
    pub base: SliceMetrics,
    pub environment_distribution: BTreeMap<String, u64>,
}

/// Per-service-category slice with full environment and monthly breakdowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySlice {
    pub overall: CategoryOverall,
    pub by_environment: BTreeMap<String, EnvSliceMetrics>,
    pub monthly: MonthlyMetrics,
    pub overall_metrics: OverallTotals,
}

/// The complete output document, the sole interface to downstream reporting.
/// Composite keys join their parts with "::" (e.g. "AWS::Production").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsDocument {
    pub overall: OverallSlice,
    pub by_environment: BTreeMap<String, EnvSliceMetrics>,
    pub by_cloud_provider: BTreeMap<String, CloudProviderSlice>,
    pub by_cloud_and_environment: BTreeMap<String, EnvSliceMetrics>,
    pub by_service_category: BTreeMap<String, CategorySlice>,
    pub by_service_category_and_cloud_provider: BTreeMap<String, EnvSliceMetrics>,
    pub by_service_category_and_cloud_and_env: BTreeMap<String, EnvSliceMetrics>,
    pub overall_metrics: OverallTotals,
    pub monthly: MonthlyMetrics,
}

// ----------------------------------------------------------------------------
// 15.2 Slicing Helpers
// ----------------------------------------------------------------------------

/// Composite document key: parts joined with "::".
pub fn slice_key(parts: &[&str]) -> String {
    parts.join("::")
}

fn group_by<'a, K, F>(records: &[&'a UsageRecord], key: F) -> BTreeMap<K, Vec<&'a UsageRecord>>
where
    K: Ord,
    F: Fn(&UsageRecord) -> K,
{
    let mut groups: BTreeMap<K, Vec<&'a UsageRecord>> = BTreeMap::new();
    for r in records {
        groups.entry(key(r)).or_default().push(*r);
    }
    groups
}

fn env_slices(
    groups: &BTreeMap<String, Vec<&UsageRecord>>,
    threshold_secs: f64,
) -> BTreeMap<String, EnvSliceMetrics> {
    groups
        .par_iter()
        .map(|(label, slice)| (label.clone(), EnvSliceMetrics::compute(slice, threshold_secs)))
        .collect::<Vec<_>>()
        .into_iter()
        .collect()
}

/// Activated-count distribution over a set of computed slices, omitting
/// labels with no activated hosts.
fn activation_distribution(slices: &BTreeMap<String, EnvSliceMetrics>) -> BTreeMap<String, u64> {
    slices
        .iter()
        .filter(|(_, m)| m.base.activated_instances > 0)
        .map(|(label, m)| (label.clone(), m.base.activated_instances))
        .collect()
}

fn overall_totals(records: &[&UsageRecord], threshold_secs: f64) -> OverallTotals {
    let hosts: AHashSet<&str> = records.iter().map(|r| r.host.as_str()).collect();
    let activated = activated_hosts(records, threshold_secs);
    OverallTotals {
        max_concurrent_overall: max_concurrent_usage(records.iter().copied(), None, None),
        total_unique_instances: hosts.len() as u64,
        total_activated_instances: activated.len() as u64,
        total_inactive_instances: (hosts.len() - activated.len()) as u64,
    }
}

// ----------------------------------------------------------------------------
// 15.3 Analyzer
// ----------------------------------------------------------------------------

/// Drives the full aggregation over one preprocessed record set.
pub struct UsageAnalyzer {
    config: EngineConfig,
}

impl UsageAnalyzer {
    pub fn new(config: EngineConfig) -> Self {
        UsageAnalyzer { config }
    }

    /// Compute every slice of the metrics document.
    ///
    /// Hosts are first resolved to a single service category so that the
    /// category dimension partitions the host set; per-category activated
    /// counts then sum to the overall activated count, which is checked at
    /// the end and logged on violation.
    pub fn compute_all_metrics(
        &self,
        mut records: Vec<UsageRecord>,
    ) -> EngineResult<MetricsDocument> {
        if records.is_empty() {
            return Err(EngineError::NoData);
        }
        let threshold_secs = self.config.analysis.activation_min_secs();

        let rewritten = resolve_final_service_categories(&mut records);
        if rewritten > 0 {
            info!(
                hosts = rewritten,
                "Hosts resolved to their most recent service category"
            );
        }

        let all: Vec<&UsageRecord> = records.iter().collect();
        info!(
            records = all.len(),
            threshold_hours = self.config.analysis.activation_min_hours,
            "Computing metrics document"
        );

        // Overall slice
        let overall_base = SliceMetrics::compute(&all, threshold_secs);
        overall_base.validate("overall");

        // Per-environment slices
        let env_groups = group_by(&all, |r| r.environment.as_str().to_string());
        let by_environment = env_slices(&env_groups, threshold_secs);
        let environment_distribution = activation_distribution(&by_environment);

        // Per-cloud-provider slices with their own monthly trends
        let cloud_groups = group_by(&all, |r| r.cloud_provider.as_str().to_string());
        let by_cloud_provider: BTreeMap<String, CloudProviderSlice> = cloud_groups
            .par_iter()
            .map(|(label, slice)| {
                (
                    label.clone(),
                    CloudProviderSlice {
                        slice: EnvSliceMetrics::compute(slice, threshold_secs),
                        monthly: compute_monthly_metrics(slice, threshold_secs),
                    },
                )
            })
            .collect::<Vec<_>>()
            .into_iter()
            .collect();
        let cloud_provider_distribution: BTreeMap<String, u64> = by_cloud_provider
            .iter()
            .filter(|(_, s)| s.slice.base.activated_instances > 0)
            .map(|(label, s)| (label.clone(), s.slice.base.activated_instances))
            .collect();

        // Sparse cloud x environment cross slices
        let cloud_env_groups = group_by(&all, |r| {
            slice_key(&[r.cloud_provider.as_str(), r.environment.as_str()])
        });
        let by_cloud_and_environment = env_slices(&cloud_env_groups, threshold_secs);

        // Service category slices; both categories are always materialized
        let mut by_service_category = BTreeMap::new();
        for category in ServiceCategory::ALL {
            let cat_records: Vec<&UsageRecord> = all
                .iter()
                .copied()
                .filter(|r| r.service_category == category)
                .collect();
            let cat_env_groups = group_by(&cat_records, |r| r.environment.as_str().to_string());
            let cat_by_environment = env_slices(&cat_env_groups, threshold_secs);
            let environment_distribution = activation_distribution(&cat_by_environment);
            by_service_category.insert(
                category.as_str().to_string(),
                CategorySlice {
                    overall: CategoryOverall {
                        base: SliceMetrics::compute(&cat_records, threshold_secs),
                        environment_distribution,
                    },
                    by_environment: cat_by_environment,
                    monthly: compute_monthly_metrics(&cat_records, threshold_secs),
                    overall_metrics: overall_totals(&cat_records, threshold_secs),
                },
            );
        }

        // Sparse category x cloud and category x cloud x environment slices
        let cat_cloud_groups = group_by(&all, |r| {
            slice_key(&[r.service_category.as_str(), r.cloud_provider.as_str()])
        });
        let by_service_category_and_cloud_provider = env_slices(&cat_cloud_groups, threshold_secs);

        let cat_cloud_env_groups = group_by(&all, |r| {
            slice_key(&[
                r.service_category.as_str(),
                r.cloud_provider.as_str(),
                r.environment.as_str(),
            ])
        });
        let by_service_category_and_cloud_and_env =
            env_slices(&cat_cloud_env_groups, threshold_secs);

        let overall_metrics = overall_totals(&all, threshold_secs);

        // The category dimension partitions hosts, so activated counts must
        // sum to the overall count. Anything else is double counting.
        let category_sum: u64 = by_service_category
            .values()
            .map(|c| c.overall.base.activated_instances)
            .sum();
        if category_sum != overall_base.activated_instances {
            warn!(
                category_sum,
                overall = overall_base.activated_instances,
                "Per-category activated counts do not sum to the overall count"
            );
        }

        let monthly = compute_monthly_metrics(&all, threshold_secs);

        info!(
            environments = by_environment.len(),
            cloud_providers = by_cloud_provider.len(),
            months = monthly.total_months,
            "Metrics document assembled"
        );

        Ok(MetricsDocument {
            overall: OverallSlice {
                base: overall_base,
                environment_distribution,
                cloud_provider_distribution,
            },
            by_environment,
            by_cloud_provider,
            by_cloud_and_environment,
            by_service_category,
            by_service_category_and_cloud_provider,
            by_service_category_and_cloud_and_env,
            overall_metrics,
            monthly,
        })
    }
}

// ============================================================================
// SECTION 16: OUTPUT WRITER
// ============================================================================

/// Serialize the metrics document to pretty-printed JSON under the output
/// directory, creating it if needed. Returns the written path.
pub fn write_metrics_json(
    document: &MetricsDocument,
    output_dir: &Path,
) -> EngineResult<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(METRICS_FILE_NAME);
    let json = serde_json::to_string_pretty(document)
        .map_err(|e| EngineError::Serialization(e.to_string()))?;
    fs::write(&path, json)?;
    info!(path = %path.display(), "Wrote metrics document");
    Ok(path)
}

// ============================================================================
// SECTION 17: ORCHESTRATOR TESTS
// ============================================================================


// ============================================================================
// SECTION 18: COMMAND-LINE INTERFACE
// ============================================================================

/// Aegis usage metrics engine
#[derive(Parser, Debug)]
#[command(
    name = ENGINE_NAME,
    version = ENGINE_VERSION,
    about = ENGINE_FULL_NAME,
    long_about = "Aggregates endpoint-security usage exports into activation, \
                  concurrency, and monthly trend metrics."
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "AEGIS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the analysis and write the metrics document
    Run {
        /// Directory of usage export files (overrides configuration)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output directory for the metrics document (overrides configuration)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Analysis window start date (YYYY-MM-DD)
        #[arg(long)]
        start_date: Option<NaiveDate>,

        /// Analysis window end date, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end_date: Option<NaiveDate>,

        /// Activation threshold in hours
        #[arg(long)]
        activation_min_hours: Option<f64>,
    },

    /// Validate the configuration file and exit
    Validate {
        /// Print the resolved configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print a default configuration file
    GenerateConfig {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

// ============================================================================
// SECTION 19: MAIN ENTRY POINT
// ============================================================================

fn load_config(path: &Path) -> AnyhowResult<EngineConfig> {
    // Missing config file is fine; defaults plus environment overrides
    // cover the common case.
    Ok(EngineConfig::load_or_default(path)?)
}

fn run_analysis(config: EngineConfig) -> AnyhowResult<()> {
    init_logging(&config.logging)?;
    info!(
        version = ENGINE_VERSION,
        input = %config.io.input_dir.display(),
        output = %config.io.output_dir.display(),
        "Starting analysis"
    );

    let rows = load_directory(&config.io.input_dir)
        .context("failed to load usage export files")?;
    let records = preprocess(rows, &config).context("no usable usage records")?;

    let output_dir = config.io.output_dir.clone();
    let analyzer = UsageAnalyzer::new(config);
    let document = analyzer.compute_all_metrics(records)?;
    let path = write_metrics_json(&document, &output_dir)?;

    println!(
        "Analyzed {} instances ({} activated) across {} months -> {}",
        document.overall.base.total_instances,
        document.overall.base.activated_instances,
        document.monthly.total_months,
        path.display()
    );
    Ok(())
}

fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("{} {}", ENGINE_FULL_NAME, ENGINE_VERSION);
            Ok(())
        }
        Some(Commands::GenerateConfig { output }) => {
            let template = EngineConfig::generate_default_config();
            match output {
                Some(path) => {
                    fs::write(&path, template)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Wrote default configuration to {}", path.display());
                }
                None => print!("{}", template),
            }
            Ok(())
        }
        Some(Commands::Validate { verbose }) => {
            let config = EngineConfig::load(&cli.config)?;
            config.validate()?;
            println!("Configuration OK: {}", cli.config.display());
            if verbose {
                println!("{:#?}", config);
            }
            Ok(())
        }
        Some(Commands::Run {
            input,
            output,
            start_date,
            end_date,
            activation_min_hours,
        }) => {
            let mut config = load_config(&cli.config)?;
            if let Some(level) = cli.log_level {
                config.logging.level = level;
            }
            if let Some(input) = input {
                config.io.input_dir = input;
            }
            if let Some(output) = output {
                config.io.output_dir = output;
            }
            if let Some(start) = start_date {
                config.analysis.start_date = Some(start);
            }
            if let Some(end) = end_date {
                config.analysis.end_date = Some(end);
            }
            if let Some(hours) = activation_min_hours {
                config.analysis.activation_min_hours = hours;
            }
            config.validate()?;
            run_analysis(config)
        }
        None => {
            let mut config = load_config(&cli.config)?;
            if let Some(level) = cli.log_level {
                config.logging.level = level;
            }
            config.validate()?;
            run_analysis(config)
        }
    }
}

// ============================================================================
// SECTION 20: PROPERTY TESTS
// ============================================================================

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn base_time() -> DateTime<Utc> {
        super::testutil::ts("2025-01-01 00:00:00")
    }

    prop_compose! {
        fn arb_record()(
            host in 0usize..6,
            offset_secs in 0i64..(120 * 24 * 3600),
            len_secs in 0i64..(72 * 3600),
            bits in 0u16..(1 << MODULE_COUNT),
        ) -> UsageRecord {
            let start = base_time() + chrono::Duration::seconds(offset_secs);
            let stop = start + chrono::Duration::seconds(len_secs);
            let modules = ModuleFlags::from_bits(bits);
            UsageRecord {
                host: HostId::from(format!("host-{}", host)),
                start,
                stop,
                duration_secs: len_secs as f64,
                has_modules: modules.any(),
                modules,
                environment: Environment::Production,
                cloud_provider: CloudProvider::Aws,
                service_category: ServiceCategory::MissionPartners,
            }
        }
    }

    proptest! {
        #[test]
        fn concurrency_is_permutation_invariant(
            (records, shuffled) in prop::collection::vec(arb_record(), 0..24)
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            prop_assert_eq!(
                max_concurrent_usage(records.iter(), None, None),
                max_concurrent_usage(shuffled.iter(), None, None)
            );
        }

        #[test]
        fn slice_count_identities_hold(
            records in prop::collection::vec(arb_record(), 0..24)
        ) {
            let refs: Vec<&UsageRecord> = records.iter().collect();
            let m = SliceMetrics::compute(&refs, 24.0 * SECONDS_PER_HOUR);
            prop_assert_eq!(
                m.total_instances,
                m.activated_instances + m.inactive_instances
            );
            prop_assert!(m.total_hours >= m.activated_hours);
            prop_assert!(m.activated_hours >= 0.0);
            prop_assert!(
                (m.inactive_hours - (m.total_hours - m.activated_hours)).abs() < 1e-9
            );
        }

        #[test]
        fn monthly_snapshots_sorted_and_deltas_consistent(
            records in prop::collection::vec(arb_record(), 1..24)
        ) {
            let refs: Vec<&UsageRecord> = records.iter().collect();
            let m = compute_monthly_metrics(&refs, SECONDS_PER_HOUR);
            prop_assert_eq!(m.total_months, m.data.len());
            for pair in m.data.windows(2) {
                prop_assert!(pair[0].month < pair[1].month);
            }
            // new_instances accumulate into the ever-activated set; a month
            // can neither report nor lose more hosts than that set holds.
            let mut ever_activated = 0u64;
            for snapshot in &m.data {
                ever_activated += snapshot.new_instances;
                prop_assert!(snapshot.activated_instances <= ever_activated);
                prop_assert!(snapshot.lost_instances <= ever_activated);
            }
        }

        #[test]
        fn category_partition_sums_to_overall(
            mut records in prop::collection::vec(arb_record(), 1..24),
            categories in prop::collection::vec(any::<bool>(), 24)
        ) {
            for (r, common) in records.iter_mut().zip(categories.iter()) {
                r.service_category = if *common {
                    ServiceCategory::CommonServices
                } else {
                    ServiceCategory::MissionPartners
                };
            }
            let analyzer = UsageAnalyzer::new(EngineConfig::default());
            let doc = analyzer.compute_all_metrics(records).unwrap();
            let category_sum: u64 = doc
                .by_service_category
                .values()
                .map(|c| c.overall.base.activated_instances)
                .sum();
            prop_assert_eq!(category_sum, doc.overall.base.activated_instances);
            let total_sum: u64 = doc
                .by_service_category
                .values()
                .map(|c| c.overall.base.total_instances)
                .sum();
            prop_assert_eq!(total_sum, doc.overall.base.total_instances);
        }
    }
}
