//! # Engine Configuration
//!
//! Store-level settings for the engine services and the agent.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     COMANDA_TENANT_ID=...                                              │
//! │     COMANDA_DB_PATH=/var/lib/comanda/comanda.db                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     $COMANDA_CONFIG, or                                                │
//! │     ~/.config/comanda/comanda.toml (Linux)                             │
//! │     ~/Library/Application Support/com.comanda.pos/comanda.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [store]
//! tenant_id = "00000000-0000-0000-0000-000000000001"
//! name = "Bar do Zé"
//!
//! [pricing]
//! service_fee_bps = 1000          # 10%
//! discount_base = "subtotal"      # subtotal | subtotal_with_service_fee
//!
//! [[payment_methods]]
//! id = "cash"
//! label = "Dinheiro"
//! category = "cash"
//!
//! [production]
//! release_on_complete = false
//! alert_threshold_minutes = 20
//!
//! [cash]
//! manager_withdrawal_threshold_cents = 20000
//!
//! [fiscal]
//! enabled = true
//! endpoint = "https://nfce.example.com/api"
//!
//! [intake]
//! enabled = true
//! endpoint = "https://merchant-api.example.com"
//! poll_interval_secs = 30
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use comanda_core::payment_methods::{PaymentMethodDef, PaymentMethodRegistry};
use comanda_core::pricing::{DiscountBase, PricingPolicy};
use comanda_core::production::RoutingRules;
use comanda_core::{Money, Rate, DEFAULT_TENANT_ID};

use crate::error::{EngineError, EngineResult};

const CONFIG_FILE_NAME: &str = "comanda.toml";

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,

    #[serde(default)]
    pub name: String,
}

fn default_tenant_id() -> String {
    DEFAULT_TENANT_ID.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            tenant_id: default_tenant_id(),
            name: "Comanda".to_string(),
        }
    }
}

// =============================================================================
// Database
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("com", "comanda", "pos")
        .map(|dirs| dirs.data_dir().join("comanda.db"))
        .unwrap_or_else(|| PathBuf::from("comanda.db"))
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Pricing
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingSettings {
    /// Service fee rate in basis points (1000 = 10%).
    #[serde(default = "default_service_fee_bps")]
    pub service_fee_bps: u32,

    #[serde(default)]
    pub discount_base: DiscountBase,
}

fn default_service_fee_bps() -> u32 {
    1000
}

impl Default for PricingSettings {
    fn default() -> Self {
        PricingSettings {
            service_fee_bps: default_service_fee_bps(),
            discount_base: DiscountBase::default(),
        }
    }
}

// =============================================================================
// Production
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionSettings {
    /// Mark every item delivered when the sale completes (counter service).
    #[serde(default)]
    pub release_on_complete: bool,

    /// Minutes after which a KDS ticket turns critical.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold_minutes: i64,

    /// Name fragments routed to the bar when a product has no destination.
    #[serde(default = "default_beverage_keywords")]
    pub beverage_keywords: Vec<String>,
}

fn default_alert_threshold() -> i64 {
    20
}

fn default_beverage_keywords() -> Vec<String> {
    RoutingRules::default().beverage_keywords
}

impl Default for ProductionSettings {
    fn default() -> Self {
        ProductionSettings {
            release_on_complete: false,
            alert_threshold_minutes: default_alert_threshold(),
            beverage_keywords: default_beverage_keywords(),
        }
    }
}

// =============================================================================
// Cash
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashSettings {
    /// Withdrawals above this amount need a manager.
    #[serde(default = "default_withdrawal_threshold")]
    pub manager_withdrawal_threshold_cents: i64,
}

fn default_withdrawal_threshold() -> i64 {
    20_000
}

impl Default for CashSettings {
    fn default() -> Self {
        CashSettings {
            manager_withdrawal_threshold_cents: default_withdrawal_threshold(),
        }
    }
}

// =============================================================================
// Fiscal
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiscalSettings {
    /// When off, completions don't enqueue fiscal emission.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_fiscal_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_fiscal_batch_size")]
    pub batch_size: u32,

    /// Attempts before a sale is flagged `error` for manual re-issue.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_fiscal_poll_interval() -> u64 {
    10
}

fn default_fiscal_batch_size() -> u32 {
    20
}

fn default_max_attempts() -> u32 {
    5
}

fn default_request_timeout() -> u64 {
    15
}

impl Default for FiscalSettings {
    fn default() -> Self {
        FiscalSettings {
            enabled: false,
            endpoint: None,
            api_token: None,
            poll_interval_secs: default_fiscal_poll_interval(),
            batch_size: default_fiscal_batch_size(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Delivery Intake
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default = "default_intake_poll_interval")]
    pub poll_interval_secs: u64,

    /// Method recorded for orders the channel already charged. Ids outside
    /// the registry reconcile under "other".
    #[serde(default = "default_prepaid_method")]
    pub prepaid_method: String,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_intake_poll_interval() -> u64 {
    30
}

fn default_prepaid_method() -> String {
    "online".to_string()
}

impl Default for IntakeSettings {
    fn default() -> Self {
        IntakeSettings {
            enabled: false,
            endpoint: None,
            client_id: None,
            client_secret: None,
            poll_interval_secs: default_intake_poll_interval(),
            prepaid_method: default_prepaid_method(),
            timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub pricing: PricingSettings,

    #[serde(default = "default_payment_methods")]
    pub payment_methods: Vec<PaymentMethodDef>,

    #[serde(default)]
    pub production: ProductionSettings,

    #[serde(default)]
    pub cash: CashSettings,

    #[serde(default)]
    pub fiscal: FiscalSettings,

    #[serde(default)]
    pub intake: IntakeSettings,
}

fn default_payment_methods() -> Vec<PaymentMethodDef> {
    PaymentMethodRegistry::default().methods().to_vec()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            store: StoreConfig::default(),
            database: DatabaseSettings::default(),
            pricing: PricingSettings::default(),
            payment_methods: default_payment_methods(),
            production: ProductionSettings::default(),
            cash: CashSettings::default(),
            fiscal: FiscalSettings::default(),
            intake: IntakeSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (`config_path`, `$COMANDA_CONFIG` or the platform dir)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> EngineResult<Self> {
        let mut config = Self::default();

        let path = config_path
            .or_else(|| std::env::var("COMANDA_CONFIG").ok().map(PathBuf::from))
            .or_else(Self::default_config_path);
        if let Some(path) = path {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> EngineResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| EngineError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| EngineError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Engine config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> EngineResult<()> {
        if self.store.tenant_id.trim().is_empty() {
            return Err(EngineError::InvalidConfig("store.tenant_id is empty".into()));
        }

        if self.pricing.service_fee_bps > Rate::FULL.bps() {
            return Err(EngineError::InvalidConfig(format!(
                "pricing.service_fee_bps must be at most {}, got {}",
                Rate::FULL.bps(),
                self.pricing.service_fee_bps
            )));
        }

        if self.payment_methods.is_empty() {
            return Err(EngineError::InvalidConfig(
                "at least one payment method must be configured".into(),
            ));
        }
        for (i, method) in self.payment_methods.iter().enumerate() {
            if method.id.trim().is_empty() {
                return Err(EngineError::InvalidConfig("payment method id is empty".into()));
            }
            if self.payment_methods[..i]
                .iter()
                .any(|m| m.id.eq_ignore_ascii_case(&method.id))
            {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate payment method id: {}",
                    method.id
                )));
            }
        }

        if self.production.alert_threshold_minutes <= 0 {
            return Err(EngineError::InvalidConfig(
                "production.alert_threshold_minutes must be greater than 0".into(),
            ));
        }

        if self.cash.manager_withdrawal_threshold_cents < 0 {
            return Err(EngineError::InvalidConfig(
                "cash.manager_withdrawal_threshold_cents must not be negative".into(),
            ));
        }

        if self.fiscal.enabled {
            validate_endpoint("fiscal.endpoint", self.fiscal.endpoint.as_deref())?;
            if self.fiscal.max_attempts == 0 || self.fiscal.batch_size == 0 {
                return Err(EngineError::InvalidConfig(
                    "fiscal.max_attempts and fiscal.batch_size must be greater than 0".into(),
                ));
            }
        }

        if self.intake.enabled {
            validate_endpoint("intake.endpoint", self.intake.endpoint.as_deref())?;
            if self.intake.poll_interval_secs == 0 {
                return Err(EngineError::InvalidConfig(
                    "intake.poll_interval_secs must be greater than 0".into(),
                ));
            }
        }

        Ok(())
    }

    /// Applies `COMANDA_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("COMANDA_TENANT_ID") {
            debug!(tenant_id = %id, "Overriding tenant id from environment");
            self.store.tenant_id = id;
        }

        if let Some(path) = lookup("COMANDA_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Some(bps) = lookup("COMANDA_SERVICE_FEE_BPS") {
            match bps.parse::<u32>() {
                Ok(value) => self.pricing.service_fee_bps = value,
                Err(_) => warn!(value = %bps, "Ignoring invalid COMANDA_SERVICE_FEE_BPS"),
            }
        }

        if let Some(release) = lookup("COMANDA_RELEASE_ON_COMPLETE") {
            self.production.release_on_complete =
                release == "1" || release.eq_ignore_ascii_case("true");
        }

        if let Some(url) = lookup("COMANDA_FISCAL_URL") {
            self.fiscal.endpoint = Some(url);
            self.fiscal.enabled = true;
        }

        if let Some(token) = lookup("COMANDA_FISCAL_TOKEN") {
            self.fiscal.api_token = Some(token);
        }

        if let Some(url) = lookup("COMANDA_INTAKE_URL") {
            self.intake.endpoint = Some(url);
            self.intake.enabled = true;
        }

        if let Some(id) = lookup("COMANDA_INTAKE_CLIENT_ID") {
            self.intake.client_id = Some(id);
        }

        if let Some(secret) = lookup("COMANDA_INTAKE_CLIENT_SECRET") {
            self.intake.client_secret = Some(secret);
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "comanda", "pos")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    // =========================================================================
    // Derived Settings
    // =========================================================================

    pub fn tenant_id(&self) -> &str {
        &self.store.tenant_id
    }

    pub fn pricing_policy(&self) -> PricingPolicy {
        PricingPolicy {
            service_fee_rate: Rate::from_bps(self.pricing.service_fee_bps),
            discount_base: self.pricing.discount_base,
        }
    }

    pub fn payment_registry(&self) -> PaymentMethodRegistry {
        PaymentMethodRegistry::new(self.payment_methods.clone())
    }

    pub fn routing_rules(&self) -> RoutingRules {
        RoutingRules {
            beverage_keywords: self.production.beverage_keywords.clone(),
        }
    }

    pub fn withdrawal_threshold(&self) -> Money {
        Money::from_cents(self.cash.manager_withdrawal_threshold_cents)
    }
}

fn validate_endpoint(field: &str, endpoint: Option<&str>) -> EngineResult<()> {
    let endpoint = endpoint
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| EngineError::InvalidConfig(format!("{field} is required when enabled")))?;

    let url = url::Url::parse(endpoint)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(EngineError::InvalidConfig(format!(
            "{field} must start with http:// or https://, got: {endpoint}"
        )));
    }
    Ok(())
}
