//! Core configuration.
//!
//! Loaded from a TOML file with environment-variable overrides, validated
//! once at startup, then passed by handle to every component.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};
use crate::money::Money;

/// Cost-basis accounting method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountingMethod {
    #[default]
    Fifo,
    Lifo,
    Avco,
}

impl AccountingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountingMethod::Fifo => "fifo",
            AccountingMethod::Lifo => "lifo",
            AccountingMethod::Avco => "avco",
        }
    }
}

impl FromStr for AccountingMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(AccountingMethod::Fifo),
            "lifo" => Ok(AccountingMethod::Lifo),
            "avco" => Ok(AccountingMethod::Avco),
            other => Err(CoreError::InputInvalid(format!(
                "unknown accounting method: {other}"
            ))),
        }
    }
}

/// Tax jurisdiction selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TaxJurisdiction {
    #[default]
    #[serde(rename = "GB")]
    Gb,
    #[serde(rename = "US")]
    Us,
    #[serde(rename = "CA")]
    Ca,
    #[serde(rename = "AU")]
    Au,
    #[serde(rename = "EU")]
    Eu,
    #[serde(rename = "other")]
    Other,
}

impl FromStr for TaxJurisdiction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GB" | "UK" => Ok(TaxJurisdiction::Gb),
            "US" => Ok(TaxJurisdiction::Us),
            "CA" => Ok(TaxJurisdiction::Ca),
            "AU" => Ok(TaxJurisdiction::Au),
            "EU" => Ok(TaxJurisdiction::Eu),
            "OTHER" => Ok(TaxJurisdiction::Other),
            other => Err(CoreError::InputInvalid(format!(
                "unknown tax jurisdiction: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// ISO code of the accounting currency every base amount is denominated in.
    pub base_currency: String,

    // Trading defaults
    pub default_slippage_new_pair: f64,
    pub default_slippage_normal: f64,
    pub daily_loss_cap_base: Money,
    pub per_trade_cap_base: Money,
    pub default_take_profit: f64,
    pub default_stop_loss: f64,
    pub default_trailing_stop: f64,

    pub accounting_method: AccountingMethod,
    pub tax_jurisdiction: TaxJurisdiction,

    // Archival
    pub retention_days: u32,
    pub archive_min_keep: usize,
    pub archive_compress: bool,

    // Trigger monitor
    pub trigger_tick_ms: u64,

    // Approvals
    pub auto_revoke_expired_approvals: bool,

    // Directories
    pub data_dir: PathBuf,
    pub ledgers_dir: PathBuf,
    pub exports_dir: PathBuf,
    pub archives_dir: PathBuf,
    pub keystores_dir: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            base_currency: "GBP".to_string(),
            default_slippage_new_pair: 0.07,
            default_slippage_normal: 0.03,
            daily_loss_cap_base: Money::from_int(500),
            per_trade_cap_base: Money::from_int(75),
            default_take_profit: 0.40,
            default_stop_loss: -0.20,
            default_trailing_stop: 0.15,
            accounting_method: AccountingMethod::Fifo,
            tax_jurisdiction: TaxJurisdiction::Gb,
            retention_days: 730,
            archive_min_keep: 3,
            archive_compress: true,
            trigger_tick_ms: 1000,
            auto_revoke_expired_approvals: false,
            data_dir: PathBuf::from("data"),
            ledgers_dir: PathBuf::from("data/ledgers"),
            exports_dir: PathBuf::from("data/ledgers/exports"),
            archives_dir: PathBuf::from("data/ledgers/archives"),
            keystores_dir: PathBuf::from("data/keys"),
        }
    }
}

impl CoreConfig {
    /// Load from a TOML file, apply environment overrides, validate.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::InputInvalid(format!("config {}: {e}", path.display())))?;
        let mut config: CoreConfig = toml::from_str(&raw)
            .map_err(|e| CoreError::InputInvalid(format!("config {}: {e}", path.display())))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no config file exists.
    pub fn from_env() -> CoreResult<Self> {
        let mut config = CoreConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRADELEDGER_BASE_CURRENCY") {
            self.base_currency = v;
        }
        if let Ok(v) = std::env::var("TRADELEDGER_ACCOUNTING_METHOD") {
            if let Ok(method) = v.parse() {
                self.accounting_method = method;
            }
        }
        if let Ok(v) = std::env::var("TRADELEDGER_TAX_JURISDICTION") {
            if let Ok(j) = v.parse() {
                self.tax_jurisdiction = j;
            }
        }
        if let Ok(v) = std::env::var("TRADELEDGER_DATA_DIR") {
            let root = PathBuf::from(v);
            self.ledgers_dir = root.join("ledgers");
            self.exports_dir = root.join("ledgers/exports");
            self.archives_dir = root.join("ledgers/archives");
            self.keystores_dir = root.join("keys");
            self.data_dir = root;
        }
        if let Ok(v) = std::env::var("TRADELEDGER_TRIGGER_TICK_MS") {
            if let Ok(ms) = v.parse() {
                self.trigger_tick_ms = ms;
            }
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.base_currency.len() != 3
            || !self.base_currency.chars().all(|c| c.is_ascii_uppercase())
        {
            return Err(CoreError::InputInvalid(format!(
                "base_currency must be a 3-letter ISO code, got {:?}",
                self.base_currency
            )));
        }
        if !self.per_trade_cap_base.is_positive() || !self.daily_loss_cap_base.is_positive() {
            return Err(CoreError::InputInvalid(
                "trade caps must be positive".to_string(),
            ));
        }
        if self.trigger_tick_ms < 100 {
            return Err(CoreError::InputInvalid(format!(
                "trigger_tick_ms must be >= 100, got {}",
                self.trigger_tick_ms
            )));
        }
        if !(0.0..1.0).contains(&self.default_slippage_new_pair)
            || !(0.0..1.0).contains(&self.default_slippage_normal)
        {
            return Err(CoreError::InputInvalid(
                "slippage defaults must be fractions in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }

    /// Ensure every configured directory exists.
    pub fn ensure_directories(&self) -> CoreResult<()> {
        for dir in [
            &self.data_dir,
            &self.ledgers_dir,
            &self.exports_dir,
            &self.archives_dir,
            &self.keystores_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_currency, "GBP");
        assert_eq!(config.retention_days, 730);
        assert!(!config.auto_revoke_expired_approvals);
    }

    #[test]
    fn rejects_bad_currency_and_tick() {
        let mut config = CoreConfig::default();
        config.base_currency = "pounds".to_string();
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.trigger_tick_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = CoreConfig::default();
        let raw = toml::to_string(&config).unwrap();
        let back: CoreConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back.base_currency, config.base_currency);
        assert_eq!(back.accounting_method, config.accounting_method);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: CoreConfig = toml::from_str("base_currency = \"USD\"").unwrap();
        assert_eq!(config.base_currency, "USD");
        assert_eq!(config.trigger_tick_ms, 1000);
        assert_eq!(config.accounting_method, AccountingMethod::Fifo);
    }
}
