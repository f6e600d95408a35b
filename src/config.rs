// =============================================================================
// Engine Configuration — validated, typed, unknown options rejected
// =============================================================================
//
// The whole recognised option surface lives here, one field per option.
// Every field carries a serde default so a partial file loads cleanly, but
// unknown keys are a hard error: a typo in a risk limit must never silently
// fall back to a default.
//
// Live trading is dual-gated: `mode = live` AND `allow_live_trading = true`.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::types::{SessionPolicy, TradingMode};

/// A configuration problem. Fatal at startup (exit code 2).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// -----------------------------------------------------------------------------
// Default-value helpers (required by serde `default = "..."` attribute)
// -----------------------------------------------------------------------------

fn default_timeframe() -> String {
    "1m".to_string()
}

fn default_market_timezone() -> String {
    "America/New_York".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/meridian.db")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_daily_loss() -> Decimal {
    dec!(1000)
}

fn default_max_trades_per_day() -> u32 {
    20
}

fn default_max_position_pct() -> Decimal {
    dec!(0.05)
}

fn default_max_concurrent_positions() -> u32 {
    5
}

fn default_max_risk_per_trade_pct() -> Decimal {
    dec!(0.01)
}

fn default_stop_loss_pct() -> Decimal {
    dec!(0.01)
}

fn default_min_minutes_after_open() -> u32 {
    15
}

fn default_min_minutes_before_close() -> u32 {
    15
}

fn default_gate_cooldown_seconds() -> u64 {
    300
}

fn default_exit_check_interval() -> u64 {
    30
}

fn default_atr_stop_multiplier() -> Decimal {
    dec!(1.5)
}

fn default_atr_profit_multiplier() -> Decimal {
    dec!(3.0)
}

fn default_profit_target_pct() -> Decimal {
    dec!(0.02)
}

fn default_trailing_multiplier() -> Decimal {
    dec!(2.0)
}

fn default_true() -> bool {
    true
}

fn default_warning_threshold_pct() -> Decimal {
    dec!(3.0)
}

fn default_warning_recovery_pct() -> Decimal {
    dec!(2.0)
}

fn default_halt_threshold_pct() -> Decimal {
    dec!(5.0)
}

fn default_halt_recovery_pct() -> Decimal {
    dec!(4.0)
}

fn default_emergency_threshold_pct() -> Decimal {
    dec!(10.0)
}

fn default_emergency_recovery_pct() -> Decimal {
    dec!(8.0)
}

fn default_warning_position_multiplier() -> Decimal {
    dec!(0.5)
}

fn default_drawdown_check_interval() -> u64 {
    60
}

fn default_lookback_days() -> u32 {
    20
}

fn default_runtime_check_interval() -> u64 {
    120
}

fn default_broker_timeout_seconds() -> u64 {
    10
}

// -----------------------------------------------------------------------------
// Option groups
// -----------------------------------------------------------------------------

/// Instrument universe, split by asset class. Equities are subject to the
/// market-hours filters and the concurrent-position cap; crypto is not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymbolsConfig {
    #[serde(default)]
    pub equities: Vec<String>,
    #[serde(default)]
    pub crypto: Vec<String>,
}

impl SymbolsConfig {
    /// All configured symbols, equities first.
    pub fn all(&self) -> Vec<String> {
        let mut out = self.equities.clone();
        out.extend(self.crypto.iter().cloned());
        out
    }

    pub fn is_equity(&self, symbol: &str) -> bool {
        self.equities.iter().any(|s| s == symbol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default)]
    pub policy: SessionPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: SessionPolicy::default(),
        }
    }
}

/// Hard limits enforced by the RISK tier of the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RiskConfig {
    /// Daily realised loss (account currency) at which trading stops.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
    /// Per-trade notional cap as a fraction of account equity.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: Decimal,
    /// Equities only.
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,
    /// Capital risked per trade as a fraction of equity.
    #[serde(default = "default_max_risk_per_trade_pct")]
    pub max_risk_per_trade_pct: Decimal,
    /// Assumed stop distance used by the risk-based sizing denominator.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: default_max_daily_loss(),
            max_trades_per_day: default_max_trades_per_day(),
            max_position_pct: default_max_position_pct(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_risk_per_trade_pct: default_max_risk_per_trade_pct(),
            stop_loss_pct: default_stop_loss_pct(),
        }
    }
}

/// Soft entry filters (FILTERS tier).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct FiltersConfig {
    #[serde(default = "default_min_minutes_after_open")]
    pub min_minutes_after_open: u32,
    #[serde(default = "default_min_minutes_before_close")]
    pub min_minutes_before_close: u32,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            min_minutes_after_open: default_min_minutes_after_open(),
            min_minutes_before_close: default_min_minutes_before_close(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct GateConfig {
    /// Minimum wall-clock spacing between accepted signals for one gate key.
    #[serde(default = "default_gate_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_gate_cooldown_seconds(),
        }
    }
}

/// Exit-rule parameters for the periodic position scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ExitConfig {
    #[serde(default = "default_exit_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_atr_stop_multiplier")]
    pub atr_stop_multiplier: Decimal,
    #[serde(default = "default_atr_profit_multiplier")]
    pub atr_profit_multiplier: Decimal,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    #[serde(default = "default_profit_target_pct")]
    pub profit_target_pct: Decimal,
    #[serde(default = "default_trailing_multiplier")]
    pub trailing_multiplier: Decimal,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_exit_check_interval(),
            atr_stop_multiplier: default_atr_stop_multiplier(),
            atr_profit_multiplier: default_atr_profit_multiplier(),
            stop_loss_pct: default_stop_loss_pct(),
            profit_target_pct: default_profit_target_pct(),
            trailing_multiplier: default_trailing_multiplier(),
        }
    }
}

/// Peak-to-trough drawdown escalation thresholds (percent). Each recovery
/// threshold sits strictly below its escalation threshold for hysteresis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DrawdownConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_warning_threshold_pct")]
    pub warning_threshold_pct: Decimal,
    #[serde(default = "default_warning_recovery_pct")]
    pub warning_recovery_threshold_pct: Decimal,
    #[serde(default = "default_halt_threshold_pct")]
    pub halt_threshold_pct: Decimal,
    #[serde(default = "default_halt_recovery_pct")]
    pub halt_recovery_threshold_pct: Decimal,
    #[serde(default = "default_emergency_threshold_pct")]
    pub emergency_threshold_pct: Decimal,
    #[serde(default = "default_emergency_recovery_pct")]
    pub emergency_recovery_threshold_pct: Decimal,
    /// Sizing multiplier applied while at Warning.
    #[serde(default = "default_warning_position_multiplier")]
    pub warning_position_multiplier: Decimal,
    #[serde(default = "default_drawdown_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_true")]
    pub enable_auto_recovery: bool,
    /// Peak equity is reset after this many days.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
}

impl Default for DrawdownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold_pct: default_warning_threshold_pct(),
            warning_recovery_threshold_pct: default_warning_recovery_pct(),
            halt_threshold_pct: default_halt_threshold_pct(),
            halt_recovery_threshold_pct: default_halt_recovery_pct(),
            emergency_threshold_pct: default_emergency_threshold_pct(),
            emergency_recovery_threshold_pct: default_emergency_recovery_pct(),
            warning_position_multiplier: default_warning_position_multiplier(),
            check_interval_seconds: default_drawdown_check_interval(),
            enable_auto_recovery: true,
            lookback_days: default_lookback_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ReconciliationConfig {
    /// Runtime reconcile cadence. Clamped to 30–300 s at load time.
    #[serde(default = "default_runtime_check_interval")]
    pub runtime_check_interval_seconds: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            runtime_check_interval_seconds: default_runtime_check_interval(),
        }
    }
}

/// Endpoint overrides and I/O bounds for the broker and market-data clients.
/// Credentials never appear here; they come from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EndpointsConfig {
    #[serde(default)]
    pub paper_url: Option<String>,
    #[serde(default)]
    pub live_url: Option<String>,
    #[serde(default)]
    pub market_data_url: Option<String>,
    #[serde(default = "default_broker_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            paper_url: None,
            live_url: None,
            market_data_url: None,
            timeout_seconds: default_broker_timeout_seconds(),
        }
    }
}

// -----------------------------------------------------------------------------
// Top-level config
// -----------------------------------------------------------------------------

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    /// Paper or live endpoint selection. Defaults to paper.
    #[serde(default)]
    pub mode: TradingMode,
    /// Second arm of the dual gate: live submission requires this too.
    #[serde(default)]
    pub allow_live_trading: bool,
    /// Log the submission and return a synthetic accepted order instead of
    /// contacting the broker.
    #[serde(default)]
    pub dry_run: bool,
    /// Config-level kill switch. The SAFETY tier also honours the
    /// `MERIDIAN_KILL_SWITCH` env var and the `data/KILL_SWITCH` sentinel.
    #[serde(default)]
    pub kill_switch: bool,

    #[serde(default)]
    pub symbols: SymbolsConfig,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub drawdown: DrawdownConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    /// IANA timezone of the traded market; consulted only by the daily-reset
    /// scheduler and the session-minute filters.
    #[serde(default = "default_market_timezone")]
    pub market_timezone: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialise")
    }
}

impl Config {
    /// Load configuration from a JSON file at `path` and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;

        info!(
            path = %path.display(),
            mode = %config.mode,
            live_armed = config.live_trading_armed(),
            dry_run = config.dry_run,
            equities = config.symbols.equities.len(),
            crypto = config.symbols.crypto.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Both gates set: the engine may hit the live endpoint.
    pub fn live_trading_armed(&self) -> bool {
        self.mode == TradingMode::Live && self.allow_live_trading
    }

    /// Parsed market timezone. Validation guarantees this succeeds.
    pub fn market_tz(&self) -> Tz {
        self.market_timezone
            .parse()
            .expect("market timezone validated at load")
    }

    /// Validate ranges and cross-field rules; clamp the reconcile interval.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.symbols.equities.is_empty() && self.symbols.crypto.is_empty() {
            return Err(ConfigError::Invalid(
                "symbols: at least one equity or crypto symbol is required".into(),
            ));
        }
        if self.timeframe.is_empty() {
            return Err(ConfigError::Invalid("timeframe must not be empty".into()));
        }
        if self.market_timezone.parse::<Tz>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "marketTimezone: unknown IANA timezone {:?}",
                self.market_timezone
            )));
        }

        let positive_fraction = |name: &str, v: Decimal| -> Result<(), ConfigError> {
            if v <= Decimal::ZERO || v > Decimal::ONE {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be in (0, 1], got {v}"
                )));
            }
            Ok(())
        };
        positive_fraction("risk.maxPositionPct", self.risk.max_position_pct)?;
        positive_fraction("risk.maxRiskPerTradePct", self.risk.max_risk_per_trade_pct)?;
        positive_fraction("risk.stopLossPct", self.risk.stop_loss_pct)?;
        positive_fraction("exit.stopLossPct", self.exit.stop_loss_pct)?;
        positive_fraction("exit.profitTargetPct", self.exit.profit_target_pct)?;

        if self.risk.max_daily_loss <= Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "risk.maxDailyLoss must be positive".into(),
            ));
        }
        if self.risk.max_trades_per_day == 0 {
            return Err(ConfigError::Invalid(
                "risk.maxTradesPerDay must be at least 1".into(),
            ));
        }
        if self.exit.atr_stop_multiplier <= Decimal::ZERO
            || self.exit.atr_profit_multiplier <= Decimal::ZERO
            || self.exit.trailing_multiplier <= Decimal::ZERO
        {
            return Err(ConfigError::Invalid(
                "exit multipliers must be positive".into(),
            ));
        }
        if self.exit.check_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "exit.checkIntervalSeconds must be at least 1".into(),
            ));
        }

        let dd = &self.drawdown;
        let ordered = [
            (
                "warning",
                dd.warning_recovery_threshold_pct,
                dd.warning_threshold_pct,
            ),
            ("halt", dd.halt_recovery_threshold_pct, dd.halt_threshold_pct),
            (
                "emergency",
                dd.emergency_recovery_threshold_pct,
                dd.emergency_threshold_pct,
            ),
        ];
        for (name, recovery, escalation) in ordered {
            if recovery >= escalation {
                return Err(ConfigError::Invalid(format!(
                    "drawdown: {name} recovery threshold ({recovery}) must sit below the \
                     escalation threshold ({escalation})"
                )));
            }
        }
        if dd.warning_threshold_pct >= dd.halt_threshold_pct
            || dd.halt_threshold_pct >= dd.emergency_threshold_pct
        {
            return Err(ConfigError::Invalid(
                "drawdown thresholds must increase: warning < halt < emergency".into(),
            ));
        }
        if dd.warning_position_multiplier <= Decimal::ZERO
            || dd.warning_position_multiplier > Decimal::ONE
        {
            return Err(ConfigError::Invalid(
                "drawdown.warningPositionMultiplier must be in (0, 1]".into(),
            ));
        }

        // Clamp rather than error: the reconcile loop must neither hammer
        // the broker nor go stale.
        self.reconciliation.runtime_check_interval_seconds = self
            .reconciliation
            .runtime_check_interval_seconds
            .clamp(30, 300);

        Ok(())
    }
}
