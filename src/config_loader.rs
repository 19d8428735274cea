use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{Microstep, Profile};
use crate::serial_link::{LinkSettings, DEFAULT_BAUD};
use crate::telemetry::{TelemetryClock, DEFAULT_WINDOW_S};

pub const CONFIG_FILE_NAME: &str = "stepper_panel.yaml";
pub const CONFIG_ENV_VAR: &str = "STEPPER_PANEL_CONFIG";
/// OS sections searched for a host block, in order.
const OS_SECTIONS: [&str; 3] = ["RaspberryPi", "Ubuntu", "macOS"];

/// One host block of stepper_panel.yaml. Every key is optional.
#[allow(non_snake_case)]
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostConfig {
    pub MOTOR_PORT: Option<String>,
    pub MOTOR_BAUD: Option<u32>,
    pub MICROSTEP: Option<u32>,
    pub PROFILE: Option<u8>,
    pub CMD_TICK_MS: Option<u64>,
    pub TELEMETRY_TICK_MS: Option<u64>,
    pub TELEMETRY_WINDOW_S: Option<f64>,
    pub TELEMETRY_CLOCK: Option<String>,
    pub RESET_DELAY_MS: Option<u64>,
}

/// OS name -> hostname -> host block.
type ConfigFile = BTreeMap<String, BTreeMap<String, HostConfig>>;

#[derive(Debug, Clone)]
pub struct PanelSettings {
    pub port: Option<String>,
    pub baud: u32,
    pub microstep: Microstep,
    pub profile: Profile,
    pub cmd_tick: Duration,
    pub telemetry_tick: Duration,
    pub telemetry_window_s: f64,
    pub telemetry_clock: TelemetryClock,
    pub reset_delay: Duration,
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud: DEFAULT_BAUD,
            microstep: Microstep::default(),
            profile: Profile::default(),
            cmd_tick: crate::command_pacer::DEFAULT_CMD_TICK,
            telemetry_tick: crate::telemetry::DEFAULT_READ_TICK,
            telemetry_window_s: DEFAULT_WINDOW_S,
            telemetry_clock: TelemetryClock::FixedTick,
            reset_delay: Duration::ZERO,
        }
    }
}

impl PanelSettings {
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            baud: self.baud,
            reset_delay: self.reset_delay,
            ..LinkSettings::default()
        }
    }

    /// Overlay the keys present in `host` onto these settings.
    pub fn apply_host_config(mut self, host: &HostConfig) -> Result<Self> {
        if let Some(port) = &host.MOTOR_PORT {
            self.port = Some(port.clone());
        }
        if let Some(baud) = host.MOTOR_BAUD {
            if baud == 0 {
                return Err(anyhow!("MOTOR_BAUD must be positive"));
            }
            self.baud = baud;
        }
        if let Some(m) = host.MICROSTEP {
            self.microstep = Microstep::try_from(m).context("Invalid MICROSTEP")?;
        }
        if let Some(p) = host.PROFILE {
            self.profile = Profile::try_from(p).context("Invalid PROFILE")?;
        }
        if let Some(ms) = host.CMD_TICK_MS {
            self.cmd_tick = positive_ms("CMD_TICK_MS", ms)?;
        }
        if let Some(ms) = host.TELEMETRY_TICK_MS {
            self.telemetry_tick = positive_ms("TELEMETRY_TICK_MS", ms)?;
        }
        if let Some(window) = host.TELEMETRY_WINDOW_S {
            if !(window.is_finite() && window > 0.0) {
                return Err(anyhow!("TELEMETRY_WINDOW_S must be a positive number, got {}", window));
            }
            self.telemetry_window_s = window;
        }
        if let Some(clock) = &host.TELEMETRY_CLOCK {
            self.telemetry_clock = parse_clock(clock)?;
        }
        if let Some(ms) = host.RESET_DELAY_MS {
            self.reset_delay = Duration::from_millis(ms);
        }
        Ok(self)
    }
}

fn positive_ms(key: &str, ms: u64) -> Result<Duration> {
    if ms == 0 {
        return Err(anyhow!("{} must be at least 1", key));
    }
    Ok(Duration::from_millis(ms))
}

pub fn parse_clock(value: &str) -> Result<TelemetryClock> {
    match value.trim().to_ascii_lowercase().as_str() {
        "tick" | "fixed" => Ok(TelemetryClock::FixedTick),
        "measured" | "wall" => Ok(TelemetryClock::Measured),
        other => Err(anyhow!("TELEMETRY_CLOCK must be 'tick' or 'measured', got '{}'", other)),
    }
}

/// Config path: `STEPPER_PANEL_CONFIG` (environment or .env) if set, else
/// stepper_panel.yaml beside Cargo.toml.
pub fn config_path() -> PathBuf {
    let _ = dotenv();
    env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(CONFIG_FILE_NAME))
}

/// Find the block for `hostname` under any OS section.
pub fn host_config_from_str(yaml: &str, hostname: &str) -> Result<Option<HostConfig>> {
    let cfg: ConfigFile = serde_yaml::from_str(yaml)?;
    for os_key in OS_SECTIONS {
        if let Some(host) = cfg.get(os_key).and_then(|hosts| hosts.get(hostname)) {
            return Ok(Some(host.clone()));
        }
    }
    Ok(None)
}

/// Settings for `hostname` from the YAML at `path`. A missing file or host
/// block gives defaults; a present but invalid one is an error.
pub fn load_panel_settings_from(path: &Path, hostname: &str) -> Result<PanelSettings> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!(target: "config_loader", "No {} at {:?}, using defaults", CONFIG_FILE_NAME, path);
            return Ok(PanelSettings::default());
        }
        Err(e) => return Err(anyhow!("Failed to open {:?}: {}", path, e)),
    };
    let yaml = std::io::read_to_string(file).with_context(|| format!("Failed to read {:?}", path))?;
    let host = host_config_from_str(&yaml, hostname)
        .with_context(|| format!("Invalid YAML in {:?}", path))?;

    match host {
        Some(host) => {
            let settings = PanelSettings::default()
                .apply_host_config(&host)
                .with_context(|| format!("Bad settings for '{}' in {:?}", hostname, path))?;
            log::info!(target: "config_loader", "PanelSettings for {}: port={:?}, baud={}, microstep={}, profile={}",
                       hostname, settings.port, settings.baud, settings.microstep, settings.profile.index());
            Ok(settings)
        }
        None => {
            log::info!(target: "config_loader", "No host entry for '{}' in {:?}, using defaults", hostname, path);
            Ok(PanelSettings::default())
        }
    }
}

pub fn load_panel_settings(hostname: &str) -> Result<PanelSettings> {
    load_panel_settings_from(&config_path(), hostname)
}
