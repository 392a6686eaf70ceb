use crate::battery_life::{BatteryLife, BatteryLifeInputs};
use crate::config::Config;
use crate::dynamic_ess::{DynamicEss, DynamicEssSettings, Status};
use crate::port::{OverrideSink, Telemetry, TelemetrySource};
use crate::settings::{Settings, SettingsError, SettingsStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{debug, warn};

impl From<&Telemetry> for BatteryLifeInputs {
    fn from(t: &Telemetry) -> Self {
        BatteryLifeInputs {
            soc: t.soc,
            vebus: t.vebus,
            ess_assistant: t.ess_assistant,
            sustain: t.sustain,
        }
    }
}

/// Owns both halves of the ESS core and the I/O around them. All entry
/// points are driven from a single task, one at a time.
pub struct Controller<T: TelemetrySource, S: OverrideSink> {
    source: T,
    sink: S,
    store: SettingsStore,
    saved: Settings,
    telemetry: Telemetry,
    battery_life: BatteryLife,
    dess_settings: DynamicEssSettings,
    dynamic_ess: DynamicEss,
}

impl<T: TelemetrySource, S: OverrideSink> Controller<T, S> {
    pub fn new(
        config: &Config,
        source: T,
        sink: S,
        store: SettingsStore,
    ) -> Result<Self, SettingsError> {
        let saved = store.load()?;
        let battery_life = BatteryLife::new(
            saved.battery_life.clone(),
            Duration::seconds(config.force_charge_interval_secs),
        );
        let dynamic_ess = DynamicEss::new(saved.dynamic_ess.mode);
        Ok(Self {
            source,
            sink,
            store,
            dess_settings: saved.dynamic_ess.clone(),
            saved,
            telemetry: Telemetry::default(),
            battery_life,
            dynamic_ess,
        })
    }

    pub fn settings(&self) -> Settings {
        Settings {
            battery_life: self.battery_life.settings().clone(),
            dynamic_ess: self.dess_settings.clone(),
        }
    }

    pub fn battery_life(&self) -> &BatteryLife {
        &self.battery_life
    }

    pub fn status(&self) -> Status {
        self.dynamic_ess.status()
    }

    /// Read fresh telemetry and run the protection state machine on it.
    pub async fn poll(&mut self, now: DateTime<Utc>) {
        self.reload();
        self.telemetry = match self.source.read().await {
            Ok(t) => t,
            Err(e) => {
                warn!("Failed to read telemetry: {}", e);
                Telemetry::default()
            }
        };
        self.battery_life.update(BatteryLifeInputs::from(&self.telemetry), now);
        self.persist();
    }

    pub fn on_battery_life_timer<Tz: TimeZone>(&mut self, now: DateTime<Tz>) {
        self.reload();
        self.battery_life.on_timer(now);
        self.persist();
    }

    pub async fn on_dynamic_ess_timer(&mut self, now: DateTime<Utc>) {
        self.reload();
        if !self.dynamic_ess.is_running() {
            return;
        }
        let overrides = self
            .dynamic_ess
            .tick(now, &self.telemetry, &self.dess_settings, &self.battery_life);
        for o in overrides {
            // The next tick writes the same value again
            if let Err(e) = self.sink.write(o).await {
                warn!("Failed to write {}: {}", o, e);
            }
        }
    }

    /// Pick up edits other writers made to the settings file.
    ///
    /// The schedule, the mode and the minimum SoC belong to the user and are
    /// taken from disk. The protector's state, flags, discharge stamp and
    /// SoC limit stay as they are in memory.
    fn reload(&mut self) {
        let disk = match self.store.load() {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to reload settings: {}", e);
                return;
            }
        };
        if disk == self.saved {
            return;
        }
        debug!("Settings changed on disk");
        let mut merged = self.settings();
        merged.battery_life.min_soc_limit = disk.battery_life.min_soc_limit;
        merged.dynamic_ess = disk.dynamic_ess.clone();
        self.saved = disk;
        self.apply(merged);
    }

    fn apply(&mut self, mut settings: Settings) {
        settings.sanitize();
        let old_mode = self.dess_settings.mode;
        self.battery_life.replace_settings(settings.battery_life);
        self.dess_settings = settings.dynamic_ess;
        self.dynamic_ess.mode_changed(old_mode, self.dess_settings.mode);
    }

    /// Write back the protector's changes on top of the current file.
    fn persist(&mut self) {
        self.reload();
        let current = self.settings();
        if current == self.saved {
            return;
        }
        match self.store.save(&current) {
            Ok(()) => {
                debug!("Settings saved");
                self.saved = current;
            }
            Err(e) => warn!("Failed to save settings: {}", e),
        }
    }
}
