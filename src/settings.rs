//! Read-only settings lookup and the snapshot the scheduler starts from.
//!
//! Settings come from an external key-value source organised in sections:
//!
//! | section                       | keys                                                 |
//! |-------------------------------|------------------------------------------------------|
//! | `COM`                         | `Port`, `Baud`, `DEBUG`, `PreSendDelay`, `PreReceiveDelay`, `Device` |
//! | `RoundDisplay`                | `ReadSlaveTimeInterval`                              |
//! | `Channels`                    | `Count`                                              |
//! | `Channel_<n>LeftGrating`      | `SlaveAddress`, `RegAddress`, `RegCount`             |
//! | `Channel_<n>RightGrating`     | `SlaveAddress`, `RegAddress`, `RegCount`             |
//! | `Limits.<parameter>`          | `LSL`, `USL`, `Target`, `WarningCpk`, `AlarmCpk`     |
//!
//! Delays and intervals are milliseconds. Missing keys fall back to defaults.

use crate::{
    channel::{Channel, ChannelConfig, ChannelOutOfRange, GratingEndpoint, Side},
    measurement::Parameter,
    protocol::{self as proto, Address, BaudRate},
    quality::LimitTable,
    serial::{port_device_name, LinkOptions, SETTLE_DELAY},
};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u32 = 3;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_CHANNEL_COUNT: u8 = 5;
pub const DEFAULT_REGISTER_ADDRESS: u16 = 20;
pub const DEFAULT_REGISTER_COUNT: u16 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Channel {channel}: {side} grating: {source}")]
    SlaveAddress {
        channel: Channel,
        side: Side,
        #[source]
        source: proto::Error,
    },

    #[error("Channel {channel}: {side} grating: register count {count} is outside 1 to {max}", max = proto::MAX_READ_QUANTITY)]
    RegisterCount {
        channel: Channel,
        side: Side,
        count: u16,
    },

    #[error(transparent)]
    Channel(#[from] ChannelOutOfRange),

    #[error("Invalid value '{value}' for {section}.{key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    #[cfg(feature = "serde")]
    #[error("Cannot parse settings: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Serial link settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComSettings {
    pub port: u32,
    pub baud_rate: BaudRate,
    /// Dump every frame at trace level.
    pub debug: bool,
    pub pre_send_delay: Duration,
    pub pre_receive_delay: Duration,
    /// Explicit device path; derived from `port` when absent.
    pub device: Option<String>,
}

impl ComSettings {
    pub fn device_name(&self) -> String {
        self.device
            .clone()
            .unwrap_or_else(|| port_device_name(self.port))
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            pre_send_delay: self.pre_send_delay,
            settle_delay: self.pre_receive_delay.max(SETTLE_DELAY),
            trace_frames: self.debug,
            ..LinkOptions::default()
        }
    }
}

impl Default for ComSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            baud_rate: BaudRate::default(),
            debug: true,
            pre_send_delay: DEFAULT_DELAY,
            pre_receive_delay: DEFAULT_DELAY,
            device: None,
        }
    }
}

/// Read-only settings lookup.
pub trait SettingsProvider {
    fn com_settings(&self) -> ComSettings;

    /// Configuration of channel `channel`.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the channel's gratings are not usable; the channel is then left out.
    fn channel_config(&self, channel: Channel) -> Result<ChannelConfig, ConfigError>;

    fn poll_interval(&self) -> Duration;

    /// Highest channel number to configure.
    fn channel_count(&self) -> u8;

    fn limit_table(&self) -> LimitTable {
        LimitTable::default()
    }
}

/// Settings held as `section` / `key` string pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueSettings {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl KeyValueSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn with(mut self, section: &str, key: &str, value: impl Into<String>) -> Self {
        self.set(section, key, value);
        self
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|keys| keys.get(key))
            .map(String::as_str)
    }

    fn parse<T: FromStr>(&self, section: &str, key: &str) -> Result<Option<T>, ConfigError> {
        let Some(value) = self.get(section, key) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                section: section.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            })
    }

    /// Like `parse`, but an invalid value is logged and replaced by `default`.
    fn parse_or<T: FromStr>(&self, section: &str, key: &str, default: T) -> T {
        match self.parse(section, key) {
            Ok(value) => value.unwrap_or(default),
            Err(error) => {
                log::warn!("{error}; using the default");
                default
            }
        }
    }

    fn flag_or(&self, section: &str, key: &str, default: bool) -> bool {
        let Some(value) = self.get(section, key).map(str::trim) else {
            return default;
        };
        let is = |words: [&str; 4]| words.iter().any(|word| word.eq_ignore_ascii_case(value));
        if is(["1", "true", "yes", "on"]) {
            true
        } else if is(["0", "false", "no", "off"]) {
            false
        } else {
            log::warn!("Invalid value '{value}' for {section}.{key}; using the default");
            default
        }
    }

    fn millis_or(&self, section: &str, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(section, key)
            .map(|value| value.map_or(default, Duration::from_millis))
            .unwrap_or_else(|error| {
                log::warn!("{error}; using the default");
                default
            })
    }

    fn endpoint(&self, channel: Channel, side: Side) -> Result<GratingEndpoint, ConfigError> {
        let (section, default_slave) = match side {
            Side::Left => (format!("Channel_{channel}LeftGrating"), 10 + *channel),
            Side::Right => (format!("Channel_{channel}RightGrating"), 20 + *channel),
        };
        let slave = self
            .parse::<u8>(&section, "SlaveAddress")?
            .unwrap_or(default_slave);
        let slave = Address::try_from(slave).map_err(|source| ConfigError::SlaveAddress {
            channel,
            side,
            source,
        })?;
        let register_address = self
            .parse(&section, "RegAddress")?
            .unwrap_or(DEFAULT_REGISTER_ADDRESS);
        let register_count = self
            .parse(&section, "RegCount")?
            .unwrap_or(DEFAULT_REGISTER_COUNT);
        if register_count == 0 || register_count > proto::MAX_READ_QUANTITY {
            return Err(ConfigError::RegisterCount {
                channel,
                side,
                count: register_count,
            });
        }
        Ok(GratingEndpoint {
            slave,
            register_address,
            register_count,
        })
    }
}

impl SettingsProvider for KeyValueSettings {
    fn com_settings(&self) -> ComSettings {
        let defaults = ComSettings::default();
        let baud_rate = match self.parse::<u32>("COM", "Baud") {
            Ok(None) => defaults.baud_rate,
            Ok(Some(bits)) => BaudRate::try_from(bits).unwrap_or_else(|error| {
                log::warn!("{error}; using {} baud", defaults.baud_rate);
                defaults.baud_rate
            }),
            Err(error) => {
                log::warn!("{error}; using the default");
                defaults.baud_rate
            }
        };
        ComSettings {
            port: self.parse_or("COM", "Port", defaults.port),
            baud_rate,
            debug: self.flag_or("COM", "DEBUG", defaults.debug),
            pre_send_delay: self.millis_or("COM", "PreSendDelay", defaults.pre_send_delay),
            pre_receive_delay: self.millis_or("COM", "PreReceiveDelay", defaults.pre_receive_delay),
            device: self
                .get("COM", "Device")
                .map(str::trim)
                .filter(|device| !device.is_empty())
                .map(str::to_string),
        }
    }

    fn channel_config(&self, channel: Channel) -> Result<ChannelConfig, ConfigError> {
        Ok(ChannelConfig {
            left: self.endpoint(channel, Side::Left)?,
            right: self.endpoint(channel, Side::Right)?,
            limits: self.limit_table(),
        })
    }

    fn poll_interval(&self) -> Duration {
        self.millis_or("RoundDisplay", "ReadSlaveTimeInterval", DEFAULT_POLL_INTERVAL)
    }

    fn channel_count(&self) -> u8 {
        self.parse_or("Channels", "Count", DEFAULT_CHANNEL_COUNT)
    }

    fn limit_table(&self) -> LimitTable {
        let mut table = LimitTable::default();
        for parameter in Parameter::ALL {
            let section = format!("Limits.{parameter}");
            if !self.sections.contains_key(&section) {
                continue;
            }
            let mut limits = table.get(parameter);
            limits.lower_spec_limit = self.parse_or(&section, "LSL", limits.lower_spec_limit);
            limits.upper_spec_limit = self.parse_or(&section, "USL", limits.upper_spec_limit);
            limits.target_value = self.parse_or(&section, "Target", limits.target_value);
            limits.warning_cpk = self.parse_or(&section, "WarningCpk", limits.warning_cpk);
            limits.alarm_cpk = self.parse_or(&section, "AlarmCpk", limits.alarm_cpk);
            if limits.lower_spec_limit > limits.upper_spec_limit {
                let error = ConfigError::InvalidValue {
                    section,
                    key: "LSL".to_string(),
                    value: format!(
                        "{} (above USL {})",
                        limits.lower_spec_limit, limits.upper_spec_limit
                    ),
                };
                log::warn!("{error}; using the default limits");
                continue;
            }
            table.set(parameter, limits);
        }
        table
    }
}

/// A scalar value of the settings file.
#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum Scalar {
    Flag(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

#[cfg(feature = "serde")]
impl From<Scalar> for String {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Flag(flag) => flag.to_string(),
            Scalar::Integer(number) => number.to_string(),
            Scalar::Float(number) => number.to_string(),
            Scalar::Text(text) => text,
        }
    }
}

#[cfg(feature = "serde")]
type RawSettings = BTreeMap<String, BTreeMap<String, Scalar>>;

#[cfg(feature = "serde")]
impl KeyValueSettings {
    /// Loads a two-level YAML mapping of sections to scalar keys.
    ///
    /// ```
    /// use grating_qc_lib::settings::{KeyValueSettings, SettingsProvider};
    ///
    /// let settings = KeyValueSettings::from_yaml_str("COM:\n  Port: 4\n  Baud: 19200\n").unwrap();
    /// assert_eq!(settings.com_settings().port, 4);
    /// ```
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(Self::from_raw(serde_yaml::from_str(yaml)?))
    }

    pub fn from_yaml_reader<R: std::io::Read>(reader: R) -> Result<Self, ConfigError> {
        Ok(Self::from_raw(serde_yaml::from_reader(reader)?))
    }

    fn from_raw(raw: RawSettings) -> Self {
        let mut settings = Self::new();
        for (section, keys) in raw {
            for (key, value) in keys {
                settings.set(&section, &key, value);
            }
        }
        settings
    }
}

/// Everything the scheduler needs, read once from a [`SettingsProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsSnapshot {
    pub com: ComSettings,
    pub poll_interval: Duration,
    pub limits: LimitTable,
    /// Channels whose configuration is valid, by ascending channel number.
    pub channels: BTreeMap<Channel, ChannelConfig>,
}

impl SettingsSnapshot {
    /// Reads all settings. Channels that fail to configure are logged and left out.
    pub fn capture(provider: &impl SettingsProvider) -> Self {
        let mut channels = BTreeMap::new();
        for n in 1..=provider.channel_count() {
            let config = Channel::try_from(n)
                .map_err(ConfigError::from)
                .and_then(|channel| Ok((channel, provider.channel_config(channel)?)));
            match config {
                Ok((channel, config)) => {
                    channels.insert(channel, config);
                }
                Err(error) => log::warn!("Skipping channel {n}: {error}"),
            }
        }
        Self {
            com: provider.com_settings(),
            poll_interval: provider.poll_interval(),
            limits: provider.limit_table(),
            channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn channel(n: u8) -> Channel {
        Channel::try_from(n).unwrap()
    }

    #[test]
    fn defaults() {
        let settings = KeyValueSettings::new();
        let com = settings.com_settings();
        assert_eq!(com.port, 3);
        assert_eq!(com.baud_rate, BaudRate::B9600);
        assert!(com.debug);
        assert_eq!(com.pre_send_delay, Duration::from_millis(10));
        assert_eq!(com.pre_receive_delay, Duration::from_millis(10));
        assert_eq!(settings.poll_interval(), Duration::from_millis(200));
        assert_eq!(settings.channel_count(), 5);

        let config = settings.channel_config(channel(2)).unwrap();
        assert_eq!(*config.left.slave, 12);
        assert_eq!(*config.right.slave, 22);
        assert_eq!(config.left.register_address, 20);
        assert_eq!(config.right.register_count, 2);
        assert_eq!(config.limits, LimitTable::default());
    }

    #[test]
    fn keys_override_defaults() {
        let settings = KeyValueSettings::new()
            .with("COM", "Port", "7")
            .with("COM", "Baud", "19200")
            .with("COM", "DEBUG", "0")
            .with("COM", "PreReceiveDelay", "80")
            .with("RoundDisplay", "ReadSlaveTimeInterval", "500")
            .with("Channels", "Count", "2")
            .with("Channel_1LeftGrating", "SlaveAddress", "31")
            .with("Channel_1LeftGrating", "RegAddress", "100");
        let com = settings.com_settings();
        assert_eq!(com.port, 7);
        assert_eq!(com.baud_rate, BaudRate::B19200);
        assert!(!com.debug);
        assert_eq!(com.link_options().settle_delay, Duration::from_millis(80));
        assert_eq!(settings.poll_interval(), Duration::from_millis(500));
        assert_eq!(settings.channel_count(), 2);

        let config = settings.channel_config(channel(1)).unwrap();
        assert_eq!(*config.left.slave, 31);
        assert_eq!(config.left.register_address, 100);
        assert_eq!(*config.right.slave, 21);
    }

    #[test]
    fn invalid_com_values_fall_back() {
        let settings = KeyValueSettings::new()
            .with("COM", "Baud", "12345")
            .with("COM", "Port", "three")
            .with("COM", "DEBUG", "maybe");
        let com = settings.com_settings();
        assert_eq!(com.baud_rate, BaudRate::B9600);
        assert_eq!(com.port, 3);
        assert!(com.debug);
    }

    #[test]
    fn settle_delay_never_below_minimum() {
        let com = ComSettings::default();
        assert_eq!(com.link_options().settle_delay, SETTLE_DELAY);
        assert_eq!(com.link_options().pre_send_delay, DEFAULT_DELAY);
        assert!(com.link_options().trace_frames);
    }

    #[test]
    fn device_name() {
        let mut com = ComSettings::default();
        assert_eq!(com.device_name(), port_device_name(3));
        com.device = Some("/dev/ttyUSB0".to_string());
        assert_eq!(com.device_name(), "/dev/ttyUSB0");
        let settings = KeyValueSettings::new().with("COM", "Device", "/dev/ttyUSB1");
        assert_eq!(settings.com_settings().device_name(), "/dev/ttyUSB1");
    }

    #[test]
    fn invalid_channel_config() {
        let settings = KeyValueSettings::new()
            .with("Channel_1LeftGrating", "SlaveAddress", "0")
            .with("Channel_2RightGrating", "RegCount", "0")
            .with("Channel_3RightGrating", "RegCount", "126")
            .with("Channel_4LeftGrating", "RegAddress", "-1");
        assert_matches!(
            settings.channel_config(channel(1)),
            Err(ConfigError::SlaveAddress {
                side: Side::Left,
                source: proto::Error::AddressOutOfRange(0),
                ..
            })
        );
        assert_matches!(
            settings.channel_config(channel(2)),
            Err(ConfigError::RegisterCount {
                side: Side::Right,
                count: 0,
                ..
            })
        );
        assert_matches!(
            settings.channel_config(channel(3)),
            Err(ConfigError::RegisterCount { count: 126, .. })
        );
        assert_matches!(
            settings.channel_config(channel(4)),
            Err(ConfigError::InvalidValue { .. })
        );
    }

    #[test]
    fn limit_overrides() {
        let settings = KeyValueSettings::new()
            .with("Limits.P1", "LSL", "219.5")
            .with("Limits.P1", "WarningCpk", "1.5");
        let table = settings.limit_table();
        let p1 = table.get(Parameter::P1);
        assert_eq!(p1.lower_spec_limit, 219.5);
        assert_eq!(p1.upper_spec_limit, 220.90);
        assert_eq!(p1.warning_cpk, 1.5);
        assert_eq!(table.get(Parameter::P3), LimitTable::default().get(Parameter::P3));
        assert_eq!(
            settings.channel_config(channel(1)).unwrap().limits.get(Parameter::P1),
            p1
        );
    }

    #[test]
    fn inverted_limit_override_is_rejected() {
        let settings = KeyValueSettings::new()
            .with("Limits.P1", "LSL", "221")
            .with("Limits.P1", "WarningCpk", "1.5")
            .with("Limits.P3", "USL", "60");
        let table = settings.limit_table();
        assert_eq!(table.get(Parameter::P1), LimitTable::default().get(Parameter::P1));
        assert_eq!(table.get(Parameter::P3), LimitTable::default().get(Parameter::P3));

        // Equal limits stay allowed; they mark the parameter as unconfigured.
        let settings = KeyValueSettings::new()
            .with("Limits.P4", "LSL", "0")
            .with("Limits.P4", "USL", "0");
        assert!(!settings.limit_table().get(Parameter::P4).is_configured());
    }

    #[test]
    fn snapshot_skips_broken_channels() {
        let settings = KeyValueSettings::new()
            .with("Channels", "Count", "4")
            .with("Channel_2LeftGrating", "SlaveAddress", "250");
        let snapshot = SettingsSnapshot::capture(&settings);
        let channels: Vec<u8> = snapshot.channels.keys().map(|channel| **channel).collect();
        assert_eq!(channels, vec![1, 3, 4]);
        assert_eq!(snapshot.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(snapshot.limits, LimitTable::default());
    }

    #[test]
    fn snapshot_without_channels() {
        let settings = KeyValueSettings::new().with("Channels", "Count", "0");
        assert!(SettingsSnapshot::capture(&settings).channels.is_empty());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn yaml_settings() {
        let yaml = "\
COM:
  Port: 5
  DEBUG: false
  Device: /dev/ttyUSB0
Channel_1LeftGrating:
  SlaveAddress: 32
Limits.P3:
  USL: 647.5
";
        let settings = KeyValueSettings::from_yaml_str(yaml).unwrap();
        let com = settings.com_settings();
        assert_eq!(com.port, 5);
        assert!(!com.debug);
        assert_eq!(com.device_name(), "/dev/ttyUSB0");
        assert_eq!(settings.limit_table().get(Parameter::P3).upper_spec_limit, 647.5);

        assert_matches!(
            KeyValueSettings::from_yaml_str("COM:\n  Port: [1, 2]\n"),
            Err(ConfigError::Yaml(_))
        );
        assert_matches!(
            KeyValueSettings::from_yaml_str("- not a mapping"),
            Err(ConfigError::Yaml(_))
        );
    }
}
