use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Output formats understood by the harness telemetry subscriber.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// Flattened JSON events, one per line.
    Json,
    /// Single-line human readable output. Test runners read this one.
    #[default]
    Compact,
}

/// Error returned when a [`LogFormat`] cannot be parsed.
pub type LogFormatParseError = strum::ParseError;
