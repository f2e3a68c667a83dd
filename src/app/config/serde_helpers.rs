use super::ConfigError;
use serde::{Deserialize, Deserializer, Serializer};
use std::str::FromStr;
use std::time::Duration;

/// `Duration` fields are stored as whole milliseconds under `*_ms` keys.
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let millis = u64::try_from(duration.as_millis()).map_err(serde::ser::Error::custom)?;
    serializer.serialize_u64(millis)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::EnvError(format!("Invalid {name}: {e}")))
}

/// Overwrites `target` when `name` is set. Unset variables keep the current value.
pub fn load_env_var<T>(name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        *target = parse_env(name, &raw)?;
    }
    Ok(())
}

/// Like [`load_env_var`] for an optional value; empty variables are ignored.
pub fn load_env_var_opt<T>(name: &str, target: &mut Option<T>) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            *target = Some(parse_env(name, &raw)?);
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Reads a millisecond count into a `Duration`.
pub fn load_env_millis(name: &str, target: &mut Duration) -> Result<(), ConfigError> {
    let mut millis = None;
    load_env_var_opt::<u64>(name, &mut millis)?;
    if let Some(millis) = millis {
        *target = Duration::from_millis(millis);
    }
    Ok(())
}

pub fn load_env_string_opt(name: &str, target: &mut Option<String>) {
    if let Ok(value) = std::env::var(name)
        && !value.is_empty()
    {
        *target = Some(value);
    }
}
