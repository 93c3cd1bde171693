pub mod output;

use crate::core::GuestId;

/// Parses an `ID=VALUE` operator assignment, e.g. `101=nodeB`.
pub fn parse_assignment<T>(raw: &str) -> Result<(GuestId, T), String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let (id, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ID=VALUE, got '{}'", raw))?;
    let id = id
        .trim()
        .parse::<GuestId>()
        .map_err(|e| format!("invalid guest id '{}': {}", id, e))?;
    let value = value.trim().parse::<T>().map_err(|e| e.to_string())?;
    Ok((id, value))
}
