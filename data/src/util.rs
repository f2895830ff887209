use serde::{Deserialize, Deserializer};

/// Falls back to `T::default()` when a field fails to deserialize, so one bad
/// value in a hand-edited file does not discard the rest of it.
pub fn ok_or_default<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de> + Default,
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}
