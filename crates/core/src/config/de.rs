//! Field deserializers that replace malformed values with defaults instead of
//! rejecting the whole document.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value;

use super::finite_number;
use crate::analysis::{Band, PerBand};

/// Any value of the wrong shape becomes `T::default()`.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_else(|err| {
        tracing::warn!(%err, "malformed config value, using the default");
        T::default()
    }))
}

/// Keeps the elements that parse and skips the rest.
pub(crate) fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        tracing::warn!("expected a list, using an empty one");
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match T::deserialize(item) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                tracing::warn!(index, %err, "skipping malformed list entry");
                None
            }
        })
        .collect())
}

/// A finite number, also accepted as a numeric string.
pub(crate) fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(finite_number(&value))
}

pub(crate) fn lenient_gains<'de, D>(deserializer: D) -> Result<PerBand<Option<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let gain = |band: Band| value.get(band.as_str()).and_then(finite_number);
    Ok(PerBand {
        low: gain(Band::Low),
        medium: gain(Band::Medium),
        high: gain(Band::High),
    })
}

pub(crate) fn lenient_slot<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(slot_number(&value))
}

/// Channel number to slot; entries without a usable slot are dropped.
pub(crate) fn lenient_slot_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::Object(entries) = Value::deserialize(deserializer)? else {
        return Ok(BTreeMap::new());
    };
    Ok(entries
        .into_iter()
        .filter_map(|(channel, value)| match slot_number(&value) {
            Some(slot) => Some((channel, slot)),
            None => {
                tracing::warn!(%channel, %value, "skipping channel with an unusable slot");
                None
            }
        })
        .collect())
}

fn slot_number(value: &Value) -> Option<u32> {
    let number = finite_number(value)?;
    let integral = number.fract() == 0.0 && number >= 0.0 && number <= f64::from(u32::MAX);
    integral.then_some(number as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn slots_must_be_non_negative_integers() {
        assert_eq!(slot_number(&json!(3)), Some(3));
        assert_eq!(slot_number(&json!("4")), Some(4));
        assert_eq!(slot_number(&json!(2.0)), Some(2));
        assert_eq!(slot_number(&json!(2.5)), None);
        assert_eq!(slot_number(&json!(-1)), None);
        assert_eq!(slot_number(&json!("three")), None);
        assert_eq!(slot_number(&json!(null)), None);
    }
}
