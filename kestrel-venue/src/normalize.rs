//! Serde helpers for venue payloads that encode numbers as strings.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serializer};

/// Deserializes a decimal the venue sent as a JSON string.
pub fn decimal_from_str<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse::<Decimal>().map_err(serde::de::Error::custom)
}

/// Serializes a decimal back into the venue's string encoding.
pub fn decimal_to_str<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

/// Deserializes an optional string-encoded decimal; absent, null, and empty
/// strings all map to `None`.
pub fn optional_decimal_from_str<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(text) => text
            .parse::<Decimal>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Deserialize, Serialize)]
    struct Wire {
        #[serde(
            deserialize_with = "super::decimal_from_str",
            serialize_with = "super::decimal_to_str"
        )]
        px: Decimal,
        #[serde(default, deserialize_with = "super::optional_decimal_from_str")]
        liq_px: Option<Decimal>,
    }

    #[test]
    fn string_prices_parse_to_decimal() {
        let wire: Wire = serde_json::from_str(r#"{"px":"65432.1","liq_px":"60000.5"}"#).unwrap();
        assert_eq!(wire.px, dec!(65432.1));
        assert_eq!(wire.liq_px, Some(dec!(60000.5)));
    }

    #[test]
    fn empty_and_null_optionals_are_none() {
        let wire: Wire = serde_json::from_str(r#"{"px":"1","liq_px":""}"#).unwrap();
        assert!(wire.liq_px.is_none());
        let wire: Wire = serde_json::from_str(r#"{"px":"1","liq_px":null}"#).unwrap();
        assert!(wire.liq_px.is_none());
    }

    #[test]
    fn round_trips_through_string_encoding() {
        let wire = Wire {
            px: dec!(0.0123),
            liq_px: None,
        };
        let json = serde_json::to_string(&wire).unwrap();
        assert!(json.contains(r#""px":"0.0123""#));
    }
}
