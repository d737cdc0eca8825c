pub mod uppercase_key {
    use rust_decimal::Decimal;
    use serde::de::{Deserialize, Deserializer};
    use std::collections::HashMap;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Decimal>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = HashMap::<String, Decimal>::deserialize(deserializer)?;
        Ok(map
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect())
    }
}

/// Accepts either a TOML array or a comma separated string (environment overrides).
pub mod comma_list {
    use serde::de::Deserializer;
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        List(Vec<String>),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let items = match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.split(',').map(str::to_string).collect(),
            Raw::List(list) => list,
        };
        Ok(items
            .into_iter()
            .map(|item| item.trim().to_lowercase())
            .filter(|item| !item.is_empty())
            .collect())
    }
}
