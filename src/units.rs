use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;

use crate::text::decode_sjis;

#[derive(Debug, Clone, Default)]
pub struct UnitMap {
    names: BTreeMap<String, String>,
    codes: HashMap<String, String>,
}

impl UnitMap {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let text = decode_sjis(&bytes);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut pairs = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record
                .with_context(|| format!("read row {} of {}", line + 1, path.display()))?;
            if record.len() < 2 {
                tracing::warn!("{}: row {} has fewer than two fields", path.display(), line + 1);
                continue;
            }
            pairs.push((record[0].trim().to_string(), record[1].trim().to_string()));
        }
        Ok(Self::from_pairs(pairs))
    }

    /// Missing or unreadable files give an empty map.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(map) => {
                tracing::info!("loaded {} unit names from {}", map.len(), path.display());
                map
            }
            Err(e) => {
                tracing::warn!("unit names unavailable: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let names: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut codes = HashMap::new();
        for (code, name) in &names {
            codes.entry(name.clone()).or_insert_with(|| code.clone());
        }
        Self { names, codes }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// The mapped name, or `code` unchanged.
    pub fn resolve(&self, code: &str) -> String {
        self.names
            .get(code)
            .cloned()
            .unwrap_or_else(|| code.to_string())
    }

    pub fn code_for_name(&self, name: &str) -> Option<&str> {
        self.codes.get(name).map(String::as_str)
    }

    /// Maps a unit name to its code; unknown names pass through.
    pub fn to_code(&self, name_or_code: &str) -> String {
        let trimmed = name_or_code.trim_matches(|c| c == '"' || c == '\'' || c == ' ');
        self.code_for_name(trimmed)
            .map(str::to_string)
            .unwrap_or_else(|| trimmed.to_string())
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_pass_through() {
        let units = UnitMap::from_pairs([("1", "錠"), ("12", "mL")]);
        assert_eq!(units.resolve("1"), "錠");
        assert_eq!(units.resolve("99"), "99");
        assert_eq!(units.resolve(""), "");
    }

    #[test]
    fn reverse_lookup_maps_names_to_codes() {
        let units = UnitMap::from_pairs([("1", "錠"), ("7", "包")]);
        assert_eq!(units.code_for_name("包"), Some("7"));
        assert_eq!(units.to_code("\"錠\""), "1");
        assert_eq!(units.to_code("瓶"), "瓶");
    }

    #[test]
    fn loads_shift_jis_file_and_tolerates_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("TANI.CSV");
        let (bytes, _, _) = encoding_rs::SHIFT_JIS.encode("1,錠\n2,カプセル\nbroken\n");
        std::fs::write(&path, &bytes).unwrap();

        let units = UnitMap::load(&path).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units.resolve("2"), "カプセル");

        let empty = UnitMap::load_or_empty(&dir.path().join("absent.csv"));
        assert_eq!(empty.len(), 0);
    }
}
