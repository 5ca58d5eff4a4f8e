use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use crate::error::ConfigError;
use crate::normalize::normalize_text;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantCategory {
    pub categoria: String,
    pub subcategoria: String,
}

/// One row of the merchant-alias CSV (`merchant,categoria,subcategoria`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MerchantRow {
    merchant: String,
    #[serde(default)]
    categoria: String,
    #[serde(default)]
    subcategoria: String,
}

/// Normalized merchant text → category, kept in insertion order so partial
/// matching is deterministic. Re-inserting a key overwrites in place.
#[derive(Debug, Clone, Default)]
pub struct MerchantMap {
    entries: Vec<(String, MerchantCategory)>,
    index: HashMap<String, usize>,
}

impl MerchantMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the normalized key, or `None` if the merchant normalizes to
    /// nothing or has no category.
    pub fn insert(&mut self, merchant: &str, category: MerchantCategory) -> Option<String> {
        let key = normalize_text(merchant);
        if key.is_empty() || category.categoria.trim().is_empty() {
            return None;
        }
        match self.index.get(&key) {
            Some(&pos) => self.entries[pos].1 = category,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key.clone(), category));
            }
        }
        Some(key)
    }

    pub fn get_exact(&self, normalized: &str) -> Option<&MerchantCategory> {
        self.index.get(normalized).map(|&pos| &self.entries[pos].1)
    }

    /// First merchant (insertion order) that contains, or is contained in,
    /// the normalized description.
    pub fn find_partial(&self, normalized: &str) -> Option<(&str, &MerchantCategory)> {
        if normalized.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|(key, _)| normalized.contains(key.as_str()) || key.contains(normalized))
            .map(|(key, category)| (key.as_str(), category))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MerchantCategory)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        let mut map = MerchantMap::new();
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        for row in rdr.deserialize::<MerchantRow>() {
            let row = row?;
            map.insert(
                &row.merchant,
                MerchantCategory {
                    categoria: row.categoria,
                    subcategoria: row.subcategoria,
                },
            );
        }
        Ok(map)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }
}

/// Appends an alias to the CSV at `path`, keeping one row per normalized
/// merchant key (last write wins). Creates the file if needed. Callers must
/// serialize calls for the same path.
pub fn persist_alias(
    path: &Path,
    merchant: &str,
    category: &MerchantCategory,
) -> Result<(), ConfigError> {
    let mut rows: Vec<MerchantRow> = if path.exists() {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)?;
        rdr.deserialize().collect::<Result<_, _>>()?
    } else {
        Vec::new()
    };

    rows.push(MerchantRow {
        merchant: merchant.trim().to_string(),
        categoria: category.categoria.clone(),
        subcategoria: category.subcategoria.clone(),
    });

    let mut last_index: HashMap<String, usize> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        last_index.insert(normalize_text(&row.merchant), i);
    }
    let deduped = rows
        .into_iter()
        .enumerate()
        .filter(|(i, row)| last_index.get(&normalize_text(&row.merchant)) == Some(i));

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    // Readers only ever see the old file or the complete new one.
    let tmp = path.with_extension("csv.tmp");
    let mut wtr = csv::Writer::from_path(&tmp)?;
    for (_, row) in deduped {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    drop(wtr);
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat(c: &str, s: &str) -> MerchantCategory {
        MerchantCategory {
            categoria: c.to_string(),
            subcategoria: s.to_string(),
        }
    }

    #[test]
    fn insert_normalizes_key() {
        let mut map = MerchantMap::new();
        assert_eq!(map.insert("Café JUMBO!", cat("supermercado", "")), Some("cafe jumbo".into()));
        assert!(map.get_exact("cafe jumbo").is_some());
    }

    #[test]
    fn insert_skips_blank_merchant_or_category() {
        let mut map = MerchantMap::new();
        assert_eq!(map.insert("***", cat("x", "")), None);
        assert_eq!(map.insert("jumbo", cat("  ", "")), None);
        assert!(map.is_empty());
    }

    #[test]
    fn reinsert_overwrites_in_place() {
        let mut map = MerchantMap::new();
        map.insert("uber", cat("transporte", "taxi"));
        map.insert("jumbo", cat("supermercado", ""));
        map.insert("UBER", cat("viajes", ""));
        assert_eq!(map.len(), 2);
        assert_eq!(map.iter().next().unwrap().1.categoria, "viajes");
    }

    #[test]
    fn partial_match_follows_insertion_order() {
        let mut map = MerchantMap::new();
        map.insert("uber", cat("transporte", ""));
        map.insert("uber eats", cat("alimentacion", ""));
        let (key, found) = map.find_partial("uber eats santiago").unwrap();
        assert_eq!(key, "uber");
        assert_eq!(found.categoria, "transporte");
    }

    #[test]
    fn partial_match_works_in_both_directions() {
        let mut map = MerchantMap::new();
        map.insert("starbucks coffee", cat("alimentacion", "cafe"));
        assert!(map.find_partial("starbucks").is_some());
        assert!(map.find_partial("").is_none());
    }

    #[test]
    fn loads_csv_with_missing_subcategory() {
        let data = "merchant,categoria,subcategoria\nJumbo,supermercado,\nCopec,combustible,gasolina\n";
        let map = MerchantMap::from_csv_reader(data.as_bytes()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get_exact("copec").unwrap().subcategoria, "gasolina");
    }

    #[test]
    fn persist_alias_dedupes_by_normalized_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merchant_map.csv");
        persist_alias(&path, "Jumbo", &cat("supermercado", "")).unwrap();
        persist_alias(&path, "Copec", &cat("combustible", "")).unwrap();
        persist_alias(&path, "JUMBO!", &cat("hogar", "")).unwrap();

        let map = MerchantMap::load(&path).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get_exact("jumbo").unwrap().categoria, "hogar");
    }
}
