#![forbid(unsafe_code)]

mod debounce;
mod discovery;
mod error;
mod upload;

pub use debounce::Debounce;
pub use discovery::Discovery;
pub use error::Error;
pub use upload::{Retry, Upload};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound accepted for any configured delay or period.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub discovery: Discovery,
    pub debounce: Debounce,
    pub upload: Upload,
}

impl Config {
    /// Load configuration from a TOML file. Missing fields are filled with defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml_edit::de::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let toml = toml_edit::ser::to_string_pretty(self)?;
        std::fs::write(path, toml)?;
        Ok(())
    }

    /// Load configuration from multiple TOML files. Later files override earlier ones.
    pub fn load_multiple<T, U>(paths: U) -> Result<Self, Error>
    where
        T: AsRef<Path>,
        U: IntoIterator<Item = T>,
    {
        let mut merged = toml_edit::DocumentMut::new();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(path)?;
            let doc: toml_edit::DocumentMut = text.parse()?;
            merge_document(&mut merged, doc);
        }
        let config: Config = toml_edit::de::from_str(&merged.to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engines cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        self.debounce.validate()?;
        self.upload.validate()
    }
}

fn merge_document(target: &mut toml_edit::DocumentMut, source: toml_edit::DocumentMut) {
    for (key, item) in source.iter() {
        merge_item(
            target.entry(key).or_insert(toml_edit::Item::None),
            item.clone(),
        );
    }
}

fn merge_item(target: &mut toml_edit::Item, source: toml_edit::Item) {
    use toml_edit::Item;
    match (target, source) {
        (Item::Table(target_table), Item::Table(source_table)) => {
            for (key, item) in source_table.iter() {
                merge_item(target_table.entry(key).or_insert(Item::None), item.clone());
            }
        }
        (Item::ArrayOfTables(target_array), Item::ArrayOfTables(source_array)) => {
            for table in source_array.iter() {
                target_array.push(table.clone());
            }
        }
        (target_item, source_item) => {
            *target_item = source_item;
        }
    }
}
