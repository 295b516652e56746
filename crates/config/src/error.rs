#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to serialize TOML: {0}")]
    SerializeTOML(#[from] toml_edit::ser::Error),

    #[error("Failed to deserialize configuration: {0}")]
    DeserializeTOML(#[from] toml_edit::de::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseTOML(#[from] toml_edit::TomlError),

    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),
}
