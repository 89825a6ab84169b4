//! # Shared pipeline types
//!
//! Value types that flow between pipeline stages:
//!
//! - [`Identifier`] - the token correlating a unit to its artifact and record
//! - [`SymbolKind`] - barcode or QR
//! - [`RasterImage`] / [`CompactImage`] - the artifact before and after
//!   transcoding
//! - [`TableSelector`] / [`RecordFields`] - what the record store writes
//! - [`RecordSummary`] - what a lookup returns

use core::fmt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage key prefix for every uploaded artifact.
pub const STORAGE_PREFIX: &str = "static";

/// Opaque, advisory-unique token for one generated unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Logical kind of a generated artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Barcode,
    Qr,
}

impl SymbolKind {
    /// Label used in user-facing failure messages.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Barcode => "barcode",
            Self::Qr => "QR Code",
        }
    }
}

/// A lossless raster materialized in the scratch directory.
#[derive(Debug, Clone)]
pub struct RasterImage {
    pub path: PathBuf,
    pub kind: SymbolKind,
    pub width: u32,
    pub height: u32,
}

/// Lossy target format for uploaded artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactFormat {
    Jpeg,
}

impl CompactFormat {
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
        }
    }

    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
        }
    }
}

/// A transcoded artifact, written next to its raster and held in memory.
#[derive(Debug, Clone)]
pub struct CompactImage {
    pub path: PathBuf,
    pub kind: SymbolKind,
    pub format: CompactFormat,
    pub bytes: Vec<u8>,
}

/// Storage key for an identifier's artifact: `static/{identifier}.{ext}`.
pub fn storage_key(identifier: &Identifier, format: CompactFormat) -> String {
    format!("{STORAGE_PREFIX}/{identifier}.{}", format.extension())
}

/// The record shapes the store knows how to write.
///
/// Each variant maps to one table with its own column list; insert statements
/// are derived from [`TableSelector::columns`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableSelector {
    /// `products_new`: single-item barcodes with an inline copy.
    Product,
    /// `qr_codes_new`: QR codes with an inline copy.
    QrCode,
    /// `barcodes_new`: bulk barcodes, URL only.
    LegacyBarcode,
}

/// A column of one of the record tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Name,
    UniqueId,
    ImagePath(&'static str),
    ImageBase64(&'static str),
}

impl Column {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::UniqueId => "unique_id",
            Self::ImagePath(name) | Self::ImageBase64(name) => name,
        }
    }
}

impl TableSelector {
    pub const fn table(self) -> &'static str {
        match self {
            Self::Product => "products_new",
            Self::QrCode => "qr_codes_new",
            Self::LegacyBarcode => "barcodes_new",
        }
    }

    /// Whether this shape carries an inline base64 copy of the artifact.
    pub fn stores_inline_copy(self) -> bool {
        self.columns()
            .iter()
            .any(|c| matches!(c, Column::ImageBase64(_)))
    }

    pub const fn columns(self) -> &'static [Column] {
        match self {
            Self::Product => &[
                Column::Name,
                Column::UniqueId,
                Column::ImagePath("barcode_image_path"),
                Column::ImageBase64("barcode_image_base64"),
            ],
            Self::QrCode => &[
                Column::Name,
                Column::UniqueId,
                Column::ImagePath("qr_code_image_path"),
                Column::ImageBase64("qr_code_image_base64"),
            ],
            Self::LegacyBarcode => &[
                Column::Name,
                Column::UniqueId,
                Column::ImagePath("barcode_image_path"),
            ],
        }
    }

    /// Parameterized insert for this shape, e.g.
    /// `INSERT INTO barcodes_new (name, unique_id, barcode_image_path) VALUES ($1, $2, $3)`.
    pub fn insert_sql(self) -> String {
        let columns = self.columns();
        let names = columns
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join(", ");
        let params = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("INSERT INTO {} ({names}) VALUES ({params})", self.table())
    }
}

/// Field values for one record insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFields {
    pub name: String,
    pub identifier: Identifier,
    pub public_url: String,
    pub encoded_copy: Option<String>,
}

impl RecordFields {
    /// Value bound to `column`. Inline-copy columns bind `NULL` when no copy
    /// was produced.
    pub fn value_for(&self, column: Column) -> Option<&str> {
        match column {
            Column::Name => Some(&self.name),
            Column::UniqueId => Some(self.identifier.as_str()),
            Column::ImagePath(_) => Some(&self.public_url),
            Column::ImageBase64(_) => self.encoded_copy.as_deref(),
        }
    }
}

/// A persisted unit: what the pipeline hands back on success.
///
/// `encoded_copy` is present only for shapes that store an inline copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedRecord {
    pub name: String,
    pub identifier: Identifier,
    pub public_url: String,
    pub encoded_copy: Option<String>,
}

impl From<RecordFields> for PublishedRecord {
    fn from(fields: RecordFields) -> Self {
        Self {
            name: fields.name,
            identifier: fields.identifier,
            public_url: fields.public_url,
            encoded_copy: fields.encoded_copy,
        }
    }
}

/// Result of resolving an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RecordSummary {
    pub name: String,
    pub unique_id: String,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_sql_follows_column_list() {
        assert_eq!(
            TableSelector::LegacyBarcode.insert_sql(),
            "INSERT INTO barcodes_new (name, unique_id, barcode_image_path) VALUES ($1, $2, $3)"
        );
        assert_eq!(
            TableSelector::QrCode.insert_sql(),
            "INSERT INTO qr_codes_new (name, unique_id, qr_code_image_path, qr_code_image_base64) \
             VALUES ($1, $2, $3, $4)"
        );
    }

    #[test]
    fn storage_key_uses_static_prefix() {
        let id = Identifier::new("01J9ZQ3V4X8K2M7N5P6R0S1T2V");
        assert_eq!(
            storage_key(&id, CompactFormat::Jpeg),
            "static/01J9ZQ3V4X8K2M7N5P6R0S1T2V.jpg"
        );
    }

    #[test]
    fn missing_inline_copy_binds_null() {
        let fields = RecordFields {
            name: "Widget".into(),
            identifier: Identifier::new("abc"),
            public_url: "https://example.test/x.jpg".into(),
            encoded_copy: None,
        };
        assert_eq!(fields.value_for(Column::ImageBase64("x")), None);
        assert_eq!(fields.value_for(Column::UniqueId), Some("abc"));
    }
}
