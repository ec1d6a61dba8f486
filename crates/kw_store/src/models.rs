//! Vault records and the SQL rows that back them.
//!
//! Domain types (`Container`, `VaultItem`, `Field`) are what callers see.
//! Row types map 1:1 to table columns and are also the unit of the sealed
//! snapshot. Enum columns are stored as their snake_case names.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

// ── Enums ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    Company,
    Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCategory {
    Password,
    Address,
    Payment,
    TaxId,
    Notice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Text,
    Password,
    Email,
    Url,
    Number,
    Textarea,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(StoreError::Format(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(ContainerType { Company => "company", Identity => "identity" });
text_enum!(ItemCategory {
    Password => "password",
    Address => "address",
    Payment => "payment",
    TaxId => "tax_id",
    Notice => "notice",
});
text_enum!(FieldType {
    Text => "text",
    Password => "password",
    Email => "email",
    Url => "url",
    Number => "number",
    Textarea => "textarea",
});

// ── Domain records ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: String,
    #[serde(rename = "type")]
    pub container_type: ContainerType,
    pub name: String,
    pub favorite: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single item field. When `encrypted` is true and the field came from
/// the store, `value` is a sealed envelope, never plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub key: String,
    pub value: String,
    pub encrypted: bool,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultItem {
    pub id: String,
    pub container_id: Option<String>,
    pub category: ItemCategory,
    pub title: String,
    pub domain: Option<String>,
    pub fields: Vec<Field>,
    pub favorite: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VaultItem {
    pub fn field(&self, key: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.key == key)
    }
}

/// Filters for listing items. `None` means "don't filter on this".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFilter {
    pub container_id: Option<String>,
    pub category: Option<ItemCategory>,
    pub favorite: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

// ── Rows ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContainerRow {
    pub id: String,
    pub container_type: String,
    pub name: String,
    pub favorite: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ItemRow {
    pub id: String,
    pub container_id: Option<String>,
    pub category: String,
    pub title: String,
    pub domain: Option<String>,
    /// JSON array of `Field`; encrypted values are already sealed.
    pub fields: String,
    pub favorite: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MetaRow {
    pub key: String,
    pub value: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Container> for ContainerRow {
    fn from(c: &Container) -> Self {
        Self {
            id: c.id.clone(),
            container_type: c.container_type.as_str().to_string(),
            name: c.name.clone(),
            favorite: c.favorite,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

impl TryFrom<ContainerRow> for Container {
    type Error = StoreError;

    fn try_from(row: ContainerRow) -> Result<Self, Self::Error> {
        Ok(Self {
            container_type: row.container_type.parse()?,
            id: row.id,
            name: row.name,
            favorite: row.favorite,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<&VaultItem> for ItemRow {
    type Error = StoreError;

    fn try_from(item: &VaultItem) -> Result<Self, Self::Error> {
        Ok(Self {
            id: item.id.clone(),
            container_id: item.container_id.clone(),
            category: item.category.as_str().to_string(),
            title: item.title.clone(),
            domain: item.domain.clone(),
            fields: serde_json::to_string(&item.fields)?,
            favorite: item.favorite,
            created_at: item.created_at,
            updated_at: item.updated_at,
        })
    }
}

impl TryFrom<ItemRow> for VaultItem {
    type Error = StoreError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            category: row.category.parse()?,
            fields: serde_json::from_str(&row.fields)?,
            id: row.id,
            container_id: row.container_id,
            title: row.title,
            domain: row.domain,
            favorite: row.favorite,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_text_roundtrip() {
        for cat in [
            ItemCategory::Password,
            ItemCategory::Address,
            ItemCategory::Payment,
            ItemCategory::TaxId,
            ItemCategory::Notice,
        ] {
            assert_eq!(cat.as_str().parse::<ItemCategory>().unwrap(), cat);
        }
        assert_eq!(ItemCategory::TaxId.as_str(), "tax_id");
        assert!("bogus".parse::<ContainerType>().is_err());
    }

    #[test]
    fn field_json_uses_type_key() {
        let f = Field {
            key: "password".into(),
            value: "x".into(),
            encrypted: true,
            field_type: FieldType::Password,
        };
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["type"], "password");
        assert_eq!(json["encrypted"], true);
    }

    #[test]
    fn item_row_roundtrip_keeps_fields() {
        let now = Utc::now();
        let item = VaultItem {
            id: "i1".into(),
            container_id: None,
            category: ItemCategory::Payment,
            title: "Card".into(),
            domain: None,
            fields: vec![Field {
                key: "card_number".into(),
                value: "sealed".into(),
                encrypted: true,
                field_type: FieldType::Password,
            }],
            favorite: true,
            created_at: now,
            updated_at: now,
        };
        let row = ItemRow::try_from(&item).unwrap();
        assert_eq!(row.category, "payment");
        assert_eq!(VaultItem::try_from(row).unwrap(), item);
    }
}
