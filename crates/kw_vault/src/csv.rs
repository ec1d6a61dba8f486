//! CSV export and import.
//!
//! Format: header `Type,Container,Title,Domain,Category,<field keys...>`,
//! one row per item, every cell quoted with embedded quotes doubled.
//! `Type` and `Container` describe the item's container and are empty for
//! items without one. Export writes decrypted values; import seals the
//! known sensitive keys again. Field keys are unique per item, so each key
//! column holds at most one value per row, and a header that repeats a key
//! column is rejected.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use kw_store::db::Mutation;
use kw_store::models::{
    Container, ContainerType, Field, FieldType, ItemCategory, ItemFilter, VaultItem,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::VaultError;
use crate::items::{open_item, seal_fields};
use crate::service::VaultService;

pub const HEADER: [&str; 5] = ["Type", "Container", "Title", "Domain", "Category"];

/// Field keys that are always stored encrypted on import.
pub const SENSITIVE_KEYS: [&str; 3] = ["password", "card_number", "cvv"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
    pub containers_created: usize,
}

fn write_record<'a>(out: &mut String, cells: impl IntoIterator<Item = &'a str>) {
    for (i, cell) in cells.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('"');
        out.push_str(&cell.replace('"', "\"\""));
        out.push('"');
    }
    out.push('\n');
}

/// Split `input` into records. Accepts quoted and bare cells, `\n` or
/// `\r\n` line endings and newlines inside quoted cells.
pub fn parse_records(input: &str) -> Result<Vec<Vec<String>>, VaultError> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut line = 1usize;
    let mut quote_line = 0usize;

    let mut chars = input.trim_start_matches('\u{feff}').chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    cell.push(c);
                }
                _ => cell.push(c),
            }
            continue;
        }
        match c {
            '"' if cell.is_empty() => {
                in_quotes = true;
                quote_line = line;
            }
            ',' => record.push(std::mem::take(&mut cell)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                record.push(std::mem::take(&mut cell));
                records.push(std::mem::take(&mut record));
                line += 1;
            }
            _ => cell.push(c),
        }
    }

    if in_quotes {
        return Err(VaultError::InvalidInput(format!(
            "unterminated quoted cell starting on line {quote_line}"
        )));
    }
    if !cell.is_empty() || !record.is_empty() {
        record.push(cell);
        records.push(record);
    }
    Ok(records)
}

fn import_field(key: &str, value: &str) -> Field {
    let lowered = key.to_ascii_lowercase();
    let sensitive = SENSITIVE_KEYS.contains(&lowered.as_str());
    let field_type = match lowered.as_str() {
        _ if sensitive => FieldType::Password,
        "email" => FieldType::Email,
        "url" | "website" => FieldType::Url,
        "notes" => FieldType::Textarea,
        _ => FieldType::Text,
    };
    Field {
        key: key.to_string(),
        value: value.to_string(),
        encrypted: sensitive,
        field_type,
    }
}

impl VaultService {
    /// Every item with all fields decrypted, oldest first. The result holds
    /// plaintext secrets.
    pub async fn export_csv(&self) -> Result<String, VaultError> {
        let handle = self.acquire().await?;
        let containers = self.storage(handle.store.list_containers(None).await).await?;
        let mut items = self
            .storage(handle.store.list_items(&ItemFilter::default()).await)
            .await?;
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let items: Vec<VaultItem> =
            items.into_iter().map(|item| open_item(&handle.dek, item)).collect();

        let by_id: HashMap<&str, &Container> =
            containers.iter().map(|c| (c.id.as_str(), c)).collect();
        let mut keys: Vec<&str> = Vec::new();
        for field in items.iter().flat_map(|item| item.fields.iter()) {
            if !keys.contains(&field.key.as_str()) {
                keys.push(field.key.as_str());
            }
        }

        let mut out = String::new();
        write_record(&mut out, HEADER.iter().copied().chain(keys.iter().copied()));
        for item in &items {
            let container = item.container_id.as_deref().and_then(|id| by_id.get(id));
            let mut cells = vec![
                container.map(|c| c.container_type.as_str()).unwrap_or(""),
                container.map(|c| c.name.as_str()).unwrap_or(""),
                item.title.as_str(),
                item.domain.as_deref().unwrap_or(""),
                item.category.as_str(),
            ];
            for key in &keys {
                cells.push(item.field(key).map(|f| f.value.as_str()).unwrap_or(""));
            }
            write_record(&mut out, cells);
        }

        info!("[vault] exported {} items", items.len());
        Ok(out)
    }

    /// Import rows produced by `export_csv` (or compatible). Containers are
    /// matched by name and type, and created when missing. Rows without a
    /// title or with an unknown category/type are skipped. All writes land
    /// in one transaction.
    pub async fn import_csv(&self, csv: &str) -> Result<ImportSummary, VaultError> {
        let handle = self.acquire().await?;
        let mut records = parse_records(csv)?.into_iter();
        let header = records
            .next()
            .ok_or_else(|| VaultError::InvalidInput("CSV is empty".into()))?;
        let header_ok = header.len() >= HEADER.len()
            && HEADER
                .iter()
                .zip(&header)
                .all(|(want, got)| got.trim().eq_ignore_ascii_case(want));
        if !header_ok {
            return Err(VaultError::InvalidInput(format!(
                "CSV header must start with {}",
                HEADER.join(",")
            )));
        }
        let field_keys: Vec<String> =
            header[HEADER.len()..].iter().map(|k| k.trim().to_string()).collect();
        let mut seen = HashSet::new();
        if let Some(dup) = field_keys.iter().find(|k| !k.is_empty() && !seen.insert(k.as_str())) {
            return Err(VaultError::InvalidInput(format!(
                "CSV header repeats field column '{dup}'"
            )));
        }

        let store = &handle.store;
        let mut summary = ImportSummary::default();
        let mut mutations = Vec::new();
        let mut resolved: HashMap<(String, ContainerType), String> = HashMap::new();
        let now = Utc::now();

        for (index, record) in records.enumerate() {
            let line = index + 2;
            if record.iter().all(|c| c.trim().is_empty()) {
                continue;
            }
            let cell = |i: usize| record.get(i).map(|s| s.trim()).unwrap_or("");

            let title = cell(2);
            if title.is_empty() {
                warn!("[vault] import: skipping row {} (no title)", line);
                summary.skipped += 1;
                continue;
            }
            let category = match cell(4) {
                "" => ItemCategory::Password,
                raw => match raw.to_ascii_lowercase().parse::<ItemCategory>() {
                    Ok(category) => category,
                    Err(_) => {
                        warn!("[vault] import: skipping row {} (unknown category '{}')", line, raw);
                        summary.skipped += 1;
                        continue;
                    }
                },
            };

            let container_id = match cell(1) {
                "" => None,
                name => {
                    let kind = match cell(0) {
                        "" => ContainerType::Company,
                        raw => match raw.to_ascii_lowercase().parse::<ContainerType>() {
                            Ok(kind) => kind,
                            Err(_) => {
                                warn!(
                                    "[vault] import: skipping row {} (unknown container type '{}')",
                                    line, raw
                                );
                                summary.skipped += 1;
                                continue;
                            }
                        },
                    };
                    let key = (name.to_string(), kind);
                    let id = match resolved.get(&key) {
                        Some(id) => id.clone(),
                        None => {
                            let existing = self
                                .storage(store.find_container_by_name(name, Some(kind)).await)
                                .await?;
                            let id = match existing {
                                Some(container) => container.id,
                                None => {
                                    let container = Container {
                                        id: Uuid::new_v4().to_string(),
                                        container_type: kind,
                                        name: name.to_string(),
                                        favorite: false,
                                        created_at: now,
                                        updated_at: now,
                                    };
                                    let id = container.id.clone();
                                    mutations.push(Mutation::InsertContainer(container));
                                    summary.containers_created += 1;
                                    id
                                }
                            };
                            resolved.insert(key, id.clone());
                            id
                        }
                    };
                    Some(id)
                }
            };

            let fields: Vec<Field> = field_keys
                .iter()
                .enumerate()
                .filter(|(_, key)| !key.is_empty())
                .filter_map(|(i, key)| {
                    let value = record.get(HEADER.len() + i)?;
                    (!value.is_empty()).then(|| import_field(key, value))
                })
                .collect();

            let item_id = Uuid::new_v4().to_string();
            let domain = Some(cell(3)).filter(|d| !d.is_empty()).map(str::to_string);
            let item = VaultItem {
                fields: seal_fields(&handle.dek, &item_id, fields)?,
                id: item_id,
                container_id,
                category,
                title: title.to_string(),
                domain,
                favorite: false,
                created_at: now,
                updated_at: now,
            };
            mutations.push(Mutation::InsertItem(item));
            summary.imported += 1;
        }

        if !mutations.is_empty() {
            self.storage(store.insert_batch(mutations).await).await?;
        }
        info!(
            "[vault] imported {} items ({} skipped, {} containers created)",
            summary.imported, summary.skipped, summary.containers_created
        );
        Ok(summary)
    }
}
