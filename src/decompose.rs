use std::path::Path;

use csv::{ByteRecord, StringRecord};
use log::debug;
use serde_json::{Map, Value};

use crate::error::{CleanerError, Result};
use crate::tag_strip::strip_markup;

pub const ID: &str = "id";
pub const HTML: &str = "html";
pub const MESSAGE: &str = "message";
pub const ENTITIES: &str = "entities";
pub const TARGETS: &str = "targets";
pub const TARGETING: &str = "targeting";
pub const TARGETINGS: &str = "targetings";

pub const REQUIRED_COLUMNS: [&str; 7] = [ID, HTML, MESSAGE, ENTITIES, TARGETS, TARGETING, TARGETINGS];
/// Columns that never reach the metadata output.
pub const DROPPED_COLUMNS: [&str; 4] = [HTML, MESSAGE, ENTITIES, TARGETS];
/// Metadata columns cleaned of markup on the way through.
pub const MARKUP_COLUMNS: [&str; 2] = [TARGETING, TARGETINGS];

pub const TEXT_HEADER: [&str; 2] = [ID, MESSAGE];
pub const ENTITY_HEADER: [&str; 3] = [ID, "entity", "entity_type"];
pub const TARGET_HEADER: [&str; 3] = [ID, "target", "segment"];

pub const NOT_SPECIFIED: &str = "not specified";
pub const NOT_SPECIFIED_TYPE: &str = "not_specified";
pub const NONE: &str = "none";

/// Positions of the interesting columns in one export's header row.
#[derive(Debug, Clone)]
pub struct ColumnLayout {
    id: usize,
    message: usize,
    entities: usize,
    targets: usize,
    metadata: Vec<usize>,
    metadata_header: Vec<String>,
    markup: Vec<bool>,
}

impl ColumnLayout {
    pub fn from_headers(headers: &StringRecord, path: &Path) -> Result<Self> {
        let position = |column: &str| {
            headers.iter().position(|h| h == column).ok_or_else(|| CleanerError::MissingColumn {
                column: column.to_string(),
                path: path.to_path_buf(),
            })
        };
        for column in REQUIRED_COLUMNS {
            position(column)?;
        }

        let mut metadata = Vec::new();
        let mut metadata_header = Vec::new();
        let mut markup = Vec::new();
        for (idx, name) in headers.iter().enumerate() {
            if DROPPED_COLUMNS.contains(&name) {
                continue;
            }
            metadata.push(idx);
            metadata_header.push(name.to_string());
            markup.push(MARKUP_COLUMNS.contains(&name));
        }

        Ok(Self {
            id: position(ID)?,
            message: position(MESSAGE)?,
            entities: position(ENTITIES)?,
            targets: position(TARGETS)?,
            metadata,
            metadata_header,
            markup,
        })
    }

    /// Input header minus the dropped columns, in input order.
    pub fn metadata_header(&self) -> &[String] {
        &self.metadata_header
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRecord {
    pub id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub id: String,
    pub entity: String,
    pub entity_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRecord {
    pub id: String,
    pub target: String,
    pub segment: String,
}

impl EntityRecord {
    fn not_specified(id: &str) -> Self {
        Self { id: id.to_string(), entity: NOT_SPECIFIED.to_string(), entity_type: NOT_SPECIFIED_TYPE.to_string() }
    }
}

impl TargetRecord {
    fn not_specified(id: &str) -> Self {
        Self { id: id.to_string(), target: NOT_SPECIFIED.to_string(), segment: NOT_SPECIFIED_TYPE.to_string() }
    }

    fn none(id: &str) -> Self {
        Self { id: id.to_string(), target: NONE.to_string(), segment: NONE.to_string() }
    }
}

/// Result of decoding one JSON-encoded list column.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedList {
    Decoded(Vec<Map<String, Value>>),
    Malformed,
}

impl DecodedList {
    /// Anything other than a JSON array of objects is `Malformed`.
    pub fn parse(raw: &str) -> Self {
        Self::parse_bytes(raw.as_bytes())
    }

    /// Same as [`DecodedList::parse`]; bytes that are not UTF-8 are `Malformed` too.
    pub fn parse_bytes(raw: &[u8]) -> Self {
        match serde_json::from_slice::<Vec<Map<String, Value>>>(raw) {
            Ok(items) => DecodedList::Decoded(items),
            Err(e) => {
                debug!("Malformed JSON list ({}): {:.80}", e, String::from_utf8_lossy(raw));
                DecodedList::Malformed
            }
        }
    }
}

fn note_foreign_id(item: &Map<String, Value>, id: &str) {
    if let Some(other) = item.get(ID).filter(|v| v.as_str() != Some(id)) {
        debug!("Row {}: element id {} ignored", id, other);
    }
}

fn field_text(item: &Map<String, Value>, key: &str) -> String {
    match item.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// One input row split into its four outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecomposedRow {
    pub metadata: MetadataRecord,
    pub text: TextRecord,
    pub entities: Vec<EntityRecord>,
    pub targets: Vec<TargetRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecomposeStats {
    pub rows: u64,
    pub malformed_entities: u64,
    pub malformed_targets: u64,
}

pub struct RecordDecomposer {
    layout: ColumnLayout,
    stats: DecomposeStats,
}

impl RecordDecomposer {
    pub fn new(layout: ColumnLayout) -> Self {
        Self { layout, stats: DecomposeStats::default() }
    }

    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    pub fn stats(&self) -> DecomposeStats {
        self.stats
    }

    /// Text fields are read lossily: a byte that is not UTF-8 becomes U+FFFD. The
    /// `entities` and `targets` fields are strict and fall back to the placeholder instead.
    pub fn decompose(&mut self, row: &ByteRecord) -> DecomposedRow {
        let layout = &self.layout;
        let raw = |idx: usize| row.get(idx).unwrap_or(b"");
        let get = |idx: usize| String::from_utf8_lossy(raw(idx));
        let id_text = get(layout.id);
        let id: &str = &id_text;

        let fields = layout
            .metadata
            .iter()
            .zip(&layout.markup)
            .map(|(&idx, &has_markup)| {
                let value = get(idx);
                if has_markup && !value.is_empty() {
                    strip_markup(&value).into_owned()
                } else {
                    value.into_owned()
                }
            })
            .collect();

        let entities = match DecodedList::parse_bytes(raw(layout.entities)) {
            DecodedList::Decoded(items) => items
                .iter()
                .map(|item| {
                    note_foreign_id(item, id);
                    EntityRecord {
                        id: id.to_string(),
                        entity: field_text(item, "entity"),
                        entity_type: field_text(item, "entity_type"),
                    }
                })
                .collect(),
            DecodedList::Malformed => {
                self.stats.malformed_entities += 1;
                debug!("Row {}: unreadable entities, writing placeholder", id);
                vec![EntityRecord::not_specified(id)]
            }
        };

        let targets = match DecodedList::parse_bytes(raw(layout.targets)) {
            DecodedList::Decoded(items) if items.is_empty() => vec![TargetRecord::none(id)],
            DecodedList::Decoded(items) => items
                .iter()
                .map(|item| {
                    note_foreign_id(item, id);
                    TargetRecord {
                        id: id.to_string(),
                        target: field_text(item, "target"),
                        segment: field_text(item, "segment"),
                    }
                })
                .collect(),
            DecodedList::Malformed => {
                self.stats.malformed_targets += 1;
                debug!("Row {}: unreadable targets, writing placeholder", id);
                vec![TargetRecord::not_specified(id)]
            }
        };

        self.stats.rows += 1;
        DecomposedRow {
            metadata: MetadataRecord { fields },
            text: TextRecord { id: id.to_string(), message: get(layout.message).into_owned() },
            entities,
            targets,
        }
    }
}
