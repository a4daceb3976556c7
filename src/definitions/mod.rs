/*!
 * Definition Metadata
 * Field and call-site definitions generated as classes reach the output
 *
 * The instrumentation writes two plain-text tables ahead of the run:
 *
 * - sites: `id file class member line`
 * - fields: `id declaring_class name modifiers_hex`
 *
 * Columns are whitespace separated. The refinery asks for a class's
 * definitions once, when the class is first forwarded.
 */

use crate::core::errors::{CollectorError, Result};
use crate::core::types::{FieldId, SiteId, SurrogateId};
use crate::events::EventKind;
use ahash::RandomState;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Static modifier bit in field modifiers
const STATIC_MODIFIER: u32 = 0x0008;

/// Source of definitions that accompany a class into the output
pub trait DefinitionSource: Send {
    /// Definitions for `class`, named `name`; empty if none are known or
    /// they were already handed out
    fn emit_definitions(&mut self, class: SurrogateId, name: &str) -> Vec<EventKind>;
}

/// Emits nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDefinitions;

impl DefinitionSource for NoDefinitions {
    fn emit_definitions(&mut self, _class: SurrogateId, _name: &str) -> Vec<EventKind> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldMeta {
    id: FieldId,
    name: Arc<str>,
    modifiers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SiteMeta {
    id: SiteId,
    file: Arc<str>,
    member: Arc<str>,
    line: u32,
}

#[derive(Debug, Default)]
struct ClassMeta {
    fields: Vec<FieldMeta>,
    sites: Vec<SiteMeta>,
}

/// Site and field tables keyed by declaring class
#[derive(Debug, Default)]
pub struct SiteCatalog {
    classes: HashMap<String, ClassMeta, RandomState>,
    skipped: usize,
}

impl SiteCatalog {
    /// Load either or both tables from disk
    pub fn load(sites: Option<&Path>, fields: Option<&Path>) -> Result<Self> {
        let read = |path: Option<&Path>| -> Result<String> {
            match path {
                Some(path) => {
                    std::fs::read_to_string(path).map_err(|e| CollectorError::io(path, e))
                }
                None => Ok(String::new()),
            }
        };
        let catalog = Self::parse(&read(sites)?, &read(fields)?);
        debug!(
            classes = catalog.classes.len(),
            skipped = catalog.skipped,
            "definition catalog loaded"
        );
        Ok(catalog)
    }

    /// Build from table contents; malformed lines are logged and skipped
    pub fn parse(sites: &str, fields: &str) -> Self {
        let mut catalog = Self::default();

        for (number, line) in significant_lines(sites) {
            match parse_site(line) {
                Some((class, site)) => catalog.class_mut(class).sites.push(site),
                None => catalog.skip("sites", number, line),
            }
        }
        for (number, line) in significant_lines(fields) {
            match parse_field(line) {
                Some((class, field)) => catalog.class_mut(class).fields.push(field),
                None => catalog.skip("fields", number, line),
            }
        }
        catalog
    }

    fn class_mut(&mut self, name: &str) -> &mut ClassMeta {
        self.classes.entry(name.to_string()).or_default()
    }

    fn skip(&mut self, table: &str, number: usize, line: &str) {
        warn!(table, line = number, content = line, "skipping malformed definition");
        self.skipped += 1;
    }

    /// Classes that still have definitions to hand out
    pub fn pending_classes(&self) -> usize {
        self.classes.len()
    }

    /// Lines that could not be parsed
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl DefinitionSource for SiteCatalog {
    fn emit_definitions(&mut self, class: SurrogateId, name: &str) -> Vec<EventKind> {
        let Some(meta) = self.classes.remove(name) else {
            return Vec::new();
        };

        let fields = meta.fields.into_iter().map(|field| EventKind::FieldDefinition {
            field: field.id,
            declaring_class: class,
            name: field.name,
            is_static: field.modifiers & STATIC_MODIFIER != 0,
            modifiers: field.modifiers,
        });
        let sites = meta.sites.into_iter().map(|site| EventKind::StaticCallLocation {
            site: site.id,
            declaring_class: class,
            member: site.member,
            line: site.line,
            file: site.file,
        });
        fields.chain(sites).collect()
    }
}

fn significant_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn parse_site(line: &str) -> Option<(&str, SiteMeta)> {
    let mut columns = line.split_whitespace();
    let id = columns.next()?.parse().ok()?;
    let file = columns.next()?;
    let class = columns.next()?;
    let member = columns.next()?;
    let line_number = columns.next()?.parse().ok()?;
    if columns.next().is_some() {
        return None;
    }
    Some((
        class,
        SiteMeta {
            id: SiteId(id),
            file: Arc::from(file),
            member: Arc::from(member),
            line: line_number,
        },
    ))
}

fn parse_field(line: &str) -> Option<(&str, FieldMeta)> {
    let mut columns = line.split_whitespace();
    let id = columns.next()?.parse().ok()?;
    let class = columns.next()?;
    let name = columns.next()?;
    let modifiers = columns.next()?;
    let modifiers = u32::from_str_radix(modifiers.trim_start_matches("0x"), 16).ok()?;
    if columns.next().is_some() {
        return None;
    }
    Some((
        class,
        FieldMeta {
            id: FieldId(id),
            name: Arc::from(name),
            modifiers,
        },
    ))
}
