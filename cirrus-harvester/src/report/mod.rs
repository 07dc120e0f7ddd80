//! Section-based reports
//!
//! A [`ReportBuilder`] collects named sections, each with a field schema
//! and rows of JSON values, plus any warnings raised while the data was
//! gathered. [`ReportBuilder::digest`] hands back the finished, read-only
//! [`ReportDocument`].
//!
//! Adding a section twice, or touching a section that was never added, is
//! a bug in the calling code and panics.

mod cluster;
mod telemetry;

pub use cluster::{add_cluster_info, add_instance_info, add_security_groups_info};
pub use telemetry::{add_telemetry, UsageStats};

use serde::Serialize;
use serde_json::Value;

/// One row; values line up with the section's fields
pub type Item = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
        }
    }

    pub fn labelled(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: Some(label.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    name: String,
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    fields: Vec<Field>,
    items: Vec<Item>,
}

impl Section {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn add_field(&mut self, name: impl Into<String>, label: impl Into<String>) -> &mut Self {
        self.fields.push(Field::labelled(name, label));
        self
    }

    /// Rows are not checked against the field schema
    pub fn add_item(&mut self, row: Item) -> &mut Self {
        self.items.push(row);
        self
    }

    pub fn add_items(&mut self, rows: impl IntoIterator<Item = Item>) -> &mut Self {
        self.items.extend(rows);
        self
    }
}

/// A finished report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportDocument {
    sections: Vec<Section>,
    warnings: Vec<String>,
}

impl ReportDocument {
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[derive(Debug, Default)]
pub struct ReportBuilder {
    document: ReportDocument,
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a section
    ///
    /// # Panics
    ///
    /// When a section called `name` already exists.
    pub fn add_section(
        &mut self,
        name: &str,
        title: &str,
        description: Option<&str>,
        fields: Vec<Field>,
    ) -> &mut Section {
        assert!(
            self.document.section(name).is_none(),
            "report section {name:?} added twice"
        );

        self.document.sections.push(Section {
            name: name.to_string(),
            title: title.to_string(),
            description: description.map(str::to_string),
            fields,
            items: Vec::new(),
        });
        let last = self.document.sections.len() - 1;
        &mut self.document.sections[last]
    }

    /// # Panics
    ///
    /// When no section called `name` exists.
    pub fn section_mut(&mut self, name: &str) -> &mut Section {
        match self.document.sections.iter_mut().find(|s| s.name == name) {
            Some(section) => section,
            None => panic!("unknown report section {name:?}"),
        }
    }

    pub fn add_field(&mut self, section: &str, name: &str, label: &str) {
        self.section_mut(section).add_field(name, label);
    }

    pub fn add_item(&mut self, section: &str, row: Item) {
        self.section_mut(section).add_item(row);
    }

    pub fn add_items(&mut self, section: &str, rows: impl IntoIterator<Item = Item>) {
        self.section_mut(section).add_items(rows);
    }

    /// Record a non-fatal problem found while gathering report data
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.document.warnings.push(message);
    }

    pub fn digest(self) -> ReportDocument {
        self.document
    }
}
