//! Owned snapshot types handed to consumers of the document.
//!
//! Nothing in here references the live replicated structure: every value is
//! copied out of a read transaction, so renderers and importers can hold on
//! to them as long as they like.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Free-form per-entity properties (page, block, component).
pub type Properties = BTreeMap<String, Value>;

/// Flat document metadata (title, author, language, theme, export flags).
pub type Metadata = BTreeMap<String, Value>;

/// Well-known metadata keys.
pub mod meta {
    pub const TITLE: &str = "title";
    pub const AUTHOR: &str = "author";
    pub const LANGUAGE: &str = "language";
    pub const THEME: &str = "theme";
    pub const EXPORT_SOURCE: &str = "exportSource";
    pub const EXPORT_SCORM: &str = "exportScorm";
}

/// URI scheme used to reference assets from component HTML.
pub const ASSET_SCHEME: &str = "asset://";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    pub parent_id: Option<String>,
    pub order: f64,
    pub properties: Properties,
    /// Sorted by `order`.
    pub blocks: Vec<Block>,
}

impl Page {
    pub fn title(&self) -> Option<&str> {
        self.properties.get("title").and_then(Value::as_str)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: String,
    pub order: f64,
    pub icon_name: Option<String>,
    pub properties: Properties,
    /// Sorted by `order`.
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub id: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub order: f64,
    /// `None` until the component's collaborative text has been created.
    pub html_content: Option<String>,
    pub properties: Properties,
}

/// Content-addressed asset descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub filename: String,
    pub mime: String,
    pub size: u64,
}

impl AssetDescriptor {
    pub fn new(filename: impl Into<String>, mime: impl Into<String>, size: u64) -> Self {
        Self {
            filename: filename.into(),
            mime: mime.into(),
            size,
        }
    }
}

/// Opaque reference to an asset, as embedded in component HTML.
pub fn asset_uri(asset_id: &str) -> String {
    format!("{ASSET_SCHEME}{asset_id}")
}

/// Page hierarchy reconstructed from `parent_id` references.
#[derive(Debug, Clone, PartialEq)]
pub struct PageNode {
    pub page: Page,
    pub children: Vec<PageNode>,
}

impl PageNode {
    /// Number of pages in this subtree, including the node itself.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(PageNode::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Depth-first search for a page by id.
    pub fn find(&self, id: &str) -> Option<&PageNode> {
        if self.page.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }
}
