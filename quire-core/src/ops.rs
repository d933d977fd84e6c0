//! Structural mutations accepted by [`DocumentStore::apply`].
//!
//! A batch of ops is validated as a whole before anything is written, so a
//! batch either lands completely or not at all.
//!
//! [`DocumentStore::apply`]: crate::DocumentStore::apply

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{AssetDescriptor, Properties};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StructuralOp {
    CreatePage(NewPage),
    /// Reparent and/or reorder a page. Only `parentId` and `order` change.
    MovePage {
        id: String,
        parent_id: Option<String>,
        order: Option<f64>,
    },
    RemovePage {
        id: String,
    },
    SetPageProperty {
        id: String,
        key: String,
        value: Value,
    },
    RemovePageProperty {
        id: String,
        key: String,
    },

    CreateBlock(NewBlock),
    RemoveBlock {
        id: String,
    },
    SetBlockProperty {
        id: String,
        key: String,
        value: Value,
    },

    CreateComponent(NewComponent),
    RemoveComponent {
        id: String,
    },
    SetComponentProperty {
        id: String,
        key: String,
        value: Value,
    },
    /// Replace the component's HTML, creating its collaborative text on first use.
    SetComponentHtml {
        id: String,
        html: String,
    },
    /// Splice the component's text. `index` and `delete` are UTF-8 byte offsets.
    EditComponentText {
        id: String,
        index: u32,
        delete: u32,
        insert: String,
    },

    SetMetadata {
        key: String,
        value: Value,
    },
    RemoveMetadata {
        key: String,
    },
    PutAsset {
        id: String,
        descriptor: AssetDescriptor,
    },
    RemoveAsset {
        id: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewPage {
    /// Generated when absent.
    pub id: Option<String>,
    pub parent_id: Option<String>,
    /// Defaults to one past the highest sibling order.
    pub order: Option<f64>,
    pub properties: Properties,
}

impl NewPage {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child_of(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_order(mut self, order: f64) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_title(self, title: impl Into<String>) -> Self {
        self.with_property("title", Value::String(title.into()))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewBlock {
    pub page_id: String,
    pub id: Option<String>,
    pub order: Option<f64>,
    pub icon_name: Option<String>,
    pub properties: Properties,
}

impl NewBlock {
    pub fn in_page(page_id: impl Into<String>) -> Self {
        Self {
            page_id: page_id.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_icon(mut self, icon_name: impl Into<String>) -> Self {
        self.icon_name = Some(icon_name.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewComponent {
    pub block_id: String,
    pub id: Option<String>,
    pub component_type: String,
    pub order: Option<f64>,
    pub properties: Properties,
    /// Initial HTML. When absent the collaborative text is created on first edit.
    pub html: Option<String>,
}

impl NewComponent {
    pub fn in_block(block_id: impl Into<String>, component_type: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            component_type: component_type.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }
}

/// Splits a text replacement into a single splice, keeping the common
/// prefix and suffix untouched.
///
/// Returns `(byte index, bytes to delete, text to insert)`.
pub(crate) fn text_splice(current: &str, next: &str) -> (usize, usize, String) {
    let prefix: usize = current
        .chars()
        .zip(next.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();

    let current_rest = &current[prefix..];
    let next_rest = &next[prefix..];
    let suffix: usize = current_rest
        .chars()
        .rev()
        .zip(next_rest.chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();

    let delete = current_rest.len() - suffix;
    let insert = next_rest[..next_rest.len() - suffix].to_string();
    (prefix, delete, insert)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_page_builder() {
        let page = NewPage::child_of("root")
            .with_id("p2")
            .with_order(3.0)
            .with_title("Second");
        assert_eq!(page.id.as_deref(), Some("p2"));
        assert_eq!(page.parent_id.as_deref(), Some("root"));
        assert_eq!(page.order, Some(3.0));
        assert_eq!(page.properties.get("title"), Some(&json!("Second")));
    }

    #[test]
    fn test_text_splice_middle_edit() {
        assert_eq!(
            text_splice("<p>hello world</p>", "<p>hello brave world</p>"),
            (9, 0, "brave ".to_string())
        );
    }

    #[test]
    fn test_text_splice_replace_and_delete() {
        assert_eq!(text_splice("abcdef", "abXYef"), (2, 2, "XY".to_string()));
        assert_eq!(text_splice("abcdef", "abef"), (2, 2, String::new()));
        assert_eq!(text_splice("", "new"), (0, 0, "new".to_string()));
        assert_eq!(text_splice("same", "same"), (4, 0, String::new()));
    }

    #[test]
    fn test_text_splice_multibyte() {
        // "é" is two bytes; offsets must stay on char boundaries.
        let (index, delete, insert) = text_splice("café au lait", "café noir");
        assert_eq!(index, "café ".len());
        assert_eq!(delete, "au lait".len());
        assert_eq!(insert, "noir");
    }

    #[test]
    fn test_text_splice_repeated_chars_do_not_overlap() {
        let (index, delete, insert) = text_splice("aaa", "aaaa");
        assert_eq!((index, delete, insert.as_str()), (3, 0, "a"));
    }
}
