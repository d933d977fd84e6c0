//! Bulk import of an externally produced page tree.
//!
//! Importers hand over pages parent-before-child with ids they have already
//! made unique. The batch is lowered to [`StructuralOp`]s and applied as one
//! transaction by [`DocumentStore::import`], so a bad reference anywhere
//! discards the whole batch.
//!
//! [`DocumentStore::import`]: crate::DocumentStore::import

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{AssetDescriptor, Properties};
use crate::ops::{NewBlock, NewComponent, NewPage, StructuralOp};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub pages: Vec<ImportPage>,
    pub assets: Vec<(String, AssetDescriptor)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPage {
    pub id: String,
    pub parent_id: Option<String>,
    pub properties: Properties,
    pub blocks: Vec<ImportBlock>,
}

impl ImportPage {
    pub fn new(id: impl Into<String>, parent_id: Option<&str>) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.map(String::from),
            properties: Properties::new(),
            blocks: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.properties.insert("title".into(), Value::String(title.into()));
        self
    }

    pub fn with_block(mut self, block: ImportBlock) -> Self {
        self.blocks.push(block);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBlock {
    pub id: String,
    pub icon_name: Option<String>,
    pub properties: Properties,
    pub components: Vec<ImportComponent>,
}

impl ImportBlock {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            icon_name: None,
            properties: Properties::new(),
            components: Vec::new(),
        }
    }

    pub fn with_component(mut self, component: ImportComponent) -> Self {
        self.components.push(component);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportComponent {
    pub id: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub html_content: Option<String>,
    pub properties: Properties,
}

impl ImportComponent {
    pub fn new(id: impl Into<String>, component_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            component_type: component_type.into(),
            html_content: None,
            properties: Properties::new(),
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html_content = Some(html.into());
        self
    }
}

/// Counts of entities created by a committed import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub pages: usize,
    pub blocks: usize,
    pub components: usize,
    pub assets: usize,
}

impl ImportBatch {
    pub fn report(&self) -> ImportReport {
        let blocks = self.pages.iter().flat_map(|p| &p.blocks);
        ImportReport {
            pages: self.pages.len(),
            blocks: blocks.clone().count(),
            components: blocks.map(|b| b.components.len()).sum(),
            assets: self.assets.len(),
        }
    }

    /// Lower the batch into structural ops.
    ///
    /// Page order is left to the store, which numbers each sibling group from
    /// 0 in batch order. Blocks and components take their position.
    pub fn into_ops(self) -> Vec<StructuralOp> {
        let mut ops = Vec::new();
        for page in self.pages {
            ops.push(StructuralOp::CreatePage(NewPage {
                id: Some(page.id.clone()),
                parent_id: page.parent_id,
                order: None,
                properties: page.properties,
            }));
            for (block_index, block) in page.blocks.into_iter().enumerate() {
                ops.push(StructuralOp::CreateBlock(NewBlock {
                    page_id: page.id.clone(),
                    id: Some(block.id.clone()),
                    order: Some(block_index as f64),
                    icon_name: block.icon_name,
                    properties: block.properties,
                }));
                for (component_index, component) in block.components.into_iter().enumerate() {
                    ops.push(StructuralOp::CreateComponent(NewComponent {
                        block_id: block.id.clone(),
                        id: Some(component.id),
                        component_type: component.component_type,
                        order: Some(component_index as f64),
                        properties: component.properties,
                        html: component.html_content,
                    }));
                }
            }
        }
        for (id, descriptor) in self.assets {
            ops.push(StructuralOp::PutAsset { id, descriptor });
        }
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DocError;
    use crate::origin::TxnOrigin;
    use crate::DocumentStore;

    fn three_level_batch() -> ImportBatch {
        ImportBatch {
            pages: vec![
                ImportPage::new("root", None).with_title("Course"),
                ImportPage::new("child", Some("root")).with_block(
                    ImportBlock::new("b1")
                        .with_component(ImportComponent::new("c1", "text").with_html("<p>one</p>"))
                        .with_component(ImportComponent::new("c2", "quiz")),
                ),
                ImportPage::new("grandchild", Some("child")),
            ],
            assets: vec![(
                "sha-logo".into(),
                AssetDescriptor::new("logo.svg", "image/svg+xml", 512),
            )],
        }
    }

    #[test]
    fn test_report_counts() {
        let report = three_level_batch().report();
        assert_eq!(
            report,
            ImportReport { pages: 3, blocks: 1, components: 2, assets: 1 }
        );
    }

    #[test]
    fn test_import_preserves_parent_chain() {
        let store = DocumentStore::new("p");
        let report = store.import(TxnOrigin::Local, three_level_batch()).unwrap();
        assert_eq!(report.pages, 3);

        let pages = store.navigation();
        assert_eq!(pages.len(), 3);
        for page in &pages {
            assert_eq!(page.order, 0.0, "page {} should be first of its siblings", page.id);
        }
        assert_eq!(store.page("grandchild").unwrap().parent_id.as_deref(), Some("child"));
        assert_eq!(store.page("child").unwrap().parent_id.as_deref(), Some("root"));

        let components = &store.blocks("child")[0].components;
        assert_eq!(components[0].order, 0.0);
        assert_eq!(components[1].order, 1.0);
        assert_eq!(components[1].html_content, None);
        assert!(store.assets().contains_key("sha-logo"));
    }

    #[test]
    fn test_import_appends_after_existing_siblings() {
        let store = DocumentStore::new("p");
        store.bootstrap_if_empty(TxnOrigin::System).unwrap();
        store
            .import(
                TxnOrigin::Local,
                ImportBatch {
                    pages: vec![ImportPage::new("a", None), ImportPage::new("b", None)],
                    assets: Vec::new(),
                },
            )
            .unwrap();
        assert_eq!(store.page("a").unwrap().order, 1.0);
        assert_eq!(store.page("b").unwrap().order, 2.0);
    }

    #[test]
    fn test_import_with_bad_reference_is_discarded() {
        let store = DocumentStore::new("p");
        let mut batch = three_level_batch();
        batch.pages.push(ImportPage::new("stray", Some("nowhere")));

        let err = store.import(TxnOrigin::Local, batch).unwrap_err();
        assert_eq!(err, DocError::UnknownParent("nowhere".into()));
        assert!(store.is_empty());
        assert!(store.assets().is_empty());
    }

    #[test]
    fn test_import_rejects_duplicate_ids() {
        let store = DocumentStore::new("p");
        let batch = ImportBatch {
            pages: vec![ImportPage::new("x", None), ImportPage::new("x", None)],
            assets: Vec::new(),
        };
        assert_eq!(
            store.import(TxnOrigin::Local, batch).unwrap_err(),
            DocError::DuplicateId("x".into())
        );
    }
}
