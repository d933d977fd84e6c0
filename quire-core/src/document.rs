//! Replicated project document.
//!
//! Layout inside the merge primitive:
//!
//! ```text
//! Doc
//! ├── navigation : Y.Array<Y.Map>          flat page list, hierarchy via parentId
//! │     └── page { id, parentId, order, properties: Y.Map, blocks: Y.Array }
//! │            └── block { id, order, iconName, properties, components: Y.Array }
//! │                   └── component { id, type, order, properties, htmlContent?: Y.Text }
//! ├── metadata   : Y.Map<Any>
//! └── assets     : Y.Map<Any>               asset id → descriptor
//! ```
//!
//! Pages are never nested containers: reparenting is a single write to
//! `parentId`, and the tree is rebuilt on read.
//!
//! Every structural write goes through [`DocumentStore::apply`], which runs a
//! batch of [`StructuralOp`]s inside one transaction tagged with a
//! [`TxnOrigin`]. The batch is validated against the current state before the
//! first write, so peers never observe a half-built page.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use uuid::Uuid;
use yrs::types::{Path, PathSegment};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn,
    StateVector, Text, TextPrelim, TextRef, Transact, TransactionMut, Update,
};

use crate::error::{DocError, DocResult};
use crate::import::{ImportBatch, ImportReport};
use crate::model::{AssetDescriptor, Block, Component, Metadata, Page, PageNode, Properties};
use crate::ops::{text_splice, NewBlock, NewComponent, NewPage, StructuralOp};
use crate::origin::TxnOrigin;
use crate::value::{any_to_json, json_to_any};

pub const NAVIGATION: &str = "navigation";
pub const METADATA: &str = "metadata";
pub const ASSETS: &str = "assets";

pub const KEY_ID: &str = "id";
pub const KEY_PARENT: &str = "parentId";
pub const KEY_ORDER: &str = "order";
pub const KEY_PROPERTIES: &str = "properties";
pub const KEY_BLOCKS: &str = "blocks";
pub const KEY_ICON: &str = "iconName";
pub const KEY_COMPONENTS: &str = "components";
pub const KEY_TYPE: &str = "type";
pub const KEY_HTML: &str = "htmlContent";

/// Title given to the page created by [`DocumentStore::bootstrap_if_empty`].
pub const BOOTSTRAP_TITLE: &str = "Untitled";

/// The replicated document of one project.
///
/// Cloning is cheap and yields another handle onto the same document.
#[derive(Clone)]
pub struct DocumentStore {
    project_id: String,
    doc: Doc,
    navigation: ArrayRef,
    metadata: MapRef,
    assets: MapRef,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("project_id", &self.project_id)
            .field("client_id", &self.doc.client_id())
            .finish()
    }
}

impl DocumentStore {
    /// Create an empty in-memory document for `project_id`.
    pub fn new(project_id: impl Into<String>) -> Self {
        let doc = Doc::new();
        let navigation = doc.get_or_insert_array(NAVIGATION);
        let metadata = doc.get_or_insert_map(METADATA);
        let assets = doc.get_or_insert_map(ASSETS);
        Self {
            project_id: project_id.into(),
            doc,
            navigation,
            metadata,
            assets,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Underlying merge document, for observers and the undo scope.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn navigation_ref(&self) -> &ArrayRef {
        &self.navigation
    }

    pub fn metadata_ref(&self) -> &MapRef {
        &self.metadata
    }

    pub fn assets_ref(&self) -> &MapRef {
        &self.assets
    }

    // ─── Merge state ───────────────────────────────────────────────────

    /// Full document state as a v1 update (the binary snapshot).
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this document has that the holder of `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> DocResult<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocError::InvalidUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Merge a v1 update. Applying the same update twice is a no-op.
    pub fn apply_update(&self, origin: TxnOrigin, update: &[u8]) -> DocResult<()> {
        let update =
            Update::decode_v1(update).map_err(|e| DocError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin.to_origin());
        txn.apply_update(update)
            .map_err(|e| DocError::InvalidUpdate(e.to_string()))
    }

    // ─── Reads ─────────────────────────────────────────────────────────

    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.navigation.len(&txn) == 0
    }

    pub fn page_count(&self) -> usize {
        let txn = self.doc.transact();
        self.navigation.len(&txn) as usize
    }

    /// All pages in storage order.
    pub fn navigation(&self) -> Vec<Page> {
        let txn = self.doc.transact();
        self.navigation
            .iter(&txn)
            .filter_map(|out| match out {
                Out::YMap(map) => read_page(&txn, &map),
                _ => None,
            })
            .collect()
    }

    pub fn page(&self, id: &str) -> Option<Page> {
        let txn = self.doc.transact();
        let (_, map) = self.find_page(&txn, id)?;
        read_page(&txn, &map)
    }

    /// Pages whose parent is `parent_id`, sorted by order.
    pub fn children(&self, parent_id: Option<&str>) -> Vec<Page> {
        let mut pages: Vec<Page> = self
            .navigation()
            .into_iter()
            .filter(|p| p.parent_id.as_deref() == parent_id)
            .collect();
        pages.sort_by(|a, b| a.order.total_cmp(&b.order));
        pages
    }

    pub fn root_pages(&self) -> Vec<Page> {
        self.children(None)
    }

    /// Rebuild the page hierarchy from `parentId` references.
    ///
    /// Pages whose parent is missing, or that sit on a cycle created by
    /// concurrent moves, are surfaced as roots rather than dropped.
    pub fn navigation_tree(&self) -> Vec<PageNode> {
        let pages = self.navigation();
        let known: HashSet<&str> = pages.iter().map(|p| p.id.as_str()).collect();

        let mut by_parent: HashMap<Option<String>, Vec<Page>> = HashMap::new();
        let mut orphans = Vec::new();
        for page in &pages {
            match &page.parent_id {
                Some(parent) if !known.contains(parent.as_str()) => {
                    log::warn!("Page {} references missing parent {parent}", page.id);
                    orphans.push(page.clone());
                }
                parent => by_parent.entry(parent.clone()).or_default().push(page.clone()),
            }
        }
        for siblings in by_parent.values_mut() {
            siblings.sort_by(|a, b| a.order.total_cmp(&b.order));
        }

        let mut visited = HashSet::new();
        let mut roots: Vec<Page> = by_parent.remove(&None).unwrap_or_default();
        roots.extend(orphans);

        let mut tree: Vec<PageNode> = roots
            .into_iter()
            .map(|page| build_node(page, &by_parent, &mut visited))
            .collect();

        // Anything still unvisited hangs off a cycle.
        for page in &pages {
            if !visited.contains(&page.id) {
                log::warn!("Page {} is part of a parent cycle", page.id);
                tree.push(build_node(page.clone(), &by_parent, &mut visited));
            }
        }
        tree
    }

    pub fn blocks(&self, page_id: &str) -> Vec<Block> {
        self.page(page_id).map(|p| p.blocks).unwrap_or_default()
    }

    pub fn component(&self, id: &str) -> Option<Component> {
        let txn = self.doc.transact();
        let (_, _, map) = self.find_component(&txn, id)?;
        read_component(&txn, &map)
    }

    pub fn component_html(&self, id: &str) -> Option<String> {
        self.component(id).and_then(|c| c.html_content)
    }

    pub fn metadata(&self) -> Metadata {
        let txn = self.doc.transact();
        self.metadata
            .iter(&txn)
            .map(|(key, value)| (key.to_string(), out_to_json(&txn, &value)))
            .collect()
    }

    pub fn assets(&self) -> HashMap<String, AssetDescriptor> {
        let txn = self.doc.transact();
        self.assets
            .iter(&txn)
            .filter_map(|(key, value)| {
                let json = out_to_json(&txn, &value);
                match serde_json::from_value(json) {
                    Ok(descriptor) => Some((key.to_string(), descriptor)),
                    Err(e) => {
                        log::warn!("Skipping malformed asset {key}: {e}");
                        None
                    }
                }
            })
            .collect()
    }

    // ─── Writes ────────────────────────────────────────────────────────

    /// Run `ops` as one transaction.
    ///
    /// Returns the ids of created pages, blocks and components in op order.
    /// If any op is invalid nothing is written.
    pub fn apply(&self, origin: TxnOrigin, ops: Vec<StructuralOp>) -> DocResult<Vec<String>> {
        let mut txn = self.doc.transact_mut_with(origin.to_origin());
        let mut plan = Plan::scan(&txn, &self.navigation);

        let mut writes = Vec::with_capacity(ops.len());
        for op in ops {
            writes.push(plan.resolve(&txn, self, op)?);
        }

        let mut created = Vec::new();
        for write in writes {
            if let Some(id) = self.write(&mut txn, write)? {
                created.push(id);
            }
        }
        Ok(created)
    }

    /// Insert an externally produced page/block/component tree atomically.
    pub fn import(&self, origin: TxnOrigin, batch: ImportBatch) -> DocResult<ImportReport> {
        let report = batch.report();
        self.apply(origin, batch.into_ops())?;
        log::info!(
            "Imported {} pages, {} blocks, {} components, {} assets into {}",
            report.pages,
            report.blocks,
            report.components,
            report.assets,
            self.project_id
        );
        Ok(report)
    }

    pub fn create_page(&self, origin: TxnOrigin, page: NewPage) -> DocResult<String> {
        self.create_one(origin, StructuralOp::CreatePage(page))
    }

    pub fn create_block(&self, origin: TxnOrigin, block: NewBlock) -> DocResult<String> {
        self.create_one(origin, StructuralOp::CreateBlock(block))
    }

    pub fn create_component(&self, origin: TxnOrigin, component: NewComponent) -> DocResult<String> {
        self.create_one(origin, StructuralOp::CreateComponent(component))
    }

    pub fn set_component_html(&self, origin: TxnOrigin, id: &str, html: &str) -> DocResult<()> {
        self.apply(
            origin,
            vec![StructuralOp::SetComponentHtml {
                id: id.to_string(),
                html: html.to_string(),
            }],
        )
        .map(|_| ())
    }

    pub fn set_metadata(&self, origin: TxnOrigin, key: &str, value: Value) -> DocResult<()> {
        self.apply(
            origin,
            vec![StructuralOp::SetMetadata {
                key: key.to_string(),
                value,
            }],
        )
        .map(|_| ())
    }

    pub fn put_asset(&self, origin: TxnOrigin, id: &str, descriptor: AssetDescriptor) -> DocResult<()> {
        self.apply(
            origin,
            vec![StructuralOp::PutAsset {
                id: id.to_string(),
                descriptor,
            }],
        )
        .map(|_| ())
    }

    /// Create the blank structure (one root page) if the document is empty.
    ///
    /// Emptiness is re-checked inside the write transaction, so two callers
    /// racing on the same replica produce a single root page. Returns the new
    /// page id, or `None` when the document already had pages.
    pub fn bootstrap_if_empty(&self, origin: TxnOrigin) -> Option<String> {
        let mut txn = self.doc.transact_mut_with(origin.to_origin());
        if self.navigation.len(&txn) > 0 {
            return None;
        }
        let id = Uuid::new_v4().to_string();
        let mut properties = Properties::new();
        properties.insert("title".into(), Value::String(BOOTSTRAP_TITLE.into()));
        self.write_page(&mut txn, &id, None, 0.0, &properties);
        log::info!("Bootstrapped project {} with root page {id}", self.project_id);
        Some(id)
    }

    fn create_one(&self, origin: TxnOrigin, op: StructuralOp) -> DocResult<String> {
        self.apply(origin, vec![op])?
            .pop()
            .ok_or_else(|| DocError::Malformed("create op produced no id".into()))
    }

    fn write(&self, txn: &mut TransactionMut, write: Write) -> DocResult<Option<String>> {
        match write {
            Write::Page { id, parent, order, properties } => {
                self.write_page(txn, &id, parent.as_deref(), order, &properties);
                Ok(Some(id))
            }
            Write::MovePage { id, parent, order } => {
                let (_, map) = self.find_page(txn, &id).ok_or(DocError::UnknownPage(id))?;
                map.insert(txn, KEY_PARENT, parent_any(parent.as_deref()));
                map.insert(txn, KEY_ORDER, order);
                Ok(None)
            }
            Write::RemovePage { id } => {
                let (index, _) = self.find_page(txn, &id).ok_or(DocError::UnknownPage(id))?;
                self.navigation.remove(txn, index);
                Ok(None)
            }
            Write::PageProperty { id, key, value } => {
                let (_, map) = self.find_page(txn, &id).ok_or(DocError::UnknownPage(id))?;
                write_property(txn, &map, key, value);
                Ok(None)
            }
            Write::Block { page_id, id, order, icon, properties } => {
                let (_, page) = self
                    .find_page(txn, &page_id)
                    .ok_or(DocError::UnknownPage(page_id))?;
                let blocks = child_array(txn, &page, KEY_BLOCKS);
                let block = blocks.push_back(txn, MapPrelim::default());
                block.insert(txn, KEY_ID, id.as_str());
                block.insert(txn, KEY_ORDER, order);
                match icon {
                    Some(icon) => {
                        block.insert(txn, KEY_ICON, icon.as_str());
                    }
                    None => {
                        block.insert(txn, KEY_ICON, Any::Null);
                    }
                }
                write_properties(txn, &block, &properties);
                block.insert(txn, KEY_COMPONENTS, ArrayPrelim::default());
                Ok(Some(id))
            }
            Write::RemoveBlock { id } => {
                let (blocks, index, _) =
                    self.find_block(txn, &id).ok_or(DocError::UnknownBlock(id))?;
                blocks.remove(txn, index);
                Ok(None)
            }
            Write::BlockProperty { id, key, value } => {
                let (_, _, map) = self.find_block(txn, &id).ok_or(DocError::UnknownBlock(id))?;
                write_property(txn, &map, key, value);
                Ok(None)
            }
            Write::Component { block_id, id, component_type, order, properties, html } => {
                let (_, _, block) = self
                    .find_block(txn, &block_id)
                    .ok_or(DocError::UnknownBlock(block_id))?;
                let components = child_array(txn, &block, KEY_COMPONENTS);
                let component = components.push_back(txn, MapPrelim::default());
                component.insert(txn, KEY_ID, id.as_str());
                component.insert(txn, KEY_TYPE, component_type.as_str());
                component.insert(txn, KEY_ORDER, order);
                write_properties(txn, &component, &properties);
                if let Some(html) = html {
                    component.insert(txn, KEY_HTML, TextPrelim::new(html));
                }
                Ok(Some(id))
            }
            Write::RemoveComponent { id } => {
                let (components, index, _) = self
                    .find_component(txn, &id)
                    .ok_or(DocError::UnknownComponent(id))?;
                components.remove(txn, index);
                Ok(None)
            }
            Write::ComponentProperty { id, key, value } => {
                let (_, _, map) = self
                    .find_component(txn, &id)
                    .ok_or(DocError::UnknownComponent(id))?;
                write_property(txn, &map, key, value);
                Ok(None)
            }
            Write::Splice { id, index, delete, insert } => {
                let (_, _, map) = self
                    .find_component(txn, &id)
                    .ok_or(DocError::UnknownComponent(id))?;
                match out_text(map.get(txn, KEY_HTML)) {
                    Some(text) => {
                        if delete > 0 {
                            text.remove_range(txn, index, delete);
                        }
                        if !insert.is_empty() {
                            text.insert(txn, index, &insert);
                        }
                    }
                    // First edit: the collaborative text is created here.
                    None => {
                        map.insert(txn, KEY_HTML, TextPrelim::new(insert));
                    }
                }
                Ok(None)
            }
            Write::Metadata { key, value } => {
                match value {
                    Some(value) => {
                        self.metadata.insert(txn, key, json_to_any(&value));
                    }
                    None => {
                        self.metadata.remove(txn, &key);
                    }
                }
                Ok(None)
            }
            Write::Asset { id, descriptor } => {
                match descriptor {
                    Some(descriptor) => {
                        let json = serde_json::to_value(&descriptor)
                            .map_err(|e| DocError::Malformed(e.to_string()))?;
                        self.assets.insert(txn, id, json_to_any(&json));
                    }
                    None => {
                        self.assets.remove(txn, &id);
                    }
                }
                Ok(None)
            }
        }
    }

    fn write_page(
        &self,
        txn: &mut TransactionMut,
        id: &str,
        parent: Option<&str>,
        order: f64,
        properties: &Properties,
    ) {
        let page = self.navigation.push_back(txn, MapPrelim::default());
        page.insert(txn, KEY_ID, id);
        page.insert(txn, KEY_PARENT, parent_any(parent));
        page.insert(txn, KEY_ORDER, order);
        write_properties(txn, &page, properties);
        page.insert(txn, KEY_BLOCKS, ArrayPrelim::default());
    }

    // ─── Lookups ───────────────────────────────────────────────────────

    fn find_page<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<(u32, MapRef)> {
        self.navigation
            .iter(txn)
            .enumerate()
            .find_map(|(index, out)| match out {
                Out::YMap(map) if map_id(txn, &map).as_deref() == Some(id) => {
                    Some((index as u32, map))
                }
                _ => None,
            })
    }

    fn find_block<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<(ArrayRef, u32, MapRef)> {
        for page in self.navigation.iter(txn) {
            let Out::YMap(page) = page else { continue };
            let Some(blocks) = out_array(page.get(txn, KEY_BLOCKS)) else { continue };
            if let Some((index, block)) = find_in(txn, &blocks, id) {
                return Some((blocks, index, block));
            }
        }
        None
    }

    fn find_component<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<(ArrayRef, u32, MapRef)> {
        for page in self.navigation.iter(txn) {
            let Out::YMap(page) = page else { continue };
            let Some(blocks) = out_array(page.get(txn, KEY_BLOCKS)) else { continue };
            for block in blocks.iter(txn) {
                let Out::YMap(block) = block else { continue };
                let Some(components) = out_array(block.get(txn, KEY_COMPONENTS)) else { continue };
                if let Some((index, component)) = find_in(txn, &components, id) {
                    return Some((components, index, component));
                }
            }
        }
        None
    }
}

// ─── Validation ────────────────────────────────────────────────────────

/// A fully validated write, ready to be applied without further checks.
enum Write {
    Page { id: String, parent: Option<String>, order: f64, properties: Properties },
    MovePage { id: String, parent: Option<String>, order: f64 },
    RemovePage { id: String },
    PageProperty { id: String, key: String, value: Option<Value> },
    Block { page_id: String, id: String, order: f64, icon: Option<String>, properties: Properties },
    RemoveBlock { id: String },
    BlockProperty { id: String, key: String, value: Option<Value> },
    Component {
        block_id: String,
        id: String,
        component_type: String,
        order: f64,
        properties: Properties,
        html: Option<String>,
    },
    RemoveComponent { id: String },
    ComponentProperty { id: String, key: String, value: Option<Value> },
    Splice { id: String, index: u32, delete: u32, insert: String },
    Metadata { key: String, value: Option<Value> },
    Asset { id: String, descriptor: Option<AssetDescriptor> },
}

struct PlanPage {
    parent: Option<String>,
    order: f64,
}

struct PlanItem {
    owner: String,
    order: f64,
}

/// Shadow of the document structure used to validate a batch before writing.
struct Plan {
    pages: HashMap<String, PlanPage>,
    blocks: HashMap<String, PlanItem>,
    components: HashMap<String, PlanItem>,
    /// Component text as it will be after the ops resolved so far.
    /// `None` means the collaborative text does not exist yet.
    texts: HashMap<String, Option<String>>,
}

impl Plan {
    fn scan<T: ReadTxn>(txn: &T, navigation: &ArrayRef) -> Self {
        let mut plan = Plan {
            pages: HashMap::new(),
            blocks: HashMap::new(),
            components: HashMap::new(),
            texts: HashMap::new(),
        };
        for page in navigation.iter(txn) {
            let Out::YMap(page) = page else { continue };
            let Some(page_id) = map_id(txn, &page) else { continue };
            plan.pages.insert(
                page_id.clone(),
                PlanPage {
                    parent: out_string(page.get(txn, KEY_PARENT)),
                    order: out_f64(page.get(txn, KEY_ORDER)).unwrap_or(0.0),
                },
            );
            let Some(blocks) = out_array(page.get(txn, KEY_BLOCKS)) else { continue };
            for block in blocks.iter(txn) {
                let Out::YMap(block) = block else { continue };
                let Some(block_id) = map_id(txn, &block) else { continue };
                plan.blocks.insert(
                    block_id.clone(),
                    PlanItem {
                        owner: page_id.clone(),
                        order: out_f64(block.get(txn, KEY_ORDER)).unwrap_or(0.0),
                    },
                );
                let Some(components) = out_array(block.get(txn, KEY_COMPONENTS)) else { continue };
                for component in components.iter(txn) {
                    let Out::YMap(component) = component else { continue };
                    let Some(component_id) = map_id(txn, &component) else { continue };
                    plan.components.insert(
                        component_id,
                        PlanItem {
                            owner: block_id.clone(),
                            order: out_f64(component.get(txn, KEY_ORDER)).unwrap_or(0.0),
                        },
                    );
                }
            }
        }
        plan
    }

    fn resolve<T: ReadTxn>(
        &mut self,
        txn: &T,
        store: &DocumentStore,
        op: StructuralOp,
    ) -> DocResult<Write> {
        match op {
            StructuralOp::CreatePage(page) => {
                let id = page.id.unwrap_or_else(new_id);
                if self.pages.contains_key(&id) {
                    return Err(DocError::DuplicateId(id));
                }
                if let Some(parent) = &page.parent_id {
                    if !self.pages.contains_key(parent) {
                        return Err(DocError::UnknownParent(parent.clone()));
                    }
                }
                let order = self.page_order(&page.parent_id, page.order, None)?;
                self.pages.insert(
                    id.clone(),
                    PlanPage { parent: page.parent_id.clone(), order },
                );
                Ok(Write::Page {
                    id,
                    parent: page.parent_id,
                    order,
                    properties: page.properties,
                })
            }
            StructuralOp::MovePage { id, parent_id, order } => {
                let current = self
                    .pages
                    .get(&id)
                    .ok_or_else(|| DocError::UnknownPage(id.clone()))?;
                let same_parent = current.parent == parent_id;
                let current_order = current.order;
                if let Some(parent) = &parent_id {
                    if !self.pages.contains_key(parent) {
                        return Err(DocError::UnknownParent(parent.clone()));
                    }
                    if self.is_ancestor_or_self(&id, parent) {
                        return Err(DocError::Cycle(id));
                    }
                }
                let order = match (order, same_parent) {
                    (None, true) => current_order,
                    (order, _) => self.page_order(&parent_id, order, Some(&id))?,
                };
                if let Some(page) = self.pages.get_mut(&id) {
                    page.parent = parent_id.clone();
                    page.order = order;
                }
                Ok(Write::MovePage { id, parent: parent_id, order })
            }
            StructuralOp::RemovePage { id } => {
                if !self.pages.contains_key(&id) {
                    return Err(DocError::UnknownPage(id));
                }
                if self.pages.values().any(|p| p.parent.as_deref() == Some(id.as_str())) {
                    return Err(DocError::HasChildren(id));
                }
                self.pages.remove(&id);
                let blocks: Vec<String> = self
                    .blocks
                    .iter()
                    .filter(|(_, b)| b.owner == id)
                    .map(|(block_id, _)| block_id.clone())
                    .collect();
                for block_id in blocks {
                    self.drop_block(&block_id);
                }
                Ok(Write::RemovePage { id })
            }
            StructuralOp::SetPageProperty { id, key, value } => {
                self.require_page(&id)?;
                Ok(Write::PageProperty { id, key, value: Some(value) })
            }
            StructuralOp::RemovePageProperty { id, key } => {
                self.require_page(&id)?;
                Ok(Write::PageProperty { id, key, value: None })
            }
            StructuralOp::CreateBlock(block) => {
                self.require_page(&block.page_id)?;
                let id = block.id.unwrap_or_else(new_id);
                if self.blocks.contains_key(&id) {
                    return Err(DocError::DuplicateId(id));
                }
                let order = block
                    .order
                    .unwrap_or_else(|| next_order(self.blocks.values(), &block.page_id));
                self.blocks.insert(
                    id.clone(),
                    PlanItem { owner: block.page_id.clone(), order },
                );
                Ok(Write::Block {
                    page_id: block.page_id,
                    id,
                    order,
                    icon: block.icon_name,
                    properties: block.properties,
                })
            }
            StructuralOp::RemoveBlock { id } => {
                if !self.blocks.contains_key(&id) {
                    return Err(DocError::UnknownBlock(id));
                }
                self.drop_block(&id);
                Ok(Write::RemoveBlock { id })
            }
            StructuralOp::SetBlockProperty { id, key, value } => {
                if !self.blocks.contains_key(&id) {
                    return Err(DocError::UnknownBlock(id));
                }
                Ok(Write::BlockProperty { id, key, value: Some(value) })
            }
            StructuralOp::CreateComponent(component) => {
                if !self.blocks.contains_key(&component.block_id) {
                    return Err(DocError::UnknownBlock(component.block_id));
                }
                let id = component.id.unwrap_or_else(new_id);
                if self.components.contains_key(&id) {
                    return Err(DocError::DuplicateId(id));
                }
                let order = component
                    .order
                    .unwrap_or_else(|| next_order(self.components.values(), &component.block_id));
                self.components.insert(
                    id.clone(),
                    PlanItem { owner: component.block_id.clone(), order },
                );
                self.texts.insert(id.clone(), component.html.clone());
                Ok(Write::Component {
                    block_id: component.block_id,
                    id,
                    component_type: component.component_type,
                    order,
                    properties: component.properties,
                    html: component.html,
                })
            }
            StructuralOp::RemoveComponent { id } => {
                if self.components.remove(&id).is_none() {
                    return Err(DocError::UnknownComponent(id));
                }
                self.texts.remove(&id);
                Ok(Write::RemoveComponent { id })
            }
            StructuralOp::SetComponentProperty { id, key, value } => {
                self.require_component(&id)?;
                Ok(Write::ComponentProperty { id, key, value: Some(value) })
            }
            StructuralOp::SetComponentHtml { id, html } => {
                self.require_component(&id)?;
                let current = self.text(txn, store, &id);
                let (index, delete, insert) = text_splice(current.as_deref().unwrap_or(""), &html);
                self.texts.insert(id.clone(), Some(html));
                Ok(Write::Splice {
                    id,
                    index: index as u32,
                    delete: delete as u32,
                    insert,
                })
            }
            StructuralOp::EditComponentText { id, index, delete, insert } => {
                self.require_component(&id)?;
                let current = self.text(txn, store, &id).unwrap_or_default();
                let start = index as usize;
                let end = start + delete as usize;
                if end > current.len()
                    || !current.is_char_boundary(start)
                    || !current.is_char_boundary(end)
                {
                    return Err(DocError::TextRange { id, index, delete });
                }
                let mut next = String::with_capacity(current.len() + insert.len());
                next.push_str(&current[..start]);
                next.push_str(&insert);
                next.push_str(&current[end..]);
                self.texts.insert(id.clone(), Some(next));
                Ok(Write::Splice { id, index, delete, insert })
            }
            StructuralOp::SetMetadata { key, value } => Ok(Write::Metadata { key, value: Some(value) }),
            StructuralOp::RemoveMetadata { key } => Ok(Write::Metadata { key, value: None }),
            StructuralOp::PutAsset { id, descriptor } => Ok(Write::Asset {
                id,
                descriptor: Some(descriptor),
            }),
            StructuralOp::RemoveAsset { id } => Ok(Write::Asset { id, descriptor: None }),
        }
    }

    fn require_page(&self, id: &str) -> DocResult<()> {
        if self.pages.contains_key(id) {
            Ok(())
        } else {
            Err(DocError::UnknownPage(id.to_string()))
        }
    }

    fn require_component(&self, id: &str) -> DocResult<()> {
        if self.components.contains_key(id) {
            Ok(())
        } else {
            Err(DocError::UnknownComponent(id.to_string()))
        }
    }

    /// Sibling order for a page under `parent`, honouring an explicit request.
    fn page_order(
        &self,
        parent: &Option<String>,
        requested: Option<f64>,
        exclude: Option<&str>,
    ) -> DocResult<f64> {
        let siblings = self
            .pages
            .iter()
            .filter(|(id, p)| &p.parent == parent && Some(id.as_str()) != exclude)
            .map(|(_, p)| p.order);
        match requested {
            Some(order) => {
                if siblings.clone().any(|o| o == order) {
                    return Err(DocError::OrderConflict {
                        parent: parent.clone(),
                        order,
                    });
                }
                Ok(order)
            }
            None => Ok(siblings.fold(None, |max: Option<f64>, o| Some(max.map_or(o, |m| m.max(o))))
                .map_or(0.0, |max| (max + 1.0).floor())),
        }
    }

    /// Whether `id` is `candidate` or one of its ancestors.
    fn is_ancestor_or_self(&self, id: &str, candidate: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(candidate.to_string());
        while let Some(page) = current {
            if page == id {
                return true;
            }
            if !seen.insert(page.clone()) {
                return false;
            }
            current = self.pages.get(&page).and_then(|p| p.parent.clone());
        }
        false
    }

    fn drop_block(&mut self, block_id: &str) {
        self.blocks.remove(block_id);
        let components: Vec<String> = self
            .components
            .iter()
            .filter(|(_, c)| c.owner == block_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in components {
            self.components.remove(&id);
            self.texts.remove(&id);
        }
    }

    fn text<T: ReadTxn>(&mut self, txn: &T, store: &DocumentStore, id: &str) -> Option<String> {
        self.texts
            .entry(id.to_string())
            .or_insert_with(|| {
                store
                    .find_component(txn, id)
                    .and_then(|(_, _, map)| out_text(map.get(txn, KEY_HTML)))
                    .map(|text| text.get_string(txn))
            })
            .clone()
    }
}

fn next_order<'a>(items: impl Iterator<Item = &'a PlanItem>, owner: &str) -> f64 {
    items
        .filter(|item| item.owner == owner)
        .map(|item| item.order)
        .fold(None, |max: Option<f64>, o| Some(max.map_or(o, |m| m.max(o))))
        .map_or(0.0, |max| (max + 1.0).floor())
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn build_node(
    page: Page,
    by_parent: &HashMap<Option<String>, Vec<Page>>,
    visited: &mut HashSet<String>,
) -> PageNode {
    visited.insert(page.id.clone());
    let children = by_parent
        .get(&Some(page.id.clone()))
        .map(|kids| {
            kids.iter()
                .filter(|kid| !visited.contains(&kid.id))
                .cloned()
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
        .into_iter()
        .map(|kid| build_node(kid, by_parent, visited))
        .collect();
    PageNode { page, children }
}

// ─── Structural paths ──────────────────────────────────────────────────

/// Entities addressed by a deep-observer path below `navigation`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityPath {
    pub page_id: Option<String>,
    pub block_id: Option<String>,
    pub component_id: Option<String>,
    /// Last key segment below the deepest entity (`properties`, `blocks`,
    /// `components`, `htmlContent`).
    pub field: Option<String>,
}

impl EntityPath {
    /// Number of entity levels resolved: 0 navigation, 1 page, 2 block, 3 component.
    pub fn depth(&self) -> usize {
        [&self.page_id, &self.block_id, &self.component_id]
            .iter()
            .take_while(|id| id.is_some())
            .count()
    }
}

/// Resolve a path relative to the `navigation` root into entity ids.
///
/// Safe to call from inside an observer: only reads through `txn`.
pub fn resolve_path<T: ReadTxn>(navigation: &ArrayRef, txn: &T, path: &Path) -> EntityPath {
    let mut resolved = EntityPath::default();
    let mut container = Some(navigation.clone());
    let mut level = 0;

    for segment in path.iter() {
        match segment {
            PathSegment::Index(index) => {
                let Some(array) = container.take() else { break };
                let Some(Out::YMap(map)) = array.get(txn, *index) else { break };
                let id = map_id(txn, &map);
                match level {
                    0 => resolved.page_id = id,
                    1 => resolved.block_id = id,
                    _ => resolved.component_id = id,
                }
                level += 1;
                resolved.field = None;
                container = match level {
                    1 => out_array(map.get(txn, KEY_BLOCKS)),
                    2 => out_array(map.get(txn, KEY_COMPONENTS)),
                    _ => None,
                };
            }
            PathSegment::Key(key) => {
                if resolved.field.is_none() {
                    resolved.field = Some(key.to_string());
                }
            }
        }
    }
    resolved
}

/// Id of an entity map carried in an observer delta.
pub fn entity_id<T: ReadTxn>(txn: &T, out: &Out) -> Option<String> {
    match out {
        Out::YMap(map) => map_id(txn, map),
        _ => None,
    }
}

// ─── Reading helpers ───────────────────────────────────────────────────

fn read_page<T: ReadTxn>(txn: &T, map: &MapRef) -> Option<Page> {
    let id = map_id(txn, map)?;
    let mut blocks: Vec<Block> = out_array(map.get(txn, KEY_BLOCKS))
        .map(|blocks| {
            blocks
                .iter(txn)
                .filter_map(|out| match out {
                    Out::YMap(block) => read_block(txn, &block),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    blocks.sort_by(|a, b| a.order.total_cmp(&b.order));
    Some(Page {
        id,
        parent_id: out_string(map.get(txn, KEY_PARENT)),
        order: out_f64(map.get(txn, KEY_ORDER)).unwrap_or(0.0),
        properties: read_properties(txn, map),
        blocks,
    })
}

fn read_block<T: ReadTxn>(txn: &T, map: &MapRef) -> Option<Block> {
    let id = map_id(txn, map)?;
    let mut components: Vec<Component> = out_array(map.get(txn, KEY_COMPONENTS))
        .map(|components| {
            components
                .iter(txn)
                .filter_map(|out| match out {
                    Out::YMap(component) => read_component(txn, &component),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    components.sort_by(|a, b| a.order.total_cmp(&b.order));
    Some(Block {
        id,
        order: out_f64(map.get(txn, KEY_ORDER)).unwrap_or(0.0),
        icon_name: out_string(map.get(txn, KEY_ICON)),
        properties: read_properties(txn, map),
        components,
    })
}

fn read_component<T: ReadTxn>(txn: &T, map: &MapRef) -> Option<Component> {
    Some(Component {
        id: map_id(txn, map)?,
        component_type: out_string(map.get(txn, KEY_TYPE)).unwrap_or_default(),
        order: out_f64(map.get(txn, KEY_ORDER)).unwrap_or(0.0),
        html_content: out_text(map.get(txn, KEY_HTML)).map(|text| text.get_string(txn)),
        properties: read_properties(txn, map),
    })
}

fn read_properties<T: ReadTxn>(txn: &T, map: &MapRef) -> Properties {
    out_map(map.get(txn, KEY_PROPERTIES))
        .map(|props| {
            props
                .iter(txn)
                .map(|(key, value)| (key.to_string(), out_to_json(txn, &value)))
                .collect()
        })
        .unwrap_or_default()
}

fn find_in<T: ReadTxn>(txn: &T, array: &ArrayRef, id: &str) -> Option<(u32, MapRef)> {
    array.iter(txn).enumerate().find_map(|(index, out)| match out {
        Out::YMap(map) if map_id(txn, &map).as_deref() == Some(id) => Some((index as u32, map)),
        _ => None,
    })
}

fn map_id<T: ReadTxn>(txn: &T, map: &MapRef) -> Option<String> {
    out_string(map.get(txn, KEY_ID))
}

fn out_string(out: Option<Out>) -> Option<String> {
    match out {
        Some(Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    }
}

fn out_f64(out: Option<Out>) -> Option<f64> {
    match out {
        Some(Out::Any(Any::Number(n))) => Some(n),
        Some(Out::Any(Any::BigInt(n))) => Some(n as f64),
        _ => None,
    }
}

fn out_map(out: Option<Out>) -> Option<MapRef> {
    match out {
        Some(Out::YMap(map)) => Some(map),
        _ => None,
    }
}

fn out_array(out: Option<Out>) -> Option<ArrayRef> {
    match out {
        Some(Out::YArray(array)) => Some(array),
        _ => None,
    }
}

fn out_text(out: Option<Out>) -> Option<TextRef> {
    match out {
        Some(Out::YText(text)) => Some(text),
        _ => None,
    }
}

fn out_to_json<T: ReadTxn>(txn: &T, out: &Out) -> Value {
    match out {
        Out::Any(any) => any_to_json(any),
        Out::YText(text) => Value::String(text.get_string(txn)),
        _ => Value::Null,
    }
}

fn parent_any(parent: Option<&str>) -> Any {
    match parent {
        Some(parent) => Any::String(parent.into()),
        None => Any::Null,
    }
}

fn child_array(txn: &mut TransactionMut, map: &MapRef, key: &str) -> ArrayRef {
    match out_array(map.get(txn, key)) {
        Some(array) => array,
        None => map.insert(txn, key, ArrayPrelim::default()),
    }
}

fn child_map(txn: &mut TransactionMut, map: &MapRef, key: &str) -> MapRef {
    match out_map(map.get(txn, key)) {
        Some(child) => child,
        None => map.insert(txn, key, MapPrelim::default()),
    }
}

fn write_properties(txn: &mut TransactionMut, map: &MapRef, properties: &Properties) {
    let props = child_map(txn, map, KEY_PROPERTIES);
    for (key, value) in properties {
        props.insert(txn, key.as_str(), json_to_any(value));
    }
}

fn write_property(txn: &mut TransactionMut, map: &MapRef, key: String, value: Option<Value>) {
    let props = child_map(txn, map, KEY_PROPERTIES);
    match value {
        Some(value) => {
            props.insert(txn, key, json_to_any(&value));
        }
        None => {
            props.remove(txn, &key);
        }
    }
}
