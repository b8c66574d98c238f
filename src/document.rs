//! Parsed catalog documents.
//!
//! A [`Document`] is an arena of immutable nodes addressed by [`NodeId`].
//! Node ids are assigned in document order, so sorting ids sorts nodes the
//! way they appear in the source. Documents are never mutated after parsing;
//! regrouping builds a new document instead of re-parenting nodes, which
//! lets concurrently running extraction tasks share one `Arc<Document>`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed XML at byte {position}: {message}")]
    Malformed { position: u64, message: String },

    #[error("unsupported charset '{0}'")]
    UnsupportedCharset(String),
}

/// Index of a node inside its [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Element { name: String },
    Attribute { name: String, value: String },
    Text(String),
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    attributes: Vec<NodeId>,
}

/// Character sets accepted for `source.charset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
    Ascii,
}

impl FromStr for Charset {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" => Ok(Charset::Latin1),
            "us-ascii" | "ascii" => Ok(Charset::Ascii),
            _ => Err(DocumentError::UnsupportedCharset(s.to_string())),
        }
    }
}

impl Charset {
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => {
                let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
                String::from_utf8_lossy(bytes).into_owned()
            }
            Charset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Charset::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
                .collect(),
        }
    }
}

/// An immutable, index-addressed XML tree.
#[derive(Clone)]
pub struct Document {
    nodes: Vec<NodeData>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl Document {
    fn empty() -> Self {
        Self {
            nodes: vec![NodeData {
                kind: NodeKind::Root,
                parent: None,
                children: Vec::new(),
                attributes: Vec::new(),
            }],
        }
    }

    /// Parse UTF-8 XML text.
    pub fn parse_str(xml: &str) -> Result<Self, DocumentError> {
        let mut reader = Reader::from_str(xml);

        let mut doc = Self::empty();
        let mut stack = vec![doc.root()];

        loop {
            let position = reader.buffer_position();
            let malformed = |message: String| DocumentError::Malformed { position, message };

            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let parent = current(&stack);
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let id = doc.push(NodeKind::Element { name }, parent);
                    for attr in e.attributes() {
                        let attr = attr.map_err(|e| malformed(e.to_string()))?;
                        doc.push_attribute(id, &attr)
                            .map_err(|e| malformed(e.to_string()))?;
                    }
                    stack.push(id);
                }
                Ok(Event::Empty(e)) => {
                    let parent = current(&stack);
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let id = doc.push(NodeKind::Element { name }, parent);
                    for attr in e.attributes() {
                        let attr = attr.map_err(|e| malformed(e.to_string()))?;
                        doc.push_attribute(id, &attr)
                            .map_err(|e| malformed(e.to_string()))?;
                    }
                }
                Ok(Event::End(_)) => {
                    if stack.len() > 1 {
                        if let Some(closed) = stack.pop() {
                            doc.drop_indentation(closed);
                        }
                    }
                }
                Ok(Event::Text(e)) => {
                    let text = e.unescape().map_err(|e| malformed(e.to_string()))?;
                    if !text.is_empty() {
                        doc.push_text(current(&stack), text.into_owned());
                    }
                }
                Ok(Event::CData(e)) => {
                    let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    if !text.is_empty() {
                        doc.push_text(current(&stack), text);
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(malformed(e.to_string())),
            }
        }

        if stack.len() > 1 {
            return Err(DocumentError::Malformed {
                position: reader.buffer_position(),
                message: format!("{} unclosed element(s) at end of input", stack.len() - 1),
            });
        }
        doc.drop_indentation(doc.root());

        Ok(doc)
    }

    /// Decode `bytes` with `charset` and parse the result.
    pub fn parse_bytes(bytes: &[u8], charset: Charset) -> Result<Self, DocumentError> {
        Self::parse_str(&charset.decode(bytes))
    }

    /// Build a new document whose root element `name` holds deep copies of
    /// `targets`, in the given order.
    ///
    /// Attribute and text targets are copied as text children.
    pub fn regroup(targets: &[Target], name: &str) -> Self {
        let mut doc = Self::empty();
        let group = doc.push(
            NodeKind::Element {
                name: name.to_string(),
            },
            doc.root(),
        );
        for target in targets {
            doc.copy_subtree(target.document(), target.node(), group);
        }
        doc
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// First element child of the root.
    pub fn document_element(&self) -> Option<NodeId> {
        self.children(self.root())
            .iter()
            .copied()
            .find(|id| self.is_element(*id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0].kind
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn attributes(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].attributes
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.kind(id), NodeKind::Element { .. })
    }

    /// Qualified name of an element or attribute.
    pub fn name(&self, id: NodeId) -> Option<&str> {
        match self.kind(id) {
            NodeKind::Element { name } | NodeKind::Attribute { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Name without namespace prefix.
    pub fn local_name(&self, id: NodeId) -> Option<&str> {
        self.name(id)
            .map(|name| name.rsplit(':').next().unwrap_or(name))
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.attributes(id).iter().find_map(|attr| match self.kind(*attr) {
            NodeKind::Attribute { name: n, value } if n == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// Concatenated text of a node and all its descendants.
    pub fn text_content(&self, id: NodeId) -> String {
        match self.kind(id) {
            NodeKind::Text(text) => text.clone(),
            NodeKind::Attribute { value, .. } => value.clone(),
            NodeKind::Root | NodeKind::Element { .. } => {
                let mut out = String::new();
                self.collect_text(id, &mut out);
                out
            }
        }
    }

    /// Pre-order descendants (children, grandchildren, ...) excluding
    /// attributes and excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut pending: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(next) = pending.pop() {
            out.push(next);
            pending.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        for child in self.children(id) {
            match self.kind(*child) {
                NodeKind::Text(text) => out.push_str(text),
                NodeKind::Element { .. } => self.collect_text(*child, out),
                _ => {}
            }
        }
    }

    fn push(&mut self, kind: NodeKind, parent: NodeId) -> NodeId {
        let id = NodeId(self.nodes.len());
        let is_attribute = matches!(kind, NodeKind::Attribute { .. });
        self.nodes.push(NodeData {
            kind,
            parent: Some(parent),
            children: Vec::new(),
            attributes: Vec::new(),
        });
        if is_attribute {
            self.nodes[parent.0].attributes.push(id);
        } else {
            self.nodes[parent.0].children.push(id);
        }
        id
    }

    fn push_attribute(
        &mut self,
        element: NodeId,
        attr: &quick_xml::events::attributes::Attribute<'_>,
    ) -> Result<NodeId, quick_xml::Error> {
        let name = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        Ok(self.push(NodeKind::Attribute { name, value }, element))
    }

    fn push_text(&mut self, parent: NodeId, text: String) {
        // Merge with a directly preceding text sibling (e.g. text + CDATA).
        if let Some(last) = self.nodes[parent.0].children.last().copied() {
            if let NodeKind::Text(existing) = &mut self.nodes[last.0].kind {
                existing.push_str(&text);
                return;
            }
        }
        self.push(NodeKind::Text(text), parent);
    }

    /// Detach layout whitespace from element-only content.
    ///
    /// A text child is layout when it is whitespace spanning a line break
    /// and none of its siblings carries real text. Mixed content is kept
    /// verbatim, so `text_content` matches the source.
    fn drop_indentation(&mut self, id: NodeId) {
        let children = &self.nodes[id.0].children;
        let has_element = children
            .iter()
            .any(|c| matches!(self.nodes[c.0].kind, NodeKind::Element { .. }));
        let has_text = children.iter().any(|c| {
            matches!(&self.nodes[c.0].kind, NodeKind::Text(t) if !t.trim().is_empty())
        });
        if !has_element || has_text {
            return;
        }

        let nodes = &self.nodes;
        let kept: Vec<NodeId> = children
            .iter()
            .copied()
            .filter(|c| !matches!(&nodes[c.0].kind, NodeKind::Text(t) if t.contains('\n')))
            .collect();
        self.nodes[id.0].children = kept;
    }

    fn copy_subtree(&mut self, src: &Document, id: NodeId, parent: NodeId) {
        match src.kind(id) {
            NodeKind::Root => {
                for child in src.children(id) {
                    self.copy_subtree(src, *child, parent);
                }
            }
            NodeKind::Element { name } => {
                let copy = self.push(NodeKind::Element { name: name.clone() }, parent);
                for attr in src.attributes(id) {
                    self.push(src.kind(*attr).clone(), copy);
                }
                for child in src.children(id) {
                    self.copy_subtree(src, *child, copy);
                }
            }
            NodeKind::Attribute { value, .. } => self.push_text(parent, value.clone()),
            NodeKind::Text(text) => self.push_text(parent, text.clone()),
        }
    }
}

fn current(stack: &[NodeId]) -> NodeId {
    stack.last().copied().unwrap_or(NodeId(0))
}

/// Handle to one node of a shared document.
///
/// Cloning a target only bumps the document's reference count.
#[derive(Clone)]
pub struct Target {
    doc: Arc<Document>,
    node: NodeId,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("node", &self.node)
            .field("kind", self.doc.kind(self.node))
            .finish()
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.doc, &other.doc) && self.node == other.node
    }
}

impl Target {
    pub fn new(doc: Arc<Document>, node: NodeId) -> Self {
        Self { doc, node }
    }

    /// Target the document root.
    pub fn root(doc: Arc<Document>) -> Self {
        let node = doc.root();
        Self { doc, node }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn shared(&self) -> &Arc<Document> {
        &self.doc
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Another node of the same document.
    pub fn at(&self, node: NodeId) -> Self {
        Self {
            doc: Arc::clone(&self.doc),
            node,
        }
    }

    pub fn text(&self) -> String {
        self.doc.text_content(self.node)
    }

    pub fn name(&self) -> Option<&str> {
        self.doc.name(self.node)
    }
}
