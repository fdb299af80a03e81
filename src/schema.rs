//! Schema query surface and selector validators.
//!
//! Schema parsing proper is the job of an external schema engine; the
//! subscription core only needs the query surface modelled here: module
//! lookup, xpath node-set selection, xpath atom collection, canonical-path
//! resolution and DFS iteration. `SchemaTree` is a self-contained in-memory
//! implementation of that surface, also used by the test suite.
//!
//! The validators check subscription selectors before anything is published:
//! change xpaths must select at least one node, operational paths are
//! classified CONFIG / STATE / MIXED, notification xpaths must reach a
//! notification (or a schema-mount extension), and RPC xpaths are stripped
//! of predicates and resolved to an operation node.

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Container,
    Leaf,
    LeafList,
    List,
    AnyXml,
    AnyData,
    Choice,
    Case,
    Notification,
    Rpc,
    Action,
}

impl NodeKind {
    fn is_data(self) -> bool {
        matches!(
            self,
            NodeKind::Container
                | NodeKind::Leaf
                | NodeKind::LeafList
                | NodeKind::List
                | NodeKind::AnyXml
                | NodeKind::AnyData
        )
    }

    fn is_operation(self) -> bool {
        matches!(self, NodeKind::Rpc | NodeKind::Action)
    }
}

/// Classification of the subtree selected by an operational-get path.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperGetKind {
    Config = 1,
    State = 2,
    Mixed = 3,
}

impl OperGetKind {
    pub fn from_u32(value: u32) -> Option<OperGetKind> {
        match value {
            1 => Some(OperGetKind::Config),
            2 => Some(OperGetKind::State),
            3 => Some(OperGetKind::Mixed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub name: String,
    pub kind: NodeKind,
    /// `config true` nodes carry configuration; `config false` is state.
    pub config: bool,
    pub is_list_key: bool,
    /// Node carries the schema-mount extension: anything, including
    /// notifications, may be mounted beneath it.
    pub has_mount_point: bool,
    /// Node lives in a schema context nested inside an extension rather
    /// than the main context.
    pub ext_context: bool,
    pub children: Vec<SchemaNode>,
}

impl SchemaNode {
    fn new(name: &str, kind: NodeKind) -> SchemaNode {
        SchemaNode {
            name: name.to_string(),
            kind,
            config: true,
            is_list_key: false,
            has_mount_point: false,
            ext_context: false,
            children: Vec::new(),
        }
    }

    pub fn container(name: &str) -> SchemaNode {
        Self::new(name, NodeKind::Container)
    }

    pub fn leaf(name: &str) -> SchemaNode {
        Self::new(name, NodeKind::Leaf)
    }

    pub fn leaf_list(name: &str) -> SchemaNode {
        Self::new(name, NodeKind::LeafList)
    }

    pub fn list(name: &str) -> SchemaNode {
        Self::new(name, NodeKind::List)
    }

    pub fn choice(name: &str) -> SchemaNode {
        Self::new(name, NodeKind::Choice)
    }

    pub fn case(name: &str) -> SchemaNode {
        Self::new(name, NodeKind::Case)
    }

    pub fn notification(name: &str) -> SchemaNode {
        Self::new(name, NodeKind::Notification)
    }

    pub fn rpc(name: &str) -> SchemaNode {
        Self::new(name, NodeKind::Rpc)
    }

    pub fn action(name: &str) -> SchemaNode {
        Self::new(name, NodeKind::Action)
    }

    pub fn state(mut self) -> SchemaNode {
        self.config = false;
        self
    }

    pub fn key(mut self) -> SchemaNode {
        self.is_list_key = true;
        self
    }

    pub fn mount_point(mut self) -> SchemaNode {
        self.has_mount_point = true;
        self
    }

    pub fn in_ext_context(mut self) -> SchemaNode {
        self.ext_context = true;
        self
    }

    pub fn with_children(mut self, children: Vec<SchemaNode>) -> SchemaNode {
        self.children = children;
        self
    }

    /// Depth-first walk; the visitor returns `false` to stop.
    fn dfs(&self, visit: &mut dyn FnMut(&SchemaNode) -> bool) -> bool {
        if !visit(self) {
            return false;
        }
        for child in &self.children {
            if !child.dfs(visit) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct SchemaModule {
    pub name: String,
    pub tree: Vec<SchemaNode>,
}

impl SchemaModule {
    pub fn new(name: &str, tree: Vec<SchemaNode>) -> SchemaModule {
        SchemaModule {
            name: name.to_string(),
            tree,
        }
    }

    fn dfs(&self, visit: &mut dyn FnMut(&SchemaNode) -> bool) {
        for node in &self.tree {
            if !node.dfs(visit) {
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaTree {
    modules: Vec<SchemaModule>,
}

impl SchemaTree {
    pub fn new(modules: Vec<SchemaModule>) -> SchemaTree {
        SchemaTree { modules }
    }

    pub fn modules(&self) -> &[SchemaModule] {
        &self.modules
    }

    pub fn module(&self, name: &str) -> Option<&SchemaModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Schema nodes selected by an absolute xpath; predicates are ignored
    /// for matching, `*` matches any child. Choice and case layers are
    /// transparent, as they are in data paths.
    pub fn find_xpath(&self, xpath: &str) -> Result<Vec<&SchemaNode>> {
        let (module, segments) = self.parse_selector(xpath)?;
        let mut current: Vec<&SchemaNode> = Vec::new();
        for (depth, segment) in segments.iter().enumerate() {
            let next: Vec<&SchemaNode> = if depth == 0 {
                module
                    .tree
                    .iter()
                    .flat_map(expand_schema_only)
                    .filter(|n| segment.as_str() == "*" || n.name == *segment)
                    .collect()
            } else {
                current
                    .iter()
                    .flat_map(|n| n.children.iter().flat_map(expand_schema_only))
                    .filter(|n| segment.as_str() == "*" || n.name == *segment)
                    .collect()
            };
            if next.is_empty() {
                return Ok(Vec::new());
            }
            current = next;
        }
        Ok(current)
    }

    /// All schema nodes an xpath depends on: the nodes matched at every
    /// step, not just the final set.
    pub fn find_xpath_atoms(&self, xpath: &str) -> Result<Vec<&SchemaNode>> {
        let (module, segments) = self.parse_selector(xpath)?;
        let mut atoms: Vec<&SchemaNode> = Vec::new();
        let mut current: Vec<&SchemaNode> = Vec::new();
        for (depth, segment) in segments.iter().enumerate() {
            let next: Vec<&SchemaNode> = if depth == 0 {
                module
                    .tree
                    .iter()
                    .flat_map(expand_schema_only)
                    .filter(|n| segment.as_str() == "*" || n.name == *segment)
                    .collect()
            } else {
                current
                    .iter()
                    .flat_map(|n| n.children.iter().flat_map(expand_schema_only))
                    .filter(|n| segment.as_str() == "*" || n.name == *segment)
                    .collect()
            };
            atoms.extend(next.iter().copied());
            if next.is_empty() {
                return Ok(Vec::new());
            }
            current = next;
        }
        Ok(atoms)
    }

    /// Resolves a canonical path (no predicates, no wildcards) to a single
    /// schema node.
    pub fn find_path(&self, path: &str) -> Option<&SchemaNode> {
        let (module, segments) = self.parse_selector(path).ok()?;
        let mut current: Option<&SchemaNode> = None;
        for (depth, segment) in segments.iter().enumerate() {
            let pool: Vec<&SchemaNode> = match (depth, current) {
                (0, _) => module.tree.iter().flat_map(expand_schema_only).collect(),
                (_, Some(node)) => node
                    .children
                    .iter()
                    .flat_map(expand_schema_only)
                    .collect(),
                _ => return None,
            };
            current = pool.into_iter().find(|n| n.name == *segment);
            current?;
        }
        current
    }

    fn parse_selector(&self, xpath: &str) -> Result<(&SchemaModule, Vec<String>)> {
        let segments = split_segments(xpath)?;
        let first = segments
            .first()
            .ok_or_else(|| Error::InvalArg(format!("xpath \"{xpath}\" has no steps")))?;
        let (module_name, _) = split_prefix(first).ok_or_else(|| {
            Error::InvalArg(format!(
                "xpath \"{xpath}\" does not start with a module prefix"
            ))
        })?;
        let module = self.module(&module_name).ok_or_else(|| {
            Error::InvalArg(format!(
                "xpath \"{xpath}\" references unknown module \"{module_name}\""
            ))
        })?;
        let names = segments
            .iter()
            .map(|s| match split_prefix(s) {
                Some((_, name)) => name,
                None => s.clone(),
            })
            .collect();
        Ok((module, names))
    }
}

/// Expands choice and case layers away: yields the node itself for data
/// nodes, or the data descendants beneath transparent layers.
fn expand_schema_only(node: &SchemaNode) -> Vec<&SchemaNode> {
    match node.kind {
        NodeKind::Choice | NodeKind::Case => node
            .children
            .iter()
            .flat_map(expand_schema_only)
            .collect(),
        _ => vec![node],
    }
}

/// Splits an absolute xpath into its top-level segments with predicates
/// stripped, respecting quoting inside predicates.
fn split_segments(xpath: &str) -> Result<Vec<String>> {
    let trimmed = trim_predicates(xpath)?;
    if !trimmed.starts_with('/') {
        return Err(Error::InvalArg(format!(
            "xpath \"{xpath}\" is not absolute"
        )));
    }
    let segments: Vec<String> = trimmed
        .split('/')
        .skip(1)
        .map(|s| s.to_string())
        .collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::InvalArg(format!(
            "xpath \"{xpath}\" contains an empty step"
        )));
    }
    Ok(segments)
}

fn split_prefix(segment: &str) -> Option<(String, String)> {
    let colon = segment.find(':')?;
    Some((
        segment[..colon].to_string(),
        segment[colon + 1..].to_string(),
    ))
}

/// Strips `[...]` predicates from an xpath, leaving the canonical path.
/// Quote-aware; unbalanced brackets are an error.
pub fn trim_predicates(xpath: &str) -> Result<String> {
    let mut out = String::with_capacity(xpath.len());
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for ch in xpath.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' if depth > 0 => quote = Some(ch),
                '[' => depth += 1,
                ']' => {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        Error::InvalArg(format!("unbalanced predicate in \"{xpath}\""))
                    })?;
                }
                _ if depth == 0 => out.push(ch),
                _ => {}
            },
        }
    }
    if depth != 0 || quote.is_some() {
        return Err(Error::InvalArg(format!(
            "unbalanced predicate in \"{xpath}\""
        )));
    }
    Ok(out)
}

/// Module prefix of the first step of an absolute xpath.
pub fn first_module(xpath: &str) -> Result<String> {
    let segments = split_segments(xpath)?;
    let first = segments
        .first()
        .ok_or_else(|| Error::InvalArg(format!("xpath \"{xpath}\" has no steps")))?;
    split_prefix(first)
        .map(|(module, _)| module)
        .ok_or_else(|| {
            Error::InvalArg(format!(
                "xpath \"{xpath}\" does not start with a module prefix"
            ))
        })
}

/// Whether `xpath` selects the node at `path` (or an ancestor of it):
/// segment-wise prefix match with `*` wildcards, predicates stripped.
pub fn xpath_selects_path(xpath: &str, path: &str) -> bool {
    let Ok(sel) = split_segments(xpath) else {
        return false;
    };
    let Ok(target) = split_segments(path) else {
        return false;
    };
    if sel.len() > target.len() {
        return false;
    }
    sel.iter().zip(target.iter()).all(|(s, t)| {
        let s_name = split_prefix(s).map(|(_, n)| n).unwrap_or_else(|| s.clone());
        let t_name = split_prefix(t).map(|(_, n)| n).unwrap_or_else(|| t.clone());
        s_name == "*" || s_name == t_name
    })
}

/// A change xpath must parse against the schema and select at least one
/// node.
pub fn change_xpath_check(schema: &SchemaTree, xpath: &str) -> Result<()> {
    let set = schema.find_xpath(xpath)?;
    if set.is_empty() {
        return Err(Error::InvalArg(format!(
            "xpath \"{xpath}\" is not selecting any nodes"
        )));
    }
    Ok(())
}

/// Validates an operational path and classifies the selected subtrees.
/// Traversal is depth-first and short-circuits once MIXED is certain.
pub fn oper_path_check(schema: &SchemaTree, path: &str) -> Result<OperGetKind> {
    let set = schema.find_xpath(path)?;
    if set.is_empty() {
        return Err(Error::InvalArg(format!(
            "path \"{path}\" does not point to any nodes"
        )));
    }

    let mut kind: Option<OperGetKind> = None;
    for node in set {
        if node.is_list_key {
            return Err(Error::InvalArg(format!(
                "path \"{path}\" selects a list key, whole list instances must be provided instead"
            )));
        }
        node.dfs(&mut |elem| {
            match elem.kind {
                data if data.is_data() => {
                    let observed = if elem.config {
                        OperGetKind::Config
                    } else {
                        OperGetKind::State
                    };
                    kind = Some(match kind {
                        None => observed,
                        Some(prev) if prev == observed => prev,
                        Some(_) => OperGetKind::Mixed,
                    });
                }
                NodeKind::Choice | NodeKind::Case => {}
                _ => return false,
            }
            // once state or mixed, descending further cannot change anything
            !matches!(kind, Some(OperGetKind::State) | Some(OperGetKind::Mixed))
        });
        if kind == Some(OperGetKind::Mixed) {
            break;
        }
    }
    kind.ok_or_else(|| {
        Error::InvalArg(format!(
            "path \"{path}\" does not select any data nodes"
        ))
    })
}

/// Validates a notification selector. With an xpath, its atoms must include
/// a notification node or a schema-mount extension; without one, the whole
/// module is searched.
pub fn notif_xpath_check(
    schema: &SchemaTree,
    module_name: &str,
    xpath: Option<&str>,
) -> Result<()> {
    let module = schema
        .module(module_name)
        .ok_or_else(|| Error::NotFound(format!("module \"{module_name}\" is not in the schema")))?;

    match xpath {
        Some(xpath) => {
            let atoms = schema.find_xpath_atoms(xpath)?;
            let found = atoms
                .iter()
                .any(|n| n.kind == NodeKind::Notification || n.has_mount_point);
            if !found {
                return Err(Error::InvalArg(format!(
                    "xpath \"{xpath}\" does not select any notifications"
                )));
            }
        }
        None => {
            let mut found = false;
            module.dfs(&mut |node| {
                if node.kind == NodeKind::Notification || node.has_mount_point {
                    found = true;
                    return false;
                }
                true
            });
            if !found {
                return Err(Error::NotFound(format!(
                    "module \"{module_name}\" does not define any notifications"
                )));
            }
        }
    }
    Ok(())
}

/// Validates an RPC/action xpath: strips predicates to the canonical path,
/// resolves it to an operation node and reports whether the operation lives
/// in a nested (extension) schema context.
pub fn rpc_xpath_check(schema: &SchemaTree, xpath: &str) -> Result<(String, bool)> {
    let path = trim_predicates(xpath)?;
    let node = schema
        .find_path(&path)
        .ok_or_else(|| Error::InvalArg(format!("path \"{path}\" does not exist in the schema")))?;
    if !node.kind.is_operation() {
        return Err(Error::InvalArg(format!(
            "path \"{path}\" does not identify an RPC nor an action"
        )));
    }
    Ok((path, node.ext_context))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> SchemaTree {
        SchemaTree::new(vec![
            SchemaModule::new(
                "ietf-interfaces",
                vec![SchemaNode::container("interfaces").with_children(vec![
                    SchemaNode::list("interface").with_children(vec![
                        SchemaNode::leaf("name").key(),
                        SchemaNode::leaf("enabled"),
                        SchemaNode::leaf("oper-status").state(),
                    ]),
                ])],
            ),
            SchemaModule::new(
                "my-mod",
                vec![
                    SchemaNode::container("config-tree")
                        .with_children(vec![SchemaNode::leaf("knob")]),
                    SchemaNode::container("state-tree")
                        .state()
                        .with_children(vec![SchemaNode::leaf("gauge").state()]),
                    SchemaNode::container("mixed-tree").with_children(vec![
                        SchemaNode::leaf("knob"),
                        SchemaNode::leaf("gauge").state(),
                    ]),
                    SchemaNode::notification("alarm")
                        .with_children(vec![SchemaNode::leaf("severity")]),
                    SchemaNode::rpc("reset"),
                    SchemaNode::container("box").with_children(vec![
                        SchemaNode::action("reboot").in_ext_context(),
                    ]),
                ],
            ),
            SchemaModule::new("empty-mod", vec![SchemaNode::container("top")]),
            SchemaModule::new(
                "mounted-mod",
                vec![SchemaNode::container("root").mount_point()],
            ),
        ])
    }

    #[test]
    fn change_xpath_selects_nodes() {
        let schema = schema();
        change_xpath_check(&schema, "/ietf-interfaces:interfaces/interface").unwrap();
        change_xpath_check(
            &schema,
            "/ietf-interfaces:interfaces/interface[name='eth0']/enabled",
        )
        .unwrap();
        let err = change_xpath_check(&schema, "/ietf-interfaces:interfaces/nope").unwrap_err();
        assert!(matches!(err, Error::InvalArg(_)));
        assert!(err.to_string().contains("/ietf-interfaces:interfaces/nope"));
        let missing = change_xpath_check(&schema, "/nonexistent:x").unwrap_err();
        assert!(missing.to_string().contains("nonexistent"));
    }

    #[test]
    fn oper_path_classification() {
        let schema = schema();
        assert_eq!(
            oper_path_check(&schema, "/my-mod:config-tree").unwrap(),
            OperGetKind::Config
        );
        assert_eq!(
            oper_path_check(&schema, "/my-mod:state-tree").unwrap(),
            OperGetKind::State
        );
        assert_eq!(
            oper_path_check(&schema, "/my-mod:mixed-tree").unwrap(),
            OperGetKind::Mixed
        );
    }

    #[test]
    fn oper_path_rejects_list_key() {
        let schema = schema();
        let err =
            oper_path_check(&schema, "/ietf-interfaces:interfaces/interface/name").unwrap_err();
        assert!(err.to_string().contains("list key"));
    }

    #[test]
    fn notif_xpath_rules() {
        let schema = schema();
        notif_xpath_check(&schema, "my-mod", Some("/my-mod:alarm")).unwrap();
        notif_xpath_check(&schema, "my-mod", None).unwrap();
        // schema mount admits notifications that are not modelled
        notif_xpath_check(&schema, "mounted-mod", Some("/mounted-mod:root")).unwrap();
        notif_xpath_check(&schema, "mounted-mod", None).unwrap();

        let err =
            notif_xpath_check(&schema, "my-mod", Some("/my-mod:config-tree")).unwrap_err();
        assert!(matches!(err, Error::InvalArg(_)));
        let err = notif_xpath_check(&schema, "empty-mod", None).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn rpc_xpath_resolution() {
        let schema = schema();
        let (path, is_ext) = rpc_xpath_check(&schema, "/my-mod:reset").unwrap();
        assert_eq!(path, "/my-mod:reset");
        assert!(!is_ext);

        let (path, is_ext) =
            rpc_xpath_check(&schema, "/my-mod:box/reboot[delay='3']").unwrap();
        assert_eq!(path, "/my-mod:box/reboot");
        assert!(is_ext);

        let err = rpc_xpath_check(&schema, "/my-mod:config-tree").unwrap_err();
        assert!(err.to_string().contains("RPC"));
    }

    #[test]
    fn predicate_trimming() {
        assert_eq!(
            trim_predicates("/m:list[key='a[b]']/leaf").unwrap(),
            "/m:list/leaf"
        );
        assert!(trim_predicates("/m:list[key='a").is_err());
        assert!(trim_predicates("/m:list]").is_err());
    }

    #[test]
    fn xpath_path_selection() {
        assert!(xpath_selects_path("/m:alarm", "/m:alarm"));
        assert!(xpath_selects_path("/m:*", "/m:alarm"));
        assert!(xpath_selects_path("/m:box", "/m:box/alarm"));
        assert!(!xpath_selects_path("/m:other", "/m:alarm"));
        assert!(!xpath_selects_path("/m:box/alarm", "/m:box"));
    }
}
