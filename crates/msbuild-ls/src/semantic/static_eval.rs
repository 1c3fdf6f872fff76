//
// semantic/static_eval.rs
//
// Evaluator that reads declarations straight from the syntax tree
//

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;

use crate::position::Position;
use crate::syntax::{self, NodeId, SyntaxKind, SyntaxTree};

use super::evaluator::{EvaluationError, Evaluator, WorkspaceContext};
use super::graph::{EvaluatedGraph, EvaluatedObject, ObjectKind, SourceSpan};

/// Item attributes that are not metadata.
const RESERVED_ITEM_ATTRIBUTES: &[&str] = &[
    "Include",
    "Exclude",
    "Remove",
    "Update",
    "Condition",
    "KeepMetadata",
    "RemoveMetadata",
    "KeepDuplicates",
    "MatchOnMetadata",
    "MatchOnMetadataOptions",
    "Label",
];

/// Evaluates project structure without running a build engine.
///
/// Conditions are not evaluated and imports are not followed, but every
/// declaration in the file is reported with its location, and `$(Name)`
/// references in property values expand against earlier properties and the
/// global properties.
#[derive(Debug, Default, Clone)]
pub struct StaticEvaluator;

impl StaticEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core of [`Evaluator::evaluate`].
    pub fn evaluate_text(
        &self,
        text: &str,
        file: &Path,
        context: &WorkspaceContext,
    ) -> Result<EvaluatedGraph, EvaluationError> {
        let tree = syntax::parse(text);
        if let Some(error) = tree.errors().first() {
            return Err(EvaluationError::invalid(
                format!("{} is not well-formed: {}", file.display(), error.message),
                Some(error.range.start().position().to_one_based()),
            ));
        }
        let Some(root) = tree.root_element() else {
            return Err(EvaluationError::invalid(
                format!("{} has no root element", file.display()),
                None,
            ));
        };
        let root_name = tree.node(root).name().unwrap_or_default();
        if root_name != "Project" {
            return Err(EvaluationError::invalid(
                format!("root element is <{root_name}>, expected <Project>"),
                Some(start_of(&tree, root)),
            ));
        }

        let mut walker = Walker {
            tree: &tree,
            file,
            globals: &context.global_properties,
            properties: BTreeMap::new(),
            property_objects: HashMap::new(),
            targets: HashSet::new(),
            graph: EvaluatedGraph::new(file),
        };
        walker.project_body(root)?;
        log::trace!(
            "Statically evaluated {} into {} objects",
            file.display(),
            walker.graph.objects.len()
        );
        Ok(walker.graph)
    }
}

#[async_trait]
impl Evaluator for StaticEvaluator {
    async fn evaluate(
        &self,
        text: &str,
        file: &Path,
        context: &WorkspaceContext,
    ) -> Result<EvaluatedGraph, EvaluationError> {
        self.evaluate_text(text, file, context)
    }
}

fn start_of(tree: &SyntaxTree, id: NodeId) -> Position {
    tree.node(id).range.start().position().to_one_based()
}

struct Walker<'a> {
    tree: &'a SyntaxTree,
    file: &'a Path,
    globals: &'a BTreeMap<String, String>,
    /// Property values defined so far, keyed case-insensitively.
    properties: BTreeMap<String, String>,
    /// Graph index of each property's object, keyed like `properties`.
    property_objects: HashMap<String, usize>,
    targets: HashSet<String>,
    graph: EvaluatedGraph,
}

impl Walker<'_> {
    fn object(&self, kind: ObjectKind, name: &str, at: NodeId) -> EvaluatedObject {
        EvaluatedObject::new(kind, name, self.file).with_span(SourceSpan::at(start_of(self.tree, at)))
    }

    fn required_attribute(&self, element: NodeId, name: &str) -> Result<String, EvaluationError> {
        match self.tree.attribute(element, name) {
            Some(attr) if !attr.value.trim().is_empty() => Ok(attr.value.trim().to_string()),
            _ => Err(EvaluationError::invalid(
                format!(
                    "<{}> requires a non-empty {name} attribute",
                    self.tree.node(element).name().unwrap_or_default()
                ),
                Some(start_of(self.tree, element)),
            )),
        }
    }

    fn project_body(&mut self, parent: NodeId) -> Result<(), EvaluationError> {
        let children: Vec<NodeId> = self.tree.child_elements(parent).collect();
        for child in children {
            match self.tree.node(child).name().unwrap_or_default() {
                "PropertyGroup" => self.property_group(child),
                "ItemGroup" => self.item_group(child),
                "Import" => self.import(child)?,
                "ImportGroup" => {
                    let imports: Vec<NodeId> = self.tree.child_elements(child).collect();
                    for import in imports {
                        if self.tree.node(import).name() == Some("Import") {
                            self.import(import)?;
                        }
                    }
                }
                "Target" => self.target(child)?,
                "UsingTask" => self.using_task(child)?,
                "Choose" => self.choose(child)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn choose(&mut self, choose: NodeId) -> Result<(), EvaluationError> {
        let branches: Vec<NodeId> = self.tree.child_elements(choose).collect();
        for branch in branches {
            if matches!(self.tree.node(branch).name(), Some("When" | "Otherwise")) {
                self.project_body(branch)?;
            }
        }
        Ok(())
    }

    fn property_group(&mut self, group: NodeId) {
        let properties: Vec<NodeId> = self.tree.child_elements(group).collect();
        for property in properties {
            let name = self.tree.node(property).name().unwrap_or_default().to_string();
            let raw = self.inner_text(property);
            let value = match self.global(&name) {
                Some(global) => global.to_string(),
                None => self.expand(&raw),
            };
            let key = name.to_ascii_lowercase();
            self.properties.insert(key.clone(), value.clone());
            // A redefinition adds a site to the existing property; the last value wins.
            if let Some(&index) = self.property_objects.get(&key) {
                let object = &mut self.graph.objects[index];
                object.spans.push(SourceSpan::at(start_of(self.tree, property)));
                object.value = Some(value);
                continue;
            }
            self.property_objects.insert(key, self.graph.objects.len());
            let object = self.object(ObjectKind::Property, &name, property).with_value(value);
            self.graph.push(object);
        }
    }

    fn item_group(&mut self, group: NodeId) {
        let items: Vec<NodeId> = self.tree.child_elements(group).collect();
        for item in items {
            let item_type = self.tree.node(item).name().unwrap_or_default().to_string();
            let spec = ["Include", "Update", "Remove"]
                .iter()
                .find_map(|attr| self.tree.attribute(item, attr))
                .map(|attr| self.expand(&attr.value));
            let mut object = self.object(ObjectKind::Item, &item_type, item);
            object.value = spec;
            self.graph.push(object);

            let attributes: Vec<NodeId> = self.tree.attributes(item).collect();
            for attribute in attributes {
                let Some(parts) = self.tree.node(attribute).as_attribute() else {
                    continue;
                };
                if RESERVED_ITEM_ATTRIBUTES.contains(&parts.name.as_str()) {
                    continue;
                }
                let value = self.expand(&parts.value);
                let object = self
                    .object(ObjectKind::ItemMetadata, &parts.name, attribute)
                    .with_value(value);
                self.graph.push(object);
            }

            let metadata: Vec<NodeId> = self.tree.child_elements(item).collect();
            for entry in metadata {
                let name = self.tree.node(entry).name().unwrap_or_default().to_string();
                let value = self.expand(&self.inner_text(entry));
                let object = self.object(ObjectKind::ItemMetadata, &name, entry).with_value(value);
                self.graph.push(object);
            }
        }
    }

    fn import(&mut self, import: NodeId) -> Result<(), EvaluationError> {
        let project = self.required_attribute(import, "Project")?;
        let object = self
            .object(ObjectKind::Import, &project, import)
            .with_value(self.expand(&project));
        self.graph.push(object);
        Ok(())
    }

    fn target(&mut self, target: NodeId) -> Result<(), EvaluationError> {
        let name = self.required_attribute(target, "Name")?;
        if !self.targets.insert(name.to_ascii_lowercase()) {
            log::debug!("Target '{}' in {} overrides an earlier definition", name, self.file.display());
        }
        let object = self.object(ObjectKind::Target, &name, target);
        self.graph.push(object);

        let children: Vec<NodeId> = self.tree.child_elements(target).collect();
        for child in children {
            match self.tree.node(child).name().unwrap_or_default() {
                "PropertyGroup" => self.property_group(child),
                "ItemGroup" => self.item_group(child),
                "OnError" => {}
                task => {
                    let task = task.to_string();
                    let object = self.object(ObjectKind::Task, &task, child);
                    self.graph.push(object);
                }
            }
        }
        Ok(())
    }

    fn using_task(&mut self, using_task: NodeId) -> Result<(), EvaluationError> {
        let name = self.required_attribute(using_task, "TaskName")?;
        let assembly = ["AssemblyFile", "AssemblyName"]
            .iter()
            .find_map(|attr| self.tree.attribute(using_task, attr))
            .map(|attr| self.expand(&attr.value));
        let mut object = self.object(ObjectKind::UsingTask, &name, using_task);
        object.value = assembly;
        self.graph.push(object);
        Ok(())
    }

    /// Concatenated text and CDATA directly inside `element`, trimmed.
    fn inner_text(&self, element: NodeId) -> String {
        let mut text = String::new();
        for child in self.tree.children(element) {
            let node = self.tree.node(child);
            if matches!(node.kind, SyntaxKind::Text | SyntaxKind::CData | SyntaxKind::Whitespace) {
                text.push_str(node.text().unwrap_or_default());
            }
        }
        text.trim().to_string()
    }

    fn global(&self, name: &str) -> Option<&str> {
        self.globals
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Expand `$(Name)` references. Unknown properties expand to nothing;
    /// property functions (`$([...])`) are left as written.
    fn expand(&self, raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find(')') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let name = &after[..end];
            let simple = !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if simple {
                let value = self
                    .global(name)
                    .or_else(|| self.properties.get(&name.to_ascii_lowercase()).map(String::as_str))
                    .unwrap_or_default();
                out.push_str(value);
            } else {
                out.push_str(&rest[start..start + 2 + end + 1]);
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }
}
