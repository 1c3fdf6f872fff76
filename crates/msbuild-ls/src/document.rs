//
// document.rs
//
// Lifecycle of one build file: text, syntax layer, semantic layer, diagnostics
//

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ropey::Rope;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::diagnostics::{self, Diagnostic};
use crate::offset_index::{OffsetIndex, PositionError, TextPosition};
use crate::package_sources::{PackageSource, PackageSourceProvider};
use crate::position::{Position, Range};
use crate::semantic::{
    EvaluatedGraph, EvaluatedObject, EvaluatedObjectLocator, EvaluationError, Evaluator,
    LocatorError, WorkspaceContext,
};
use crate::syntax::{self, SyntaxLocation, SyntaxLocator, SyntaxTree};

/// Role of a build file, from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Project,
    Properties,
    Targets,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("props") => DocumentKind::Properties,
            Some("targets") => DocumentKind::Targets,
            _ => DocumentKind::Project,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentStatus {
    /// Never loaded, or unloaded.
    Empty,
    /// Syntax and evaluated objects both describe the current text.
    Valid,
    /// The evaluated objects are from an earlier text.
    Cached,
    /// Syntax only; nothing has ever evaluated.
    SyntaxOnly,
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("{} is not loaded", .0.display())]
    NotLoaded(PathBuf),
    #[error("evaluated objects of {} do not match the current text ({reason})", path.display())]
    StaleSemanticModel { path: PathBuf, reason: String },
    #[error("{} has no evaluated objects", .0.display())]
    NoSemanticModel(PathBuf),
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Position(#[from] PositionError),
    #[error(transparent)]
    Locator(#[from] LocatorError),
}

/// How a load or update ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied(DocumentStatus),
    /// A newer load, update or unload overtook this one; nothing of it was kept.
    Superseded,
}

/// One edit. `range` is in line/column (either base) against the text as it
/// stands before this edit; `None` replaces the whole text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub range: Option<Range>,
    pub text: String,
}

impl TextChange {
    pub fn replace(range: Range, text: impl Into<String>) -> Self {
        Self {
            range: Some(range),
            text: text.into(),
        }
    }

    pub fn full(text: impl Into<String>) -> Self {
        Self {
            range: None,
            text: text.into(),
        }
    }
}

/// Collaborators shared by every document of a workspace.
#[derive(Clone)]
pub struct DocumentServices {
    pub evaluator: Arc<dyn Evaluator>,
    pub package_sources: Arc<dyn PackageSourceProvider>,
    pub config: Arc<Config>,
    pub workspace_root: Option<PathBuf>,
}

struct SyntaxLayer {
    index: Arc<OffsetIndex>,
    tree: Arc<SyntaxTree>,
    locator: SyntaxLocator,
}

impl SyntaxLayer {
    fn build(text: &str) -> Self {
        let index = OffsetIndex::shared(text);
        let tree = Arc::new(syntax::parse_with_index(text, Arc::clone(&index)));
        let locator = SyntaxLocator::new(Arc::clone(&tree));
        Self {
            index,
            tree,
            locator,
        }
    }
}

#[derive(Default)]
struct DocumentState {
    text: Rope,
    syntax: Option<SyntaxLayer>,
    semantic: Option<Arc<EvaluatedObjectLocator>>,
    /// Set while `semantic` describes an older text.
    stale_reason: Option<String>,
    dirty: bool,
    diagnostics: Vec<Diagnostic>,
    package_sources: Vec<PackageSource>,
    /// Generation whose text is currently held.
    generation: u64,
}

impl DocumentState {
    fn status(&self) -> DocumentStatus {
        match (&self.syntax, &self.semantic, &self.stale_reason) {
            (None, _, _) => DocumentStatus::Empty,
            (Some(_), None, _) => DocumentStatus::SyntaxOnly,
            (Some(_), Some(_), Some(_)) => DocumentStatus::Cached,
            (Some(_), Some(_), None) => DocumentStatus::Valid,
        }
    }
}

/// A single project, props or targets file.
///
/// Writers (`load`, `update`, `apply_changes`, `unload`) take the document's
/// lock exclusively only to swap state; parsing, package-source discovery and
/// evaluation run without it. Every run gets a generation number, and a run's
/// results are applied only while its generation is still the newest.
pub struct ProjectDocument {
    path: PathBuf,
    kind: DocumentKind,
    services: DocumentServices,
    next_generation: AtomicU64,
    in_flight: Mutex<CancellationToken>,
    state: RwLock<DocumentState>,
}

impl std::fmt::Debug for ProjectDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectDocument")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("generation", &self.next_generation.load(Ordering::SeqCst))
            .finish()
    }
}

impl ProjectDocument {
    pub fn new(path: impl Into<PathBuf>, services: DocumentServices) -> Self {
        let path = path.into();
        Self {
            kind: DocumentKind::from_path(&path),
            path,
            services,
            next_generation: AtomicU64::new(0),
            in_flight: Mutex::new(CancellationToken::new()),
            state: RwLock::new(DocumentState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    /// Shared access for queries. Writers wait for outstanding readers, and
    /// new readers queue behind a waiting writer.
    pub async fn read(&self) -> DocumentReader<'_> {
        DocumentReader {
            path: &self.path,
            state: self.state.read().await,
        }
    }

    /// Read the backing file and run the pipeline on its contents.
    pub async fn load(&self) -> Result<UpdateOutcome, DocumentError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| DocumentError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.run(Rope::from_str(&text), false).await
    }

    /// Replace the text with an editor buffer.
    pub async fn update(&self, text: &str) -> Result<UpdateOutcome, DocumentError> {
        self.run(Rope::from_str(text), true).await
    }

    /// Apply edits in order, then run the pipeline. If any edit does not
    /// resolve, nothing changes.
    ///
    /// Concurrent edits must be serialized by the caller; each batch applies
    /// to the text current when it starts.
    pub async fn apply_changes(&self, changes: &[TextChange]) -> Result<UpdateOutcome, DocumentError> {
        let (mut text, mut index) = {
            let state = self.state.read().await;
            let Some(syntax) = &state.syntax else {
                return Err(DocumentError::NotLoaded(self.path.clone()));
            };
            (state.text.clone(), Arc::clone(&syntax.index))
        };

        for (i, change) in changes.iter().enumerate() {
            match change.range {
                Some(range) => {
                    let start = index.offset_of(range.start())?;
                    let end = index.offset_of(range.end())?;
                    text.remove(start..end);
                    text.insert(start, &change.text);
                }
                None => text = Rope::from_str(&change.text),
            }
            if i + 1 < changes.len() {
                index = OffsetIndex::shared(&text.to_string());
            }
        }

        self.run(text, true).await
    }

    /// Drop all state and abandon any in-flight run.
    pub async fn unload(&self) {
        let generation = self.begin_generation().0;
        let mut state = self.state.write().await;
        *state = DocumentState {
            generation,
            ..DocumentState::default()
        };
        log::debug!("Unloaded {} (generation {})", self.path.display(), generation);
    }

    /// Allocate the next generation and cancel the one in flight.
    fn begin_generation(&self) -> (u64, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let previous = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *in_flight, token.clone())
        };
        previous.cancel();
        (generation, token)
    }

    async fn run(&self, text: Rope, dirty: bool) -> Result<UpdateOutcome, DocumentError> {
        let (generation, token) = self.begin_generation();
        let source = text.to_string();
        let layer = SyntaxLayer::build(&source);
        let config = &self.services.config;

        // Syntax: replaced unconditionally, so syntax queries see the new
        // text right away. A surviving semantic layer is now stale.
        let tree = {
            let mut state = self.state.write().await;
            if state.generation > generation {
                return Ok(self.superseded(generation));
            }
            let mut diagnostics = diagnostics::syntax_diagnostics(&layer.tree);
            diagnostics.extend(diagnostics::policy_diagnostics(&layer.tree, &config.diagnostics));
            let tree = Arc::clone(&layer.tree);
            state.text = text;
            state.syntax = Some(layer);
            state.diagnostics = diagnostics;
            state.dirty = dirty;
            state.generation = generation;
            if state.semantic.is_some() {
                state.stale_reason = Some("re-evaluation pending".to_string());
            }
            log::trace!("Applied syntax of {} generation {}", self.path.display(), generation);
            tree
        };

        let evaluation = tokio::select! {
            _ = token.cancelled() => None,
            result = self.evaluate(&source) => Some(result),
        };
        let Some((package_sources, evaluation)) = evaluation else {
            return Ok(self.superseded(generation));
        };

        let mut state = self.state.write().await;
        if state.generation != generation {
            return Ok(self.superseded(generation));
        }
        state.package_sources = package_sources;

        let graph = match evaluation {
            Ok(graph) => graph,
            Err(error) => {
                log::debug!("Evaluation of {} failed: {}", self.path.display(), error);
                let diagnostic = diagnostics::evaluation_diagnostic(&tree, &error);
                state.diagnostics.push(diagnostic);
                if state.semantic.is_some() {
                    state.stale_reason = Some(error.to_string());
                }
                return Ok(UpdateOutcome::Applied(state.status()));
            }
        };

        match self.index_graph(graph, &tree) {
            Ok(locator) => {
                state.semantic = Some(Arc::new(locator));
                state.stale_reason = None;
                log::debug!(
                    "{} generation {} evaluated ({} diagnostics)",
                    self.path.display(),
                    generation,
                    state.diagnostics.len()
                );
                Ok(UpdateOutcome::Applied(state.status()))
            }
            Err(error) => {
                let reported = EvaluationError::invalid(error.to_string(), None);
                state.diagnostics.push(diagnostics::evaluation_diagnostic(&tree, &reported));
                if state.semantic.is_some() {
                    state.stale_reason = Some(error.to_string());
                }
                Err(error.into())
            }
        }
    }

    /// Package sources, then evaluation, both bounded by the configured timeouts.
    async fn evaluate(
        &self,
        text: &str,
    ) -> (Vec<PackageSource>, Result<EvaluatedGraph, EvaluationError>) {
        let config = &self.services.config;
        let directory = self.path.parent().unwrap_or_else(|| Path::new("/"));
        let listing = tokio::time::timeout(
            config.package_source_timeout(),
            self.services.package_sources.list_sources(directory),
        )
        .await;
        let package_sources = match listing {
            Ok(Ok(sources)) => sources,
            Ok(Err(err)) => {
                log::warn!("Package sources for {} unavailable: {:#}", self.path.display(), err);
                Vec::new()
            }
            Err(_) => {
                log::warn!(
                    "Listing package sources for {} timed out after {:?}",
                    self.path.display(),
                    config.package_source_timeout()
                );
                Vec::new()
            }
        };

        let context = WorkspaceContext {
            workspace_root: self.services.workspace_root.clone(),
            global_properties: config.global_properties.clone(),
            package_sources: package_sources.clone(),
        };
        let timeout = config.evaluation_timeout();
        let result = tokio::time::timeout(
            timeout,
            self.services.evaluator.evaluate(text, &self.path, &context),
        )
        .await
        .unwrap_or(Err(EvaluationError::Timeout(timeout)));
        (package_sources, result)
    }

    fn index_graph(
        &self,
        graph: EvaluatedGraph,
        tree: &Arc<SyntaxTree>,
    ) -> Result<EvaluatedObjectLocator, LocatorError> {
        EvaluatedObjectLocator::new(Arc::new(graph), &[(self.path.clone(), Arc::clone(tree))])
    }

    fn superseded(&self, generation: u64) -> UpdateOutcome {
        log::debug!(
            "Discarding generation {} of {}: superseded",
            generation,
            self.path.display()
        );
        UpdateOutcome::Superseded
    }
}

/// Shared-access view of a document, released when dropped.
pub struct DocumentReader<'a> {
    path: &'a Path,
    state: RwLockReadGuard<'a, DocumentState>,
}

impl DocumentReader<'_> {
    pub fn status(&self) -> DocumentStatus {
        self.state.status()
    }

    /// Generation of the text currently held.
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    pub fn text(&self) -> String {
        self.state.text.to_string()
    }

    /// True when the text came from an editor buffer rather than disk.
    pub fn is_dirty(&self) -> bool {
        self.state.dirty
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.state.diagnostics
    }

    pub fn package_sources(&self) -> &[PackageSource] {
        &self.state.package_sources
    }

    /// Why the evaluated objects are out of date, if they are.
    pub fn stale_reason(&self) -> Option<&str> {
        self.state.stale_reason.as_deref()
    }

    fn syntax(&self) -> Result<&SyntaxLayer, DocumentError> {
        self.state
            .syntax
            .as_ref()
            .ok_or_else(|| DocumentError::NotLoaded(self.path.to_path_buf()))
    }

    pub fn index(&self) -> Result<&Arc<OffsetIndex>, DocumentError> {
        Ok(&self.syntax()?.index)
    }

    pub fn tree(&self) -> Result<&Arc<SyntaxTree>, DocumentError> {
        Ok(&self.syntax()?.tree)
    }

    /// Bind an offset to the current text.
    pub fn position_of(&self, offset: usize) -> Result<TextPosition, DocumentError> {
        Ok(self.index()?.text_position_of(offset)?)
    }

    pub fn locate(&self, position: &TextPosition) -> Result<Option<SyntaxLocation>, DocumentError> {
        Ok(self.syntax()?.locator.locate(position)?)
    }

    pub fn locate_offset(&self, offset: usize) -> Result<Option<SyntaxLocation>, DocumentError> {
        Ok(self.syntax()?.locator.locate_offset(offset)?)
    }

    pub fn locate_position(&self, position: Position) -> Result<Option<SyntaxLocation>, DocumentError> {
        Ok(self.syntax()?.locator.locate_position(position)?)
    }

    /// The evaluated-object index, refused while it describes an older text.
    pub fn semantic(&self) -> Result<&Arc<EvaluatedObjectLocator>, DocumentError> {
        self.syntax()?;
        let Some(locator) = &self.state.semantic else {
            return Err(DocumentError::NoSemanticModel(self.path.to_path_buf()));
        };
        if let Some(reason) = &self.state.stale_reason {
            return Err(DocumentError::StaleSemanticModel {
                path: self.path.to_path_buf(),
                reason: reason.clone(),
            });
        }
        Ok(locator)
    }

    /// Most recent evaluation result, current or not. Only for name and kind
    /// queries: its ranges may not match the current text.
    pub fn last_graph(&self) -> Option<&Arc<EvaluatedGraph>> {
        self.state.semantic.as_ref().map(|locator| locator.graph())
    }

    pub fn find(&self, position: &TextPosition) -> Result<Option<&EvaluatedObject>, DocumentError> {
        let locator = self.semantic()?;
        Ok(locator.find(self.path, position)?.map(|(_, object)| object))
    }

    pub fn find_offset(&self, offset: usize) -> Result<Option<&EvaluatedObject>, DocumentError> {
        let position = self.position_of(offset)?;
        self.find(&position)
    }

    /// Every evaluated object of the current generation.
    pub fn all_objects(&self) -> Result<Vec<&EvaluatedObject>, DocumentError> {
        Ok(self.semantic()?.all_objects().map(|(_, object)| object).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticCode;
    use crate::package_sources::PackageVersion;
    use crate::semantic::{ObjectKind, StaticEvaluator};
    use crate::syntax::LocationFlags;
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    struct NoSources;

    #[async_trait]
    impl PackageSourceProvider for NoSources {
        async fn list_sources(&self, _: &Path) -> anyhow::Result<Vec<PackageSource>> {
            Ok(Vec::new())
        }
        async fn suggest_names(&self, _: &str) -> anyhow::Result<BTreeSet<String>> {
            Ok(BTreeSet::new())
        }
        async fn suggest_versions(&self, _: &str) -> anyhow::Result<BTreeSet<PackageVersion>> {
            Ok(BTreeSet::new())
        }
    }

    fn document(path: &str) -> ProjectDocument {
        ProjectDocument::new(
            path,
            DocumentServices {
                evaluator: Arc::new(StaticEvaluator::new()),
                package_sources: Arc::new(NoSources),
                config: Arc::new(Config::default()),
                workspace_root: None,
            },
        )
    }

    const PROJECT: &str = "<Project><PropertyGroup><Foo>Bar</Foo></PropertyGroup></Project>";

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(DocumentKind::from_path(Path::new("a/Directory.Build.props")), DocumentKind::Properties);
        assert_eq!(DocumentKind::from_path(Path::new("a/b.TARGETS")), DocumentKind::Targets);
        assert_eq!(DocumentKind::from_path(Path::new("a/b.csproj")), DocumentKind::Project);
        assert_eq!(DocumentKind::from_path(Path::new("a/noext")), DocumentKind::Project);
    }

    #[tokio::test]
    async fn test_update_locates_and_finds() {
        let doc = document("/w/app.csproj");
        let outcome = doc.update(PROJECT).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied(DocumentStatus::Valid));

        let reader = doc.read().await;
        assert!(reader.is_dirty());
        assert!(reader.diagnostics().is_empty());
        let offset = PROJECT.find("Bar").unwrap() + 1;
        let location = reader.locate_offset(offset).unwrap().unwrap();
        assert_eq!(location.flags, LocationFlags::ELEMENT | LocationFlags::ELEMENT_CONTENT);
        let object = reader.find_offset(offset).unwrap().unwrap();
        assert_eq!((object.kind, object.name.as_str()), (ObjectKind::Property, "Foo"));
        assert_eq!(object.value.as_deref(), Some("Bar"));
    }

    #[tokio::test]
    async fn test_broken_text_keeps_stale_graph_and_refuses_find() {
        let doc = document("/w/app.csproj");
        doc.update(PROJECT).await.unwrap();
        let broken = "<Project><PropertyGroup><Foo>Bar</PropertyGroup></Project>";
        let outcome = doc.update(broken).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied(DocumentStatus::Cached));

        let reader = doc.read().await;
        assert!(matches!(
            reader.find_offset(30),
            Err(DocumentError::StaleSemanticModel { .. })
        ));
        assert!(reader.locate_offset(30).unwrap().is_some());
        assert_eq!(reader.last_graph().unwrap().objects.len(), 1);
        let codes: Vec<_> = reader.diagnostics().iter().map(|d| d.code).collect();
        assert_eq!(codes.first(), Some(&DiagnosticCode::SyntaxError));
        assert_eq!(codes.last(), Some(&DiagnosticCode::EvaluationFailed));
    }

    #[tokio::test]
    async fn test_first_failure_is_syntax_only() {
        let doc = document("/w/app.csproj");
        let outcome = doc.update("<Project><Target/></Project>").await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied(DocumentStatus::SyntaxOnly));
        let reader = doc.read().await;
        assert!(matches!(reader.find_offset(3), Err(DocumentError::NoSemanticModel(_))));
        assert!(reader.tree().is_ok());
    }

    #[tokio::test]
    async fn test_recovery_clears_staleness() {
        let doc = document("/w/app.csproj");
        doc.update(PROJECT).await.unwrap();
        doc.update("<Project><Target/></Project>").await.unwrap();
        let outcome = doc.update(PROJECT).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied(DocumentStatus::Valid));
        let reader = doc.read().await;
        assert!(reader.stale_reason().is_none());
        assert!(reader.diagnostics().is_empty());
    }

    #[tokio::test]
    async fn test_apply_changes() {
        let doc = document("/w/app.csproj");
        doc.update("<Project>\n  <PropertyGroup>\n    <A>1</A>\n  </PropertyGroup>\n</Project>")
            .await
            .unwrap();
        let changes = [
            TextChange::replace(
                Range::new(Position::zero_based(2, 7), Position::zero_based(2, 8)).unwrap(),
                "42",
            ),
            TextChange::replace(
                Range::new(Position::zero_based(2, 4), Position::zero_based(2, 4)).unwrap(),
                "<B>x</B>",
            ),
        ];
        doc.apply_changes(&changes).await.unwrap();
        let reader = doc.read().await;
        assert_eq!(
            reader.text(),
            "<Project>\n  <PropertyGroup>\n    <B>x</B><A>42</A>\n  </PropertyGroup>\n</Project>"
        );
        let names: Vec<_> = reader
            .all_objects()
            .unwrap()
            .iter()
            .map(|o| o.name.clone())
            .collect();
        assert_eq!(names, ["B", "A"]);
    }

    #[tokio::test]
    async fn test_unresolvable_change_leaves_document_untouched() {
        let doc = document("/w/app.csproj");
        doc.update(PROJECT).await.unwrap();
        let bad = [TextChange::replace(
            Range::new(Position::zero_based(5, 0), Position::zero_based(5, 1)).unwrap(),
            "x",
        )];
        assert!(matches!(
            doc.apply_changes(&bad).await,
            Err(DocumentError::Position(PositionError::LineOutOfRange { .. }))
        ));
        assert_eq!(doc.read().await.text(), PROJECT);

        let empty = document("/w/other.csproj");
        assert!(matches!(
            empty.apply_changes(&[TextChange::full("<Project/>")]).await,
            Err(DocumentError::NotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_unload_returns_to_empty() {
        let doc = document("/w/app.csproj");
        doc.update(PROJECT).await.unwrap();
        doc.unload().await;
        let reader = doc.read().await;
        assert_eq!(reader.status(), DocumentStatus::Empty);
        assert!(!reader.is_dirty());
        assert!(reader.diagnostics().is_empty());
        assert!(matches!(reader.locate_offset(0), Err(DocumentError::NotLoaded(_))));
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("Directory.Build.targets");
        std::fs::write(&path, r#"<Project><Target Name="Pack"/></Project>"#).unwrap();
        let doc = document(path.to_str().unwrap());
        assert_eq!(doc.kind(), DocumentKind::Targets);
        assert_eq!(
            doc.load().await.unwrap(),
            UpdateOutcome::Applied(DocumentStatus::Valid)
        );
        let reader = doc.read().await;
        assert!(!reader.is_dirty());
        assert_eq!(reader.all_objects().unwrap()[0].kind, ObjectKind::Target);
        drop(reader);

        let missing = document("/definitely/not/here.proj");
        assert!(matches!(missing.load().await, Err(DocumentError::Io { .. })));
    }
}
