//
// workspace.rs
//
// Open documents and the collaborators they share
//

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::document::{
    DocumentError, DocumentServices, DocumentStatus, ProjectDocument, TextChange, UpdateOutcome,
};
use crate::metadata_cache::{CacheError, MetadataCache};
use crate::package_sources::PackageSourceProvider;
use crate::semantic::{EvaluatedObject, Evaluator, ObjectKind};
use crate::task_assembly::TaskAssemblyMetadata;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("document path must be absolute: {}", .0.display())]
    RelativePath(PathBuf),
    #[error("{} is not open", .0.display())]
    NotOpen(PathBuf),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Every open build file of one workspace.
///
/// Documents are independent: each has its own lock, and the map lock is
/// held only to look documents up or insert and remove them.
pub struct Workspace {
    services: DocumentServices,
    documents: RwLock<IndexMap<PathBuf, Arc<ProjectDocument>>>,
    task_metadata: Arc<MetadataCache<TaskAssemblyMetadata>>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.services.workspace_root)
            .field("task_metadata", &self.task_metadata)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    pub fn new(
        config: Config,
        workspace_root: Option<PathBuf>,
        evaluator: Arc<dyn Evaluator>,
        package_sources: Arc<dyn PackageSourceProvider>,
        task_metadata: Arc<MetadataCache<TaskAssemblyMetadata>>,
    ) -> Self {
        Self {
            services: DocumentServices {
                evaluator,
                package_sources,
                config: Arc::new(config),
                workspace_root,
            },
            documents: RwLock::new(IndexMap::new()),
            task_metadata,
        }
    }

    pub fn config(&self) -> &Config {
        &self.services.config
    }

    pub fn root(&self) -> Option<&Path> {
        self.services.workspace_root.as_deref()
    }

    pub fn task_metadata(&self) -> &Arc<MetadataCache<TaskAssemblyMetadata>> {
        &self.task_metadata
    }

    /// Open `path` from disk, or reload it if already open.
    pub async fn open(&self, path: &Path) -> Result<Arc<ProjectDocument>, WorkspaceError> {
        let (document, created) = self.register(path).await?;
        if let Err(err) = document.load().await {
            self.forget_failed(&document, created).await;
            return Err(err.into());
        }
        Ok(document)
    }

    /// Open `path` with the editor's buffer instead of the file contents.
    pub async fn open_text(&self, path: &Path, text: &str) -> Result<Arc<ProjectDocument>, WorkspaceError> {
        let (document, created) = self.register(path).await?;
        if let Err(err) = document.update(text).await {
            self.forget_failed(&document, created).await;
            return Err(err.into());
        }
        Ok(document)
    }

    pub async fn update(&self, path: &Path, text: &str) -> Result<UpdateOutcome, WorkspaceError> {
        let document = self.require(path).await?;
        Ok(document.update(text).await?)
    }

    pub async fn apply_changes(
        &self,
        path: &Path,
        changes: &[TextChange],
    ) -> Result<UpdateOutcome, WorkspaceError> {
        let document = self.require(path).await?;
        Ok(document.apply_changes(changes).await?)
    }

    /// Unload and forget `path`. Returns whether it was open.
    pub async fn close(&self, path: &Path) -> bool {
        let removed = self.documents.write().await.shift_remove(path);
        match removed {
            Some(document) => {
                document.unload().await;
                log::debug!("Closed {}", path.display());
                true
            }
            None => false,
        }
    }

    pub async fn document(&self, path: &Path) -> Option<Arc<ProjectDocument>> {
        self.documents.read().await.get(path).cloned()
    }

    /// Open paths, in the order they were first opened.
    pub async fn open_paths(&self) -> Vec<PathBuf> {
        self.documents.read().await.keys().cloned().collect()
    }

    /// Objects of `kind` across every document with current evaluated
    /// objects, paired with the document that evaluated them.
    pub async fn objects_of_kind(&self, kind: ObjectKind) -> Vec<(PathBuf, EvaluatedObject)> {
        let mut found = Vec::new();
        for document in self.snapshot().await {
            let reader = document.read().await;
            let Ok(semantic) = reader.semantic() else {
                log::trace!("Skipping {}: no current evaluation", document.path().display());
                continue;
            };
            found.extend(
                semantic
                    .objects_of_kind(kind)
                    .map(|(_, object)| (document.path().to_path_buf(), object.clone())),
            );
        }
        found
    }

    /// Assembly files named by `UsingTask` registrations, resolved against
    /// the directory of the file declaring them. Strong names (no `.dll`)
    /// and values still holding an unexpanded property are skipped.
    pub async fn task_assemblies(&self) -> Vec<PathBuf> {
        let mut assemblies = IndexSet::new();
        for (_, task) in self.objects_of_kind(ObjectKind::UsingTask).await {
            let Some(assembly) = task.value.as_deref().filter(|v| !v.trim().is_empty()) else {
                continue;
            };
            if !assembly.to_ascii_lowercase().ends_with(".dll") {
                continue;
            }
            if assembly.contains("$(") {
                log::trace!("Skipping unexpanded task assembly '{}'", assembly);
                continue;
            }
            let assembly = Path::new(assembly.trim());
            let resolved = if assembly.is_absolute() {
                assembly.to_path_buf()
            } else {
                task.file
                    .parent()
                    .map(|dir| dir.join(assembly))
                    .unwrap_or_else(|| assembly.to_path_buf())
            };
            assemblies.insert(resolved);
        }
        assemblies.into_iter().collect()
    }

    pub async fn task_assembly_metadata(&self, assembly: &Path) -> Result<TaskAssemblyMetadata, CacheError> {
        self.task_metadata.get(assembly).await
    }

    /// Replace the metadata cache with the persisted snapshot.
    pub async fn restore_metadata_cache(&self) -> Result<usize, CacheError> {
        let path = self.services.config.resolved_metadata_cache_path();
        self.task_metadata.load(&path).await
    }

    /// Write the metadata cache if it changed. Returns whether it was written.
    pub async fn persist_metadata_cache(&self) -> Result<bool, CacheError> {
        let path = self.services.config.resolved_metadata_cache_path();
        self.task_metadata.save(&path).await
    }

    /// The registered document for `path`, created and registered under one
    /// write lock so concurrent opens share a single instance. The flag is
    /// true when this call created it.
    async fn register(&self, path: &Path) -> Result<(Arc<ProjectDocument>, bool), WorkspaceError> {
        if !path.is_absolute() {
            return Err(WorkspaceError::RelativePath(path.to_path_buf()));
        }
        let mut documents = self.documents.write().await;
        if let Some(existing) = documents.get(path) {
            return Ok((Arc::clone(existing), false));
        }
        let document = Arc::new(ProjectDocument::new(path, self.services.clone()));
        documents.insert(path.to_path_buf(), Arc::clone(&document));
        log::debug!("Registered {}", path.display());
        Ok((document, true))
    }

    /// Drop a document whose first load failed, unless it was replaced or
    /// has loaded through another caller since.
    async fn forget_failed(&self, document: &Arc<ProjectDocument>, created: bool) {
        if !created || document.read().await.status() != DocumentStatus::Empty {
            return;
        }
        let mut documents = self.documents.write().await;
        if documents
            .get(document.path())
            .is_some_and(|registered| Arc::ptr_eq(registered, document))
        {
            documents.shift_remove(document.path());
        }
    }

    async fn require(&self, path: &Path) -> Result<Arc<ProjectDocument>, WorkspaceError> {
        self.document(path)
            .await
            .ok_or_else(|| WorkspaceError::NotOpen(path.to_path_buf()))
    }

    async fn snapshot(&self) -> Vec<Arc<ProjectDocument>> {
        self.documents.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_cache::MetadataScanner;
    use crate::package_sources::NuGetConfigSources;
    use crate::semantic::StaticEvaluator;
    use crate::task_assembly::TaskMetadata;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FixedScanner;

    #[async_trait]
    impl MetadataScanner<TaskAssemblyMetadata> for FixedScanner {
        async fn scan(&self, path: &Path) -> anyhow::Result<TaskAssemblyMetadata> {
            let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            Ok(TaskAssemblyMetadata {
                tasks: vec![TaskMetadata {
                    name: format!("{name}Task"),
                    type_name: format!("{name}.Tasks.{name}Task"),
                    parameters: Vec::new(),
                }],
            })
        }
    }

    fn workspace(dir: &TempDir) -> Workspace {
        let config = Config {
            metadata_cache_path: Some(dir.path().join("cache").join("tasks.json")),
            ..Config::default()
        };
        Workspace::new(
            config,
            Some(dir.path().to_path_buf()),
            Arc::new(StaticEvaluator::new()),
            Arc::new(NuGetConfigSources::new(Vec::new())),
            Arc::new(MetadataCache::new(Arc::new(FixedScanner))),
        )
    }

    #[tokio::test]
    async fn test_open_update_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.csproj");
        std::fs::write(&path, r#"<Project><Target Name="Build"/></Project>"#).unwrap();
        let ws = workspace(&dir);

        ws.open(&path).await.unwrap();
        assert_eq!(ws.open_paths().await, vec![path.clone()]);
        let targets = ws.objects_of_kind(ObjectKind::Target).await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].1.name, "Build");

        ws.update(&path, r#"<Project><Target Name="Build"/><Target Name="Test"/></Project>"#)
            .await
            .unwrap();
        assert_eq!(ws.objects_of_kind(ObjectKind::Target).await.len(), 2);

        assert!(ws.close(&path).await);
        assert!(!ws.close(&path).await);
        assert!(ws.open_paths().await.is_empty());
        assert!(matches!(
            ws.update(&path, "<Project/>").await,
            Err(WorkspaceError::NotOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_documents_are_skipped() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        let a = dir.path().join("a.proj");
        let b = dir.path().join("b.proj");
        ws.open_text(&a, r#"<Project><Import Project="x.props"/></Project>"#).await.unwrap();
        ws.open_text(&b, r#"<Project><Import Project="y.props"/></Project>"#).await.unwrap();
        ws.update(&b, "<Project><Import/></Project>").await.unwrap();

        let imports = ws.objects_of_kind(ObjectKind::Import).await;
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].0, a);
    }

    #[tokio::test]
    async fn test_concurrent_opens_share_one_document() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        let path = dir.path().join("app.csproj");
        let (a, b) = tokio::join!(
            ws.open_text(&path, r#"<Project><Target Name="A"/></Project>"#),
            ws.open_text(&path, r#"<Project><Target Name="B"/></Project>"#),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &ws.document(&path).await.unwrap()));
        assert_eq!(ws.open_paths().await, vec![path.clone()]);
        assert_eq!(ws.objects_of_kind(ObjectKind::Target).await.len(), 1);

        assert!(ws.close(&path).await);
        assert_eq!(a.read().await.status(), DocumentStatus::Empty);
    }

    #[tokio::test]
    async fn test_failed_open_is_not_registered() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        let missing = dir.path().join("missing.csproj");
        assert!(matches!(
            ws.open(&missing).await,
            Err(WorkspaceError::Document(DocumentError::Io { .. }))
        ));
        assert!(ws.open_paths().await.is_empty());
        assert!(ws.document(&missing).await.is_none());
    }

    #[tokio::test]
    async fn test_relative_paths_are_rejected() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        assert!(matches!(
            ws.open_text(Path::new("rel.proj"), "<Project/>").await,
            Err(WorkspaceError::RelativePath(_))
        ));
    }

    #[tokio::test]
    async fn test_task_assemblies_and_metadata() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        let project = dir.path().join("build").join("tasks.targets");
        let text = r#"<Project>
  <UsingTask TaskName="Zip" AssemblyFile="bin/Zip.dll" />
  <UsingTask TaskName="Zip2" AssemblyFile="bin/Zip.dll" />
  <UsingTask TaskName="Other" AssemblyFile="$(Tools.Dir)/Other.dll" />
  <UsingTask TaskName="Inline" AssemblyName="Microsoft.Build.Tasks.Core" />
</Project>"#;
        ws.open_text(&project, text).await.unwrap();

        let assemblies = ws.task_assemblies().await;
        assert_eq!(
            assemblies,
            vec![dir.path().join("build").join("bin/Zip.dll")]
        );

        let dll = dir.path().join("Zip.dll");
        std::fs::write(&dll, b"MZ").unwrap();
        let metadata = ws.task_assembly_metadata(&dll).await.unwrap();
        assert!(metadata.task("ZipTask").is_some());

        assert!(ws.persist_metadata_cache().await.unwrap());
        assert!(!ws.persist_metadata_cache().await.unwrap());
        ws.task_metadata().flush();
        assert_eq!(ws.restore_metadata_cache().await.unwrap(), 1);
    }
}
