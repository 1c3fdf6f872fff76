//! Deterministic fixture project generator for benchmarks and tests.
//!
//! Generates synthetic MSBuild projects with controlled shape: property
//! groups, item groups with metadata, imports, and targets with tasks.
//! Output depends only on the configuration, so benchmarks are reproducible.

use std::fmt::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Name of the generated project file.
pub const PROJECT_FILE: &str = "Fixture.csproj";

#[derive(Debug, Clone)]
pub struct FixtureConfig {
    pub property_groups: usize,
    pub properties_per_group: usize,
    pub item_groups: usize,
    pub items_per_group: usize,
    pub metadata_per_item: usize,
    pub imports: usize,
    pub targets: usize,
    pub tasks_per_target: usize,
}

const ITEM_TYPES: &[&str] = &["Compile", "None", "Content", "EmbeddedResource", "PackageReference"];
const TASKS: &[&str] = &["Message", "Copy", "Exec", "MakeDir", "Delete", "Touch"];

impl FixtureConfig {
    /// About 100 lines.
    pub fn small() -> Self {
        Self {
            property_groups: 2,
            properties_per_group: 10,
            item_groups: 2,
            items_per_group: 10,
            metadata_per_item: 1,
            imports: 2,
            targets: 3,
            tasks_per_target: 3,
        }
    }

    /// About 2 000 lines.
    pub fn medium() -> Self {
        Self {
            property_groups: 10,
            properties_per_group: 40,
            item_groups: 10,
            items_per_group: 40,
            metadata_per_item: 2,
            imports: 10,
            targets: 30,
            tasks_per_target: 5,
        }
    }

    /// About 20 000 lines.
    pub fn large() -> Self {
        Self {
            property_groups: 50,
            properties_per_group: 100,
            item_groups: 50,
            items_per_group: 100,
            metadata_per_item: 2,
            imports: 40,
            targets: 200,
            tasks_per_target: 8,
        }
    }

    /// Number of evaluated objects the static evaluator reports for the
    /// generated text.
    pub fn object_count(&self) -> usize {
        self.property_groups * self.properties_per_group
            + self.item_groups * self.items_per_group * (1 + self.metadata_per_item)
            + self.imports
            + self.targets * (1 + self.tasks_per_target)
    }
}

/// Generate the project text for `config`.
pub fn generate_project(config: &FixtureConfig) -> String {
    let mut out = String::new();
    writeln!(out, "<Project Sdk=\"Microsoft.NET.Sdk\">").unwrap();

    for group in 0..config.property_groups {
        writeln!(out, "  <PropertyGroup Condition=\" '$(Configuration)' == 'Debug' \">").unwrap();
        for property in 0..config.properties_per_group {
            writeln!(out, "    <Prop_{group}_{property}>value {property}</Prop_{group}_{property}>")
                .unwrap();
        }
        writeln!(out, "  </PropertyGroup>").unwrap();
    }

    for import in 0..config.imports {
        writeln!(out, "  <Import Project=\"props/shared_{import}.props\" />").unwrap();
    }

    for group in 0..config.item_groups {
        writeln!(out, "  <ItemGroup>").unwrap();
        for item in 0..config.items_per_group {
            let item_type = ITEM_TYPES[(group + item) % ITEM_TYPES.len()];
            writeln!(out, "    <{item_type} Include=\"src/g{group}/f{item}.cs\">").unwrap();
            for metadata in 0..config.metadata_per_item {
                writeln!(out, "      <Meta{metadata}>m{item}</Meta{metadata}>").unwrap();
            }
            writeln!(out, "    </{item_type}>").unwrap();
        }
        writeln!(out, "  </ItemGroup>").unwrap();
    }

    for target in 0..config.targets {
        let depends = if target > 0 {
            format!(" DependsOnTargets=\"Target_{}\"", target - 1)
        } else {
            String::new()
        };
        writeln!(out, "  <Target Name=\"Target_{target}\"{depends}>").unwrap();
        for task in 0..config.tasks_per_target {
            let name = TASKS[(target + task) % TASKS.len()];
            writeln!(out, "    <{name} Condition=\"'$(Prop_0_0)' != ''\" />").unwrap();
        }
        writeln!(out, "  </Target>").unwrap();
    }

    writeln!(out, "</Project>").unwrap();
    out
}

/// Write the generated project into a fresh temporary directory and return
/// the directory with the project path. Cleaned up when the `TempDir` drops.
pub fn create_fixture_project(config: &FixtureConfig) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory for fixture project");
    let path = write_fixture_project(temp_dir.path(), config);
    (temp_dir, path)
}

pub fn write_fixture_project(dir: &Path, config: &FixtureConfig) -> PathBuf {
    let path = dir.join(PROJECT_FILE);
    std::fs::write(&path, generate_project(config))
        .unwrap_or_else(|e| panic!("Failed to write fixture project {}: {}", path.display(), e));
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::StaticEvaluator;
    use crate::syntax::parse;

    #[test]
    fn test_generated_project_is_well_formed() {
        let tree = parse(&generate_project(&FixtureConfig::small()));
        assert!(!tree.has_errors(), "{:?}", tree.errors());
    }

    #[test]
    fn test_object_count_matches_evaluation() {
        for config in [FixtureConfig::small(), FixtureConfig::medium()] {
            let text = generate_project(&config);
            let graph = StaticEvaluator::new()
                .evaluate_text(&text, Path::new("/f/Fixture.csproj"), &Default::default())
                .unwrap();
            assert_eq!(graph.objects.len(), config.object_count());
        }
    }

    #[test]
    fn test_deterministic_output() {
        let config = FixtureConfig::small();
        assert_eq!(generate_project(&config), generate_project(&config));
        let (dir, path) = create_fixture_project(&config);
        assert_eq!(path, dir.path().join(PROJECT_FILE));
        assert_eq!(std::fs::read_to_string(path).unwrap(), generate_project(&config));
    }
}
