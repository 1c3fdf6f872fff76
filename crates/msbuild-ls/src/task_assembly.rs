//
// task_assembly.rs
//
// Task metadata scanned from UsingTask assemblies
//

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskParameter {
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub output: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    /// Name as used in project files.
    pub name: String,
    /// Fully-qualified implementing type.
    pub type_name: String,
    #[serde(default)]
    pub parameters: Vec<TaskParameter>,
}

impl TaskMetadata {
    pub fn parameter(&self, name: &str) -> Option<&TaskParameter> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &TaskParameter> {
        self.parameters.iter().filter(|p| p.required)
    }
}

/// Everything a scanner learned about one task assembly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssemblyMetadata {
    #[serde(default)]
    pub tasks: Vec<TaskMetadata>,
}

impl TaskAssemblyMetadata {
    /// Look up a task by its short name or fully-qualified type name.
    pub fn task(&self, name: &str) -> Option<&TaskMetadata> {
        self.tasks.iter().find(|task| {
            task.name.eq_ignore_ascii_case(name) || task.type_name.eq_ignore_ascii_case(name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let metadata = TaskAssemblyMetadata {
            tasks: vec![TaskMetadata {
                name: "Zip".into(),
                type_name: "Acme.Build.Zip".into(),
                parameters: vec![
                    TaskParameter {
                        name: "Files".into(),
                        type_name: "Microsoft.Build.Framework.ITaskItem[]".into(),
                        required: true,
                        output: false,
                    },
                    TaskParameter {
                        name: "Archive".into(),
                        type_name: "System.String".into(),
                        required: false,
                        output: true,
                    },
                ],
            }],
        };
        let zip = metadata.task("zip").unwrap();
        assert!(metadata.task("acme.build.zip").is_some());
        assert!(zip.parameter("ARCHIVE").unwrap().output);
        assert_eq!(zip.required_parameters().count(), 1);
    }

    #[test]
    fn test_wire_shape() {
        let json = r#"{"tasks":[{"name":"Zip","typeName":"Acme.Zip","parameters":[{"name":"Files","typeName":"System.String","required":true}],"extra":1}]}"#;
        let metadata: TaskAssemblyMetadata = serde_json::from_str(json).unwrap();
        let files = &metadata.tasks[0].parameters[0];
        assert!(files.required);
        assert!(!files.output);
    }
}
