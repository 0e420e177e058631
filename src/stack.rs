use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use crate::template::{self, Output, OutputExport, Parameter, Resource, Template};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Stack {0} is declared twice")]
    DuplicateStack(String),

    #[error("Logical id {1} is declared twice in stack {0}")]
    DuplicateLogicalId(String, String),

    #[error("Stack {0} cannot import its own export {1}")]
    SelfImport(String, String),

    #[error("Stack {0} depends on unknown stack {1}")]
    UnknownDependency(String, String),

    #[error("Dependency cycle between stacks: {0}")]
    DependencyCycle(String),

    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    #[error("Invalid placement: {0}")]
    InvalidPlacement(String),

    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),

    #[error("Secret {0} does not resolve: credential {1} has no field {2}")]
    UnresolvedSecret(String, String, String),
}

/// Target account and region. Both absent means environment-agnostic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub account: Option<String>,
    pub region: Option<String>,
}

impl Environment {
    pub fn is_agnostic(&self) -> bool {
        return self.account.is_none() && self.region.is_none();
    }

    /// Values set on `other` win.
    pub fn merge(&self, other: &Environment) -> Environment {
        return Environment {
            account: other.account.clone().or_else(|| self.account.clone()),
            region: other.region.clone().or_else(|| self.region.clone()),
        };
    }

    pub fn manifest_string(&self) -> String {
        return format!(
            "aws://{}/{}",
            self.account.as_deref().unwrap_or("unknown-account"),
            self.region.as_deref().unwrap_or("unknown-region")
        );
    }
}

/// Handle to a value published by another stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub stack_id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Stack {
    pub id: String,
    pub environment: Environment,

    template: Template,
    dependencies: BTreeSet<String>,
}

impl Stack {
    pub fn new(id: &str, environment: Environment) -> Self {
        return Self {
            id: id.to_string(),
            environment,
            template: Template::default(),
            dependencies: BTreeSet::new(),
        };
    }

    pub fn template(&self) -> &Template {
        return &self.template;
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        return &self.dependencies;
    }

    pub fn set_description(&mut self, description: &str) {
        self.template.description = Some(description.to_string());
    }

    pub fn add_transform(&mut self, transform: &str) {
        self.template.transform = Some(transform.to_string());
    }

    /// Adds `resource` under the logical id derived from `path`.
    pub fn add_resource(&mut self, path: &str, resource: Resource) -> Result<String, Error> {
        let logical_id = logical_id(path);
        if self.template.resources.contains_key(&logical_id) {
            return Err(Error::DuplicateLogicalId(self.id.clone(), logical_id));
        }

        debug!(stack = %self.id, %logical_id, resource_type = %resource.resource_type, "Declared resource");
        self.template.resources.insert(logical_id.clone(), resource);
        return Ok(logical_id);
    }

    pub fn add_parameter(&mut self, path: &str, parameter: Parameter) -> Result<String, Error> {
        let logical_id = logical_id(path);
        if self.template.parameters.contains_key(&logical_id) {
            return Err(Error::DuplicateLogicalId(self.id.clone(), logical_id));
        }

        self.template.parameters.insert(logical_id.clone(), parameter);
        return Ok(logical_id);
    }

    pub fn add_output(&mut self, path: &str, value: Value, description: &str) -> Result<String, Error> {
        return self.insert_output(
            path,
            Output {
                value,
                description: Some(description.to_string()),
                export: None,
            },
        );
    }

    /// Publishes `value` as `<StackId>:<name>` for other stacks to import.
    pub fn export(&mut self, name: &str, value: Value) -> Result<Export, Error> {
        let export = Export {
            stack_id: self.id.clone(),
            name: format!("{}:{}", self.id, name),
        };

        self.insert_output(
            &format!("Export/{}", name),
            Output {
                value,
                description: None,
                export: Some(OutputExport {
                    name: export.name.clone(),
                }),
            },
        )?;
        return Ok(export);
    }

    pub fn import(&mut self, export: &Export) -> Result<Value, Error> {
        if export.stack_id == self.id {
            return Err(Error::SelfImport(self.id.clone(), export.name.clone()));
        }

        self.dependencies.insert(export.stack_id.clone());
        return Ok(template::import_value(&export.name));
    }

    fn insert_output(&mut self, path: &str, output: Output) -> Result<String, Error> {
        let logical_id = logical_id(path);
        if self.template.outputs.contains_key(&logical_id) {
            return Err(Error::DuplicateLogicalId(self.id.clone(), logical_id));
        }

        self.template.outputs.insert(logical_id.clone(), output);
        return Ok(logical_id);
    }
}

/// `VPC/PublicSubnet1/Subnet` becomes `VPCPublicSubnet1Subnet`.
pub fn logical_id(path: &str) -> String {
    return path
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derives_logical_ids_from_paths() {
        assert_eq!("VPCPublicSubnet1Subnet", logical_id("VPC/PublicSubnet1/Subnet"));
        assert_eq!("PGDatabaseInstance2", logical_id("PG Database/Instance2"));
        assert_eq!("ExportVpcId", logical_id("Export/vpc-id"));
    }

    #[test]
    fn rejects_duplicate_logical_ids() {
        let mut stack = Stack::new("VpcStack", Environment::default());
        stack
            .add_resource("VPC", Resource::new("AWS::EC2::VPC", json!({})))
            .unwrap();

        let result = stack.add_resource("VPC", Resource::new("AWS::EC2::VPC", json!({})));
        assert_eq!(
            Err(Error::DuplicateLogicalId(
                String::from("VpcStack"),
                String::from("VPC")
            )),
            result
        );
    }

    #[test]
    fn import_records_the_dependency() {
        let mut producer = Stack::new("VpcStack", Environment::default());
        let export = producer.export("VpcId", json!({ "Ref": "VPC" })).unwrap();
        assert_eq!("VpcStack:VpcId", export.name);
        assert_eq!(
            Some(&String::from("VpcStack:VpcId")),
            producer.template().outputs["ExportVpcId"]
                .export
                .as_ref()
                .map(|export| &export.name)
        );

        let mut consumer = Stack::new("RdsStack", Environment::default());
        let value = consumer.import(&export).unwrap();
        assert_eq!(json!({ "Fn::ImportValue": "VpcStack:VpcId" }), value);
        assert_eq!(true, consumer.dependencies().contains("VpcStack"));

        assert_eq!(true, producer.import(&export).is_err());
    }

    #[test]
    fn environment_merge_prefers_overrides() {
        let file = Environment {
            account: Some(String::from("123456789012")),
            region: Some(String::from("us-east-1")),
        };
        let cli = Environment {
            account: None,
            region: Some(String::from("ap-southeast-2")),
        };

        let merged = file.merge(&cli);
        assert_eq!("aws://123456789012/ap-southeast-2", merged.manifest_string());
        assert_eq!(
            "aws://unknown-account/unknown-region",
            Environment::default().manifest_string()
        );
    }
}
