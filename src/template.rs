//! CloudFormation template model, intrinsic functions and template queries.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionPolicy {
    Delete,
    Retain,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub properties: Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<DeletionPolicy>,
}

impl Resource {
    pub fn new(resource_type: &str, properties: Value) -> Self {
        return Self {
            resource_type: resource_type.to_string(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
            update_replace_policy: None,
        };
    }

    pub fn depends_on(mut self, logical_id: &str) -> Self {
        self.depends_on.push(logical_id.to_string());
        return self;
    }

    /// Sets both the deletion and the update-replace policy.
    pub fn removal_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = Some(policy);
        self.update_replace_policy = Some(policy);
        return self;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    #[serde(rename = "Type")]
    pub parameter_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutputExport {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<OutputExport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Parameter>,

    #[serde(default)]
    pub resources: BTreeMap<String, Resource>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

impl Template {
    pub fn resource_count(&self, resource_type: &str) -> usize {
        return self
            .resources
            .values()
            .filter(|resource| resource.resource_type == resource_type)
            .count();
    }

    /// Resources of `resource_type` whose properties contain `properties`.
    pub fn find_resources(
        &self,
        resource_type: &str,
        properties: &Value,
    ) -> Vec<(&String, &Resource)> {
        return self
            .resources
            .iter()
            .filter(|(_, resource)| resource.resource_type == resource_type)
            .filter(|(_, resource)| is_subset(properties, &resource.properties))
            .collect();
    }

    pub fn has_resource_properties(&self, resource_type: &str, properties: &Value) -> bool {
        return !self.find_resources(resource_type, properties).is_empty();
    }

    /// Resource count per type, used for the synthesis summary.
    pub fn resource_summary(&self) -> BTreeMap<&str, usize> {
        let init: BTreeMap<&str, usize> = BTreeMap::new();
        return self.resources.values().fold(init, |mut acc, resource| {
            *acc.entry(resource.resource_type.as_str()).or_insert(0) += 1;
            return acc;
        });
    }
}

/// Objects match when every expected key matches; arrays match element-wise.
pub fn is_subset(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(expected), Value::Object(actual)) => expected.iter().all(|(key, value)| {
            actual
                .get(key)
                .map_or(false, |actual_value| is_subset(value, actual_value))
        }),
        (Value::Array(expected), Value::Array(actual)) => {
            expected.len() == actual.len()
                && expected
                    .iter()
                    .zip(actual.iter())
                    .all(|(expected, actual)| is_subset(expected, actual))
        }
        _ => expected == actual,
    }
}

pub fn reference(logical_id: &str) -> Value {
    return json!({ "Ref": logical_id });
}

pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    return json!({ "Fn::GetAtt": [logical_id, attribute] });
}

pub fn import_value(export_name: &str) -> Value {
    return json!({ "Fn::ImportValue": export_name });
}

pub fn sub(template: &str) -> Value {
    return json!({ "Fn::Sub": template });
}

pub fn sub_with(template: &str, variables: Map<String, Value>) -> Value {
    return json!({ "Fn::Sub": [template, Value::Object(variables)] });
}

pub fn join(delimiter: &str, parts: Vec<Value>) -> Value {
    return json!({ "Fn::Join": [delimiter, parts] });
}

pub fn base64(value: Value) -> Value {
    return json!({ "Fn::Base64": value });
}

/// The `index`-th availability zone of the deployment region.
pub fn availability_zone(index: usize) -> Value {
    return json!({ "Fn::Select": [index, { "Fn::GetAZs": "" }] });
}

pub fn tags(pairs: &[(&str, Value)]) -> Value {
    return Value::Array(
        pairs
            .iter()
            .map(|(key, value)| json!({ "Key": key, "Value": value }))
            .collect(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Template {
        let mut template = Template::default();
        template.resources.insert(
            String::from("Listener"),
            Resource::new(
                "AWS::ElasticLoadBalancingV2::Listener",
                json!({ "Port": 3000, "Protocol": "HTTP", "DefaultActions": [{ "Type": "forward" }] }),
            ),
        );
        template.resources.insert(
            String::from("Key"),
            Resource::new("AWS::KMS::Key", json!({ "EnableKeyRotation": true }))
                .removal_policy(DeletionPolicy::Retain),
        );
        return template;
    }

    #[test]
    fn counts_resources_by_type() {
        let template = template();
        assert_eq!(1, template.resource_count("AWS::KMS::Key"));
        assert_eq!(0, template.resource_count("AWS::S3::Bucket"));
    }

    #[test]
    fn matches_nested_property_subsets() {
        let template = template();
        assert_eq!(
            true,
            template.has_resource_properties(
                "AWS::ElasticLoadBalancingV2::Listener",
                &json!({ "Port": 3000, "DefaultActions": [{ "Type": "forward" }] })
            )
        );
        assert_eq!(
            false,
            template.has_resource_properties(
                "AWS::ElasticLoadBalancingV2::Listener",
                &json!({ "Port": 80 })
            )
        );
        assert_eq!(
            false,
            template.has_resource_properties(
                "AWS::ElasticLoadBalancingV2::Listener",
                &json!({ "DefaultActions": [] })
            )
        );
    }

    #[test]
    fn serializes_in_cloudformation_shape() {
        let value = serde_json::to_value(template()).unwrap();
        assert_eq!(
            json!("Retain"),
            value["Resources"]["Key"]["DeletionPolicy"]
        );
        assert_eq!(
            json!("AWS::KMS::Key"),
            value["Resources"]["Key"]["Type"]
        );
        assert_eq!(true, value.get("Outputs").is_none());
        assert_eq!(true, value["Resources"]["Listener"].get("DependsOn").is_none());
    }

    #[test]
    fn builds_intrinsics() {
        assert_eq!(json!({ "Ref": "VPC" }), reference("VPC"));
        assert_eq!(
            json!({ "Fn::Select": [1, { "Fn::GetAZs": "" }] }),
            availability_zone(1)
        );
        assert_eq!(
            json!({ "Fn::GetAtt": ["Key", "Arn"] }),
            get_att("Key", "Arn")
        );
    }
}
