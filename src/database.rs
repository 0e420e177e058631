//! Encrypted Aurora cluster and its generated credential.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::info;
use validator::{Validate, ValidationError};

use crate::app::App;
use crate::network::{Network, SubnetKind};
use crate::stack::{Error, Export};
use crate::template::{self, DeletionPolicy, Resource};

const HOSTED_ROTATION_TRANSFORM: &str = "AWS::SecretsManager-2020-07-23";
const EXCLUDED_PASSWORD_CHARACTERS: &str = " %+~`#$&*()|[]{}:;<>?!'/@\"\\";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseEngine {
    AuroraPostgresql,
    AuroraMysql,
}

impl DatabaseEngine {
    pub fn name(&self) -> &'static str {
        match self {
            DatabaseEngine::AuroraPostgresql => "aurora-postgresql",
            DatabaseEngine::AuroraMysql => "aurora-mysql",
        }
    }

    fn rotation_type(&self) -> &'static str {
        match self {
            DatabaseEngine::AuroraPostgresql => "PostgreSQLSingleUser",
            DatabaseEngine::AuroraMysql => "MySQLSingleUser",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CredentialSpec {
    #[validate(length(min = 1, max = 63))]
    pub username: String,

    #[validate(custom = "validate_secret_name")]
    pub secret_name: String,

    #[validate(range(min = 1, max = 1000))]
    pub rotation_days: Option<u32>,
}

impl Default for CredentialSpec {
    fn default() -> Self {
        return Self {
            username: String::from("pgadmin"),
            secret_name: String::from("postgresql/pgadmin"),
            rotation_days: None,
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DatabaseSpec {
    pub engine: DatabaseEngine,

    #[validate(length(min = 1))]
    pub engine_version: String,

    #[validate(range(min = 1024))]
    pub port: u16,

    #[validate(custom = "validate_instance_type")]
    pub instance_type: String,

    #[validate(range(min = 1, max = 16))]
    pub instances: u8,

    #[validate]
    pub credential: CredentialSpec,
}

impl Default for DatabaseSpec {
    fn default() -> Self {
        return Self {
            engine: DatabaseEngine::AuroraPostgresql,
            engine_version: String::from("10.7"),
            port: 5432,
            instance_type: String::from("t4g.micro"),
            instances: 2,
            credential: CredentialSpec::default(),
        };
    }
}

pub(crate) fn validate_instance_type(instance_type: &str) -> Result<(), ValidationError> {
    match instance_type.split_once('.') {
        Some((class, size))
            if !class.is_empty()
                && !size.is_empty()
                && class.chars().all(|c| c.is_ascii_alphanumeric())
                && size.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            Ok(())
        }
        _ => Err(ValidationError::new(
            "Instance types have the form `<class>.<size>`, e.g. `t4g.micro`",
        )),
    }
}

fn validate_secret_name(secret_name: &str) -> Result<(), ValidationError> {
    if secret_name.is_empty() || secret_name.len() > 512 {
        return Err(ValidationError::new(
            "Secret names have to be between 1 and 512 characters long",
        ));
    }
    if !secret_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/_+=.@-".contains(c))
    {
        return Err(ValidationError::new(
            "Secret names may only contain alphanumerics and `/_+=.@-`",
        ));
    }

    return Ok(());
}

/// Secret created at deploy time; downstream stacks address its fields by
/// name and never see the values.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCredential {
    pub secret_name: String,
    pub fields: BTreeSet<String>,
}

impl GeneratedCredential {
    pub fn has_field(&self, field: &str) -> bool {
        return self.fields.contains(field);
    }

    /// Partial ARN resolved from the secret name in the consuming account.
    pub fn secret_arn(&self) -> Value {
        return template::sub(&format!(
            "arn:${{AWS::Partition}}:secretsmanager:${{AWS::Region}}:${{AWS::AccountId}}:secret:{}",
            self.secret_name
        ));
    }

    /// Matches the full ARN, which carries a random six-character suffix.
    pub fn secret_arn_pattern(&self) -> Value {
        return template::sub(&format!(
            "arn:${{AWS::Partition}}:secretsmanager:${{AWS::Region}}:${{AWS::AccountId}}:secret:{}-??????",
            self.secret_name
        ));
    }

    /// `ValueFrom` for a single JSON key of the secret.
    pub fn field_reference(&self, field: &str) -> Value {
        return template::sub(&format!(
            "arn:${{AWS::Partition}}:secretsmanager:${{AWS::Region}}:${{AWS::AccountId}}:secret:{}:{}::",
            self.secret_name, field
        ));
    }
}

/// Handle to a declared database cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Database {
    pub stack_id: String,
    pub endpoint: Export,
    pub secret_arn: Export,
    pub credential: GeneratedCredential,
}

pub fn declare(
    app: &mut App,
    stack_id: &str,
    network: &Network,
    spec: &DatabaseSpec,
) -> Result<Database, Error> {
    let placement = network.spread_subnets(SubnetKind::PrivateIsolated, "The database")?;

    let stack = app.add_stack(stack_id)?;
    stack.set_description("Database: encrypted Aurora cluster with generated credentials");

    let vpc_id = stack.import(&network.vpc_id)?;
    let mut subnet_ids = Vec::with_capacity(placement.len());
    for subnet in &placement {
        subnet_ids.push(stack.import(&subnet.subnet_id)?);
    }

    let key = stack.add_resource(
        "DatabaseKey",
        Resource::new(
            "AWS::KMS::Key",
            json!({
                "EnableKeyRotation": true,
                "KeyPolicy": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": { "AWS": template::sub("arn:${AWS::Partition}:iam::${AWS::AccountId}:root") },
                        "Action": "kms:*",
                        "Resource": "*",
                    }],
                },
            }),
        )
        .removal_policy(DeletionPolicy::Retain),
    )?;

    let secret = stack.add_resource(
        "Database/Secret",
        Resource::new(
            "AWS::SecretsManager::Secret",
            json!({
                "Name": spec.credential.secret_name,
                "Description": format!("Generated credentials for {}", stack_id),
                "KmsKeyId": template::get_att(&key, "Arn"),
                "GenerateSecretString": {
                    "SecretStringTemplate": json!({ "username": spec.credential.username }).to_string(),
                    "GenerateStringKey": "password",
                    "PasswordLength": 30,
                    "ExcludeCharacters": EXCLUDED_PASSWORD_CHARACTERS,
                },
            }),
        )
        .removal_policy(DeletionPolicy::Delete),
    )?;

    let subnet_group = stack.add_resource(
        "Database/Subnets",
        Resource::new(
            "AWS::RDS::DBSubnetGroup",
            json!({
                "DBSubnetGroupDescription": format!("Subnets for {} database", stack_id),
                "SubnetIds": subnet_ids,
            }),
        ),
    )?;

    let security_group = stack.add_resource(
        "Database/SecurityGroup",
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": format!("{}/Database/SecurityGroup", stack_id),
                "VpcId": vpc_id,
                "SecurityGroupIngress": [{
                    "IpProtocol": "tcp",
                    "FromPort": spec.port,
                    "ToPort": spec.port,
                    "CidrIp": network.cidr,
                    "Description": "Database access from within the VPC",
                }],
                "SecurityGroupEgress": [{
                    "CidrIp": "0.0.0.0/0",
                    "IpProtocol": "-1",
                    "Description": "Allow all outbound traffic by default",
                }],
            }),
        ),
    )?;

    let cluster = stack.add_resource(
        "Database",
        Resource::new(
            "AWS::RDS::DBCluster",
            json!({
                "Engine": spec.engine.name(),
                "EngineVersion": spec.engine_version,
                "Port": spec.port,
                "DBSubnetGroupName": template::reference(&subnet_group),
                "VpcSecurityGroupIds": [template::get_att(&security_group, "GroupId")],
                "MasterUsername": spec.credential.username,
                "MasterUserPassword": template::join("", vec![
                    json!("{{resolve:secretsmanager:"),
                    template::reference(&secret),
                    json!(":SecretString:password::}}"),
                ]),
                "StorageEncrypted": true,
                "KmsKeyId": template::get_att(&key, "Arn"),
                "CopyTagsToSnapshot": true,
            }),
        )
        .removal_policy(DeletionPolicy::Snapshot),
    )?;

    let attachment = stack.add_resource(
        "Database/Secret/Attachment",
        Resource::new(
            "AWS::SecretsManager::SecretTargetAttachment",
            json!({
                "SecretId": template::reference(&secret),
                "TargetId": template::reference(&cluster),
                "TargetType": "AWS::RDS::DBCluster",
            }),
        ),
    )?;

    for index in 1..=spec.instances {
        stack.add_resource(
            &format!("Database/Instance{}", index),
            Resource::new(
                "AWS::RDS::DBInstance",
                json!({
                    "DBClusterIdentifier": template::reference(&cluster),
                    "DBInstanceClass": format!("db.{}", spec.instance_type),
                    "Engine": spec.engine.name(),
                    "EngineVersion": spec.engine_version,
                    "DBSubnetGroupName": template::reference(&subnet_group),
                    "PubliclyAccessible": false,
                }),
            )
            .removal_policy(DeletionPolicy::Delete),
        )?;
    }

    if let Some(days) = spec.credential.rotation_days {
        // Isolated subnets have no route out, so the rotation function
        // reaches Secrets Manager through an interface endpoint.
        let endpoint_security_group = stack.add_resource(
            "Database/SecretsManagerEndpoint/SecurityGroup",
            Resource::new(
                "AWS::EC2::SecurityGroup",
                json!({
                    "GroupDescription": format!("{}/Database/SecretsManagerEndpoint/SecurityGroup", stack_id),
                    "VpcId": vpc_id,
                    "SecurityGroupIngress": [{
                        "IpProtocol": "tcp",
                        "FromPort": 443,
                        "ToPort": 443,
                        "CidrIp": network.cidr,
                        "Description": "HTTPS from within the VPC",
                    }],
                }),
            ),
        )?;
        let secrets_endpoint = stack.add_resource(
            "Database/SecretsManagerEndpoint",
            Resource::new(
                "AWS::EC2::VPCEndpoint",
                json!({
                    "ServiceName": template::sub("com.amazonaws.${AWS::Region}.secretsmanager"),
                    "VpcEndpointType": "Interface",
                    "VpcId": vpc_id,
                    "SubnetIds": subnet_ids,
                    "SecurityGroupIds": [template::get_att(&endpoint_security_group, "GroupId")],
                    "PrivateDnsEnabled": true,
                }),
            ),
        )?;

        stack.add_transform(HOSTED_ROTATION_TRANSFORM);
        stack.add_resource(
            "Database/Secret/RotationSchedule",
            Resource::new(
                "AWS::SecretsManager::RotationSchedule",
                json!({
                    "SecretId": template::reference(&attachment),
                    "HostedRotationLambda": {
                        "RotationType": spec.engine.rotation_type(),
                        "VpcSubnetIds": template::join(",", subnet_ids.clone()),
                        "VpcSecurityGroupIds": template::get_att(&security_group, "GroupId"),
                        "KmsKeyArn": template::get_att(&key, "Arn"),
                    },
                    "RotationRules": { "AutomaticallyAfterDays": days },
                }),
            )
            .depends_on(&secrets_endpoint),
        )?;
    }

    let endpoint = stack.export("Endpoint", template::get_att(&cluster, "Endpoint.Address"))?;
    let secret_arn = stack.export("SecretArn", template::reference(&secret))?;

    // The attachment adds the connection fields to the generated record.
    let fields: BTreeSet<String> = ["username", "password", "host", "port", "engine", "dbClusterIdentifier"]
        .iter()
        .map(|field| field.to_string())
        .collect();

    info!(
        stack = stack_id,
        engine = spec.engine.name(),
        version = %spec.engine_version,
        instances = spec.instances,
        secret = %spec.credential.secret_name,
        "Declared database"
    );

    return Ok(Database {
        stack_id: stack_id.to_string(),
        endpoint,
        secret_arn,
        credential: GeneratedCredential {
            secret_name: spec.credential.secret_name.clone(),
            fields,
        },
    });
}
