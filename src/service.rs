//! Load-balanced EC2 service reading its credentials from the generated secret.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;
use validator::{Validate, ValidationError};

use crate::app::App;
use crate::cluster::Cluster;
use crate::database::GeneratedCredential;
use crate::network::SubnetKind;
use crate::stack::Error;
use crate::template::{self, DeletionPolicy, Resource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServiceSpec {
    #[validate(length(min = 1))]
    pub image: String,

    #[validate(length(min = 1, max = 255))]
    pub container_name: String,

    #[validate(range(min = 6))]
    pub memory_limit_mib: u32,

    #[validate(range(max = 1000))]
    pub desired_count: u32,

    #[validate(range(min = 1))]
    pub container_port: u16,

    #[validate(range(min = 1))]
    pub listener_port: u16,

    #[validate(custom = "validate_health_check_path")]
    pub health_check_path: String,

    pub rollback_on_failure: bool,

    pub public_load_balancer: bool,

    /// Environment variable name to credential field.
    #[validate(custom = "validate_variable_names")]
    pub secrets: BTreeMap<String, String>,

    #[validate(custom = "validate_variable_names")]
    pub environment: BTreeMap<String, String>,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        let secrets = [
            ("VTT_DBUSER", "username"),
            ("VTT_DBPASSWORD", "password"),
            ("VTT_DBHOST", "host"),
            ("VTT_DBPORT", "port"),
        ]
        .iter()
        .map(|(name, field)| (name.to_string(), field.to_string()))
        .collect();

        return Self {
            image: String::from("servian/techchallengeapp"),
            container_name: String::from("web"),
            memory_limit_mib: 1024,
            desired_count: 1,
            container_port: 3000,
            listener_port: 3000,
            health_check_path: String::from("/healthcheck/"),
            rollback_on_failure: true,
            public_load_balancer: true,
            secrets,
            environment: BTreeMap::new(),
        };
    }
}

fn validate_health_check_path(path: &str) -> Result<(), ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::new(
            "The health check path has to start with `/`",
        ));
    }

    return Ok(());
}

fn validate_variable_names(variables: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    for name in variables.keys() {
        if name.is_empty()
            || name.starts_with(|c: char| c.is_ascii_digit())
            || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ValidationError::new(
                "Environment variable names may only contain alphanumerics and `_`",
            ));
        }
    }

    return Ok(());
}

/// Handle to a declared service.
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub stack_id: String,
    pub service: String,
    pub load_balancer: String,
    pub listener_port: u16,
}

pub fn declare(
    app: &mut App,
    stack_id: &str,
    cluster: &Cluster,
    credential: &GeneratedCredential,
    spec: &ServiceSpec,
) -> Result<Service, Error> {
    for (name, field) in &spec.secrets {
        if !credential.has_field(field) {
            return Err(Error::UnresolvedSecret(
                name.clone(),
                credential.secret_name.clone(),
                field.clone(),
            ));
        }
    }

    // Tasks bind a static host port, so each node runs at most one of them.
    if spec.desired_count > cluster.max_nodes {
        return Err(Error::InvalidCapacity(format!(
            "{} tasks need as many nodes, cluster {} scales to at most {}",
            spec.desired_count, cluster.stack_id, cluster.max_nodes
        )));
    }

    let (facing, scheme) = if spec.public_load_balancer {
        (SubnetKind::Public, "internet-facing")
    } else {
        (SubnetKind::PrivateWithEgress, "internal")
    };
    let placement = cluster.network.spread_subnets(facing, "The load balancer")?;

    let stack = app.add_stack(stack_id)?;
    stack.set_description("Application: load-balanced service on the ECS cluster");

    let vpc_id = stack.import(&cluster.network.vpc_id)?;
    let cluster_name = stack.import(&cluster.cluster_name)?;
    let instance_security_group = stack.import(&cluster.instance_security_group)?;
    let mut subnet_ids = Vec::with_capacity(placement.len());
    for subnet in &placement {
        subnet_ids.push(stack.import(&subnet.subnet_id)?);
    }

    let lb_security_group = stack.add_resource(
        "Service/LB/SecurityGroup",
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": format!("{}/Service/LB/SecurityGroup", stack_id),
                "VpcId": vpc_id,
                "SecurityGroupIngress": [{
                    "CidrIp": "0.0.0.0/0",
                    "IpProtocol": "tcp",
                    "FromPort": spec.listener_port,
                    "ToPort": spec.listener_port,
                    "Description": format!("Allow from anyone on port {}", spec.listener_port),
                }],
                "SecurityGroupEgress": [{
                    "CidrIp": "0.0.0.0/0",
                    "IpProtocol": "-1",
                    "Description": "Allow all outbound traffic by default",
                }],
            }),
        ),
    )?;

    let load_balancer = stack.add_resource(
        "Service/LB",
        Resource::new(
            "AWS::ElasticLoadBalancingV2::LoadBalancer",
            json!({
                "Type": "application",
                "Scheme": scheme,
                "Subnets": subnet_ids,
                "SecurityGroups": [template::get_att(&lb_security_group, "GroupId")],
                "LoadBalancerAttributes": [{ "Key": "deletion_protection.enabled", "Value": "false" }],
            }),
        ),
    )?;

    let target_group = stack.add_resource(
        "Service/LB/PublicListener/ECSGroup",
        Resource::new(
            "AWS::ElasticLoadBalancingV2::TargetGroup",
            json!({
                "Port": spec.container_port,
                "Protocol": "HTTP",
                "TargetType": "instance",
                "VpcId": vpc_id,
                "HealthCheckPath": spec.health_check_path,
                "HealthCheckPort": spec.container_port.to_string(),
                "TargetGroupAttributes": [{ "Key": "stickiness.enabled", "Value": "false" }],
            }),
        ),
    )?;

    let listener = stack.add_resource(
        "Service/LB/PublicListener",
        Resource::new(
            "AWS::ElasticLoadBalancingV2::Listener",
            json!({
                "LoadBalancerArn": template::reference(&load_balancer),
                "Port": spec.listener_port,
                "Protocol": "HTTP",
                "DefaultActions": [{
                    "Type": "forward",
                    "TargetGroupArn": template::reference(&target_group),
                }],
            }),
        ),
    )?;

    stack.add_resource(
        "Service/LB/SecurityGroup/to-cluster-instances",
        Resource::new(
            "AWS::EC2::SecurityGroupIngress",
            json!({
                "GroupId": instance_security_group,
                "SourceSecurityGroupId": template::get_att(&lb_security_group, "GroupId"),
                "IpProtocol": "tcp",
                "FromPort": spec.container_port,
                "ToPort": spec.container_port,
                "Description": "Load balancer to target",
            }),
        ),
    )?;

    let assume_by_tasks = json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "ecs-tasks.amazonaws.com" },
            "Action": "sts:AssumeRole",
        }],
    });
    let task_role = stack.add_resource(
        "Service/TaskDef/TaskRole",
        Resource::new("AWS::IAM::Role", json!({ "AssumeRolePolicyDocument": assume_by_tasks })),
    )?;
    let execution_role = stack.add_resource(
        "Service/TaskDef/ExecutionRole",
        Resource::new("AWS::IAM::Role", json!({ "AssumeRolePolicyDocument": assume_by_tasks })),
    )?;

    let log_group = stack.add_resource(
        &format!("Service/TaskDef/{}/LogGroup", spec.container_name),
        Resource::new("AWS::Logs::LogGroup", json!({ "RetentionInDays": 30 }))
            .removal_policy(DeletionPolicy::Retain),
    )?;

    let mut execution_statements = vec![json!({
        "Effect": "Allow",
        "Action": ["logs:CreateLogStream", "logs:PutLogEvents"],
        "Resource": template::get_att(&log_group, "Arn"),
    })];
    if !spec.secrets.is_empty() {
        execution_statements.push(json!({
            "Effect": "Allow",
            "Action": ["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"],
            "Resource": credential.secret_arn_pattern(),
        }));
        execution_statements.push(json!({
            "Effect": "Allow",
            "Action": "kms:Decrypt",
            "Resource": "*",
            "Condition": {
                "StringEquals": { "kms:ViaService": template::sub("secretsmanager.${AWS::Region}.amazonaws.com") },
            },
        }));
    }
    let execution_policy = stack.add_resource(
        "Service/TaskDef/ExecutionRole/DefaultPolicy",
        Resource::new(
            "AWS::IAM::Policy",
            json!({
                "PolicyName": format!("{}ExecutionRoleDefaultPolicy", stack_id),
                "Roles": [template::reference(&execution_role)],
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": execution_statements,
                },
            }),
        ),
    )?;

    let secrets: Vec<Value> = spec
        .secrets
        .iter()
        .map(|(name, field)| json!({ "Name": name, "ValueFrom": credential.field_reference(field) }))
        .collect();
    let environment: Vec<Value> = spec
        .environment
        .iter()
        .map(|(name, value)| json!({ "Name": name, "Value": value }))
        .collect();

    let task_definition = stack.add_resource(
        "Service/TaskDef",
        Resource::new(
            "AWS::ECS::TaskDefinition",
            json!({
                "Family": format!("{}Service", stack_id),
                "NetworkMode": "bridge",
                "RequiresCompatibilities": ["EC2"],
                "TaskRoleArn": template::get_att(&task_role, "Arn"),
                "ExecutionRoleArn": template::get_att(&execution_role, "Arn"),
                "ContainerDefinitions": [{
                    "Name": spec.container_name,
                    "Image": spec.image,
                    "Essential": true,
                    "Memory": spec.memory_limit_mib,
                    "PortMappings": [{
                        "ContainerPort": spec.container_port,
                        "HostPort": spec.container_port,
                        "Protocol": "tcp",
                    }],
                    "Secrets": secrets,
                    "Environment": environment,
                    "LogConfiguration": {
                        "LogDriver": "awslogs",
                        "Options": {
                            "awslogs-group": template::reference(&log_group),
                            "awslogs-stream-prefix": "Service",
                            "awslogs-region": template::reference("AWS::Region"),
                        },
                    },
                }],
            }),
        )
        .depends_on(&execution_policy),
    )?;

    let service = stack.add_resource(
        "Service/Service",
        Resource::new(
            "AWS::ECS::Service",
            json!({
                "Cluster": cluster_name,
                "TaskDefinition": template::reference(&task_definition),
                "LaunchType": "EC2",
                "DesiredCount": spec.desired_count,
                "SchedulingStrategy": "REPLICA",
                "HealthCheckGracePeriodSeconds": 60,
                "DeploymentConfiguration": {
                    "DeploymentCircuitBreaker": {
                        "Enable": true,
                        "Rollback": spec.rollback_on_failure,
                    },
                    "MaximumPercent": 200,
                    "MinimumHealthyPercent": 50,
                },
                "LoadBalancers": [{
                    "ContainerName": spec.container_name,
                    "ContainerPort": spec.container_port,
                    "TargetGroupArn": template::reference(&target_group),
                }],
            }),
        )
        .depends_on(&listener)
        .depends_on(&target_group),
    )?;

    stack.add_output(
        "LoadBalancerDNS",
        template::get_att(&load_balancer, "DNSName"),
        "DNS name of the application load balancer",
    )?;
    stack.add_output(
        "ServiceURL",
        template::join(
            "",
            vec![
                json!("http://"),
                template::get_att(&load_balancer, "DNSName"),
                json!(format!(":{}", spec.listener_port)),
            ],
        ),
        "URL of the service",
    )?;

    info!(
        stack = stack_id,
        image = %spec.image,
        desired_count = spec.desired_count,
        listener_port = spec.listener_port,
        secrets = spec.secrets.len(),
        "Declared service"
    );

    return Ok(Service {
        stack_id: stack_id.to_string(),
        service,
        load_balancer,
        listener_port: spec.listener_port,
    });
}
