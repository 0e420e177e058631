//! ECS cluster on an auto-scaled EC2 fleet.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tracing::info;
use validator::{Validate, ValidationError};

use crate::app::App;
use crate::database::validate_instance_type;
use crate::network::{Network, SubnetKind};
use crate::stack::{Error, Export};
use crate::template::{self, DeletionPolicy, Parameter, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacitySpec {
    pub min: u32,
    pub desired: u32,
    pub max: u32,
}

impl Default for CapacitySpec {
    fn default() -> Self {
        return Self {
            min: 1,
            desired: 2,
            max: 2,
        };
    }
}

impl CapacitySpec {
    fn check(&self) -> Result<(), String> {
        if self.max == 0 {
            return Err(String::from("max has to be at least 1"));
        }
        if self.min > self.desired || self.desired > self.max {
            return Err(format!(
                "expected min <= desired <= max, got {} <= {} <= {}",
                self.min, self.desired, self.max
            ));
        }

        return Ok(());
    }
}

fn validate_capacity(capacity: &CapacitySpec) -> Result<(), ValidationError> {
    match capacity.check() {
        Ok(_) => Ok(()),
        Err(_) => Err(ValidationError::new(
            "Capacity has to satisfy min <= desired <= max and max >= 1",
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClusterSpec {
    #[validate(custom = "validate_instance_type")]
    pub instance_type: String,

    #[validate(custom = "validate_capacity")]
    pub capacity: CapacitySpec,

    #[validate(length(min = 1))]
    pub machine_image_parameter: String,

    #[validate(length(min = 1))]
    pub exec_log_prefix: String,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        return Self {
            instance_type: String::from("t3a.micro"),
            capacity: CapacitySpec::default(),
            machine_image_parameter: String::from(
                "/aws/service/ecs/optimized-ami/amazon-linux-2/recommended/image_id",
            ),
            exec_log_prefix: String::from("exec-command-output"),
        };
    }
}

/// Handle to a declared ECS cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub stack_id: String,
    pub cluster_name: Export,
    pub cluster_arn: Export,
    pub instance_security_group: Export,
    pub max_nodes: u32,
    pub network: Network,
}

pub fn declare(
    app: &mut App,
    stack_id: &str,
    network: &Network,
    spec: &ClusterSpec,
) -> Result<Cluster, Error> {
    spec.capacity.check().map_err(Error::InvalidCapacity)?;

    // Nodes prefer private subnets with egress and fall back to public ones.
    let mut placement = network.subnets(SubnetKind::PrivateWithEgress);
    if placement.is_empty() {
        placement = network.subnets(SubnetKind::Public);
    }
    if placement.is_empty() {
        return Err(Error::InvalidPlacement(format!(
            "Network {} has no subnets with internet access for cluster nodes",
            network.stack_id
        )));
    }

    let stack = app.add_stack(stack_id)?;
    stack.set_description("Compute: ECS cluster on an auto-scaled EC2 fleet");

    let vpc_id = stack.import(&network.vpc_id)?;
    let mut subnet_ids = Vec::with_capacity(placement.len());
    for subnet in &placement {
        subnet_ids.push(stack.import(&subnet.subnet_id)?);
    }

    let key = stack.add_resource(
        "EcsExecLogKey",
        Resource::new(
            "AWS::KMS::Key",
            json!({
                "EnableKeyRotation": true,
                "KeyPolicy": {
                    "Version": "2012-10-17",
                    "Statement": [
                        {
                            "Effect": "Allow",
                            "Principal": { "AWS": template::sub("arn:${AWS::Partition}:iam::${AWS::AccountId}:root") },
                            "Action": "kms:*",
                            "Resource": "*",
                        },
                        {
                            "Effect": "Allow",
                            "Principal": { "Service": template::sub("logs.${AWS::Region}.amazonaws.com") },
                            "Action": ["kms:Encrypt*", "kms:Decrypt*", "kms:ReEncrypt*", "kms:GenerateDataKey*", "kms:Describe*"],
                            "Resource": "*",
                        },
                    ],
                },
            }),
        )
        .removal_policy(DeletionPolicy::Retain),
    )?;

    let log_group = stack.add_resource(
        "EcsExecLogGroup",
        Resource::new(
            "AWS::Logs::LogGroup",
            json!({
                "KmsKeyId": template::get_att(&key, "Arn"),
                "RetentionInDays": 731,
            }),
        )
        .removal_policy(DeletionPolicy::Retain),
    )?;

    let bucket = stack.add_resource(
        "EcsExecLogBucket",
        Resource::new(
            "AWS::S3::Bucket",
            json!({
                "BucketEncryption": {
                    "ServerSideEncryptionConfiguration": [{
                        "ServerSideEncryptionByDefault": {
                            "SSEAlgorithm": "aws:kms",
                            "KMSMasterKeyID": template::get_att(&key, "Arn"),
                        },
                    }],
                },
                "PublicAccessBlockConfiguration": {
                    "BlockPublicAcls": true,
                    "BlockPublicPolicy": true,
                    "IgnorePublicAcls": true,
                    "RestrictPublicBuckets": true,
                },
            }),
        )
        .removal_policy(DeletionPolicy::Retain),
    )?;

    let cluster = stack.add_resource(
        "ECSCluster",
        Resource::new(
            "AWS::ECS::Cluster",
            json!({
                "Configuration": {
                    "ExecuteCommandConfiguration": {
                        "KmsKeyId": template::get_att(&key, "Arn"),
                        "Logging": "OVERRIDE",
                        "LogConfiguration": {
                            "CloudWatchLogGroupName": template::reference(&log_group),
                            "CloudWatchEncryptionEnabled": true,
                            "S3BucketName": template::reference(&bucket),
                            "S3EncryptionEnabled": true,
                            "S3KeyPrefix": spec.exec_log_prefix,
                        },
                    },
                },
            }),
        ),
    )?;

    let image = stack.add_parameter(
        "SsmParameterValue/EcsOptimizedAmi",
        Parameter {
            parameter_type: String::from("AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>"),
            default: Some(spec.machine_image_parameter.clone()),
            description: Some(String::from("ECS-optimized Amazon Linux 2 image")),
        },
    )?;

    let security_group = stack.add_resource(
        "ECSChallengeASG/InstanceSecurityGroup",
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": format!("{}/ECSChallengeASG/InstanceSecurityGroup", stack_id),
                "VpcId": vpc_id,
                "SecurityGroupEgress": [{
                    "CidrIp": "0.0.0.0/0",
                    "IpProtocol": "-1",
                    "Description": "Allow all outbound traffic by default",
                }],
            }),
        ),
    )?;

    let role = stack.add_resource(
        "ECSChallengeASG/InstanceRole",
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": { "Service": "ec2.amazonaws.com" },
                        "Action": "sts:AssumeRole",
                    }],
                },
                "ManagedPolicyArns": [
                    template::sub("arn:${AWS::Partition}:iam::aws:policy/service-role/AmazonEC2ContainerServiceforEC2Role"),
                    template::sub("arn:${AWS::Partition}:iam::aws:policy/AmazonSSMManagedInstanceCore"),
                ],
            }),
        ),
    )?;

    let profile = stack.add_resource(
        "ECSChallengeASG/InstanceProfile",
        Resource::new(
            "AWS::IAM::InstanceProfile",
            json!({ "Roles": [template::reference(&role)] }),
        ),
    )?;

    let mut user_data_variables = Map::new();
    user_data_variables.insert(String::from("Cluster"), template::reference(&cluster));
    let launch_configuration = stack.add_resource(
        "ECSChallengeASG/LaunchConfig",
        Resource::new(
            "AWS::AutoScaling::LaunchConfiguration",
            json!({
                "ImageId": template::reference(&image),
                "InstanceType": spec.instance_type,
                "IamInstanceProfile": template::reference(&profile),
                "SecurityGroups": [template::get_att(&security_group, "GroupId")],
                "UserData": template::base64(template::sub_with(
                    "#!/bin/bash\necho ECS_CLUSTER=${Cluster} >> /etc/ecs/ecs.config\n",
                    user_data_variables,
                )),
            }),
        )
        .depends_on(&role),
    )?;

    let auto_scaling_group = stack.add_resource(
        "ECSChallengeASG/ASG",
        Resource::new(
            "AWS::AutoScaling::AutoScalingGroup",
            json!({
                "MinSize": spec.capacity.min.to_string(),
                "MaxSize": spec.capacity.max.to_string(),
                "DesiredCapacity": spec.capacity.desired.to_string(),
                "LaunchConfigurationName": template::reference(&launch_configuration),
                "VPCZoneIdentifier": subnet_ids,
                "Tags": [{
                    "Key": "Name",
                    "Value": format!("{}/ECSChallengeASG", stack_id),
                    "PropagateAtLaunch": true,
                }],
            }),
        ),
    )?;

    let capacity_provider = stack.add_resource(
        "AsgCapacityProvider",
        Resource::new(
            "AWS::ECS::CapacityProvider",
            json!({
                "AutoScalingGroupProvider": {
                    "AutoScalingGroupArn": template::reference(&auto_scaling_group),
                    "ManagedScaling": { "Status": "ENABLED", "TargetCapacity": 100 },
                    "ManagedTerminationProtection": "DISABLED",
                },
            }),
        ),
    )?;

    stack.add_resource(
        "ECSCluster/CapacityProviderAssociations",
        Resource::new(
            "AWS::ECS::ClusterCapacityProviderAssociations",
            json!({
                "Cluster": template::reference(&cluster),
                "CapacityProviders": [template::reference(&capacity_provider)],
                "DefaultCapacityProviderStrategy": [],
            }),
        ),
    )?;

    let cluster_name = stack.export("ClusterName", template::reference(&cluster))?;
    let cluster_arn = stack.export("ClusterArn", template::get_att(&cluster, "Arn"))?;
    let instance_security_group =
        stack.export("InstanceSecurityGroupId", template::get_att(&security_group, "GroupId"))?;

    info!(
        stack = stack_id,
        instance_type = %spec.instance_type,
        desired = spec.capacity.desired,
        subnets = placement.len(),
        "Declared compute cluster"
    );

    return Ok(Cluster {
        stack_id: stack_id.to_string(),
        cluster_name,
        cluster_arn,
        instance_security_group,
        max_nodes: spec.capacity.max,
        network: network.clone(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{self, NetworkSpec};
    use crate::stack::Environment;
    use crate::template::Template;

    fn synth(spec: &ClusterSpec) -> Result<(Cluster, Template), Error> {
        let mut app = App::new(Environment::default());
        let network = network::declare(&mut app, "VpcStack", &NetworkSpec::default())?;
        let cluster = declare(&mut app, "EcsStack", &network, spec)?;
        let template = app.stack("EcsStack").unwrap().template().clone();
        return Ok((cluster, template));
    }

    #[test]
    fn declares_the_cluster_and_its_audit_destinations() {
        let (_, template) = synth(&ClusterSpec::default()).unwrap();

        assert_eq!(1, template.resource_count("AWS::KMS::Key"));
        assert_eq!(1, template.resource_count("AWS::Logs::LogGroup"));
        assert_eq!(1, template.resource_count("AWS::S3::Bucket"));
        assert_eq!(1, template.resource_count("AWS::IAM::InstanceProfile"));
        assert_eq!(1, template.resource_count("AWS::AutoScaling::LaunchConfiguration"));
        assert_eq!(1, template.resource_count("AWS::AutoScaling::AutoScalingGroup"));
        assert_eq!(1, template.resource_count("AWS::ECS::Cluster"));
    }

    #[test]
    fn audit_destinations_share_the_cluster_key() {
        let (_, template) = synth(&ClusterSpec::default()).unwrap();
        let key = json!({ "Fn::GetAtt": ["EcsExecLogKey", "Arn"] });

        assert_eq!(
            true,
            template.has_resource_properties(
                "AWS::ECS::Cluster",
                &json!({
                    "Configuration": {
                        "ExecuteCommandConfiguration": {
                            "KmsKeyId": key,
                            "Logging": "OVERRIDE",
                            "LogConfiguration": {
                                "CloudWatchLogGroupName": { "Ref": "EcsExecLogGroup" },
                                "CloudWatchEncryptionEnabled": true,
                                "S3BucketName": { "Ref": "EcsExecLogBucket" },
                                "S3EncryptionEnabled": true,
                                "S3KeyPrefix": "exec-command-output",
                            },
                        },
                    },
                })
            )
        );
        assert_eq!(
            true,
            template.has_resource_properties("AWS::Logs::LogGroup", &json!({ "KmsKeyId": key }))
        );
        assert_eq!(
            true,
            template.has_resource_properties(
                "AWS::S3::Bucket",
                &json!({
                    "BucketEncryption": {
                        "ServerSideEncryptionConfiguration": [{
                            "ServerSideEncryptionByDefault": { "KMSMasterKeyID": key },
                        }],
                    },
                })
            )
        );
    }

    #[test]
    fn scales_nodes_across_private_subnets() {
        let (cluster, template) = synth(&ClusterSpec::default()).unwrap();

        assert_eq!(
            true,
            template.has_resource_properties(
                "AWS::AutoScaling::AutoScalingGroup",
                &json!({
                    "MinSize": "1",
                    "MaxSize": "2",
                    "DesiredCapacity": "2",
                    "VPCZoneIdentifier": [
                        { "Fn::ImportValue": "VpcStack:PrivateSubnet1" },
                        { "Fn::ImportValue": "VpcStack:PrivateSubnet2" },
                    ],
                })
            )
        );
        assert_eq!(
            true,
            template.has_resource_properties(
                "AWS::AutoScaling::LaunchConfiguration",
                &json!({ "InstanceType": "t3a.micro" })
            )
        );
        assert_eq!("EcsStack:ClusterName", cluster.cluster_name.name);
        assert_eq!(2, cluster.max_nodes);
    }

    #[test]
    fn rejects_inconsistent_capacity() {
        let spec = ClusterSpec {
            capacity: CapacitySpec {
                min: 3,
                desired: 2,
                max: 4,
            },
            ..ClusterSpec::default()
        };

        match synth(&spec) {
            Err(Error::InvalidCapacity(_)) => {}
            other => panic!("Expected `InvalidCapacity` error, got {:?}", other),
        }
        assert_eq!(true, spec.validate().is_err());
        assert_eq!(true, ClusterSpec::default().validate().is_ok());
    }
}
