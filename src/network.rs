//! VPC with subnet tiers spread across availability zones.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::info;
use validator::{Validate, ValidationError};

use crate::app::App;
use crate::stack::{logical_id, Error, Export};
use crate::template::{self, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubnetKind {
    Public,
    PrivateWithEgress,
    PrivateIsolated,
}

impl SubnetKind {
    fn label(&self) -> &'static str {
        match self {
            SubnetKind::Public => "Public",
            SubnetKind::PrivateWithEgress => "Private",
            SubnetKind::PrivateIsolated => "Isolated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetTier {
    pub name: String,
    pub kind: SubnetKind,
    pub cidr_mask: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NetworkSpec {
    #[validate(custom = "validate_cidr")]
    pub cidr: String,

    #[validate(range(min = 2, max = 6))]
    pub max_azs: u8,

    #[validate(length(min = 1), custom = "validate_tiers")]
    pub subnets: Vec<SubnetTier>,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        return Self {
            cidr: String::from("10.0.0.0/21"),
            max_azs: 2,
            subnets: vec![
                SubnetTier {
                    name: String::from("Public"),
                    kind: SubnetKind::Public,
                    cidr_mask: 24,
                },
                SubnetTier {
                    name: String::from("Private"),
                    kind: SubnetKind::PrivateWithEgress,
                    cidr_mask: 24,
                },
                SubnetTier {
                    name: String::from("Data"),
                    kind: SubnetKind::PrivateIsolated,
                    cidr_mask: 27,
                },
            ],
        };
    }
}

fn validate_cidr(cidr: &str) -> Result<(), ValidationError> {
    match Ipv4Block::from_str(cidr) {
        Ok(block) if (16..=28).contains(&block.prefix) => Ok(()),
        Ok(_) => Err(ValidationError::new(
            "The VPC block has to be between /16 and /28",
        )),
        Err(_) => Err(ValidationError::new(
            "The VPC block has to be an aligned IPv4 CIDR",
        )),
    }
}

fn validate_tiers(tiers: &Vec<SubnetTier>) -> Result<(), ValidationError> {
    let mut names = BTreeSet::new();
    for tier in tiers {
        if tier.name.is_empty() || !tier.name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ValidationError::new(
                "Subnet tier names have to be non-empty and alphanumeric",
            ));
        }
        if !names.insert(logical_id(&tier.name)) {
            return Err(ValidationError::new("Subnet tier names have to be unique"));
        }
        if !(16..=28).contains(&tier.cidr_mask) {
            return Err(ValidationError::new(
                "Subnet masks have to be between /16 and /28",
            ));
        }
    }

    return Ok(());
}

/// Aligned IPv4 CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Block {
    base: u32,
    prefix: u8,
}

impl Ipv4Block {
    fn size(&self) -> u64 {
        return 1u64 << (32 - u32::from(self.prefix));
    }

    fn end(&self) -> u64 {
        return u64::from(self.base) + self.size();
    }
}

impl FromStr for Ipv4Block {
    type Err = Error;

    fn from_str(cidr: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidNetwork(format!("{} is not an IPv4 CIDR block", cidr));

        let (address, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
        let address = Ipv4Addr::from_str(address).map_err(|_| invalid())?;
        let prefix = prefix.parse::<u8>().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }

        let block = Ipv4Block {
            base: u32::from(address),
            prefix,
        };
        if u64::from(block.base) % block.size() != 0 {
            return Err(Error::InvalidNetwork(format!(
                "{} has host bits set",
                cidr
            )));
        }

        return Ok(block);
    }
}

impl fmt::Display for Ipv4Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PlannedSubnet {
    tier: String,
    kind: SubnetKind,
    zone: usize,
    block: Ipv4Block,
}

/// Carves consecutive, mask-aligned blocks out of the VPC block, tier by
/// tier and zone by zone.
fn plan_subnets(spec: &NetworkSpec) -> Result<Vec<PlannedSubnet>, Error> {
    let vpc = Ipv4Block::from_str(&spec.cidr)?;
    let zones = usize::from(spec.max_azs);
    if zones == 0 {
        return Err(Error::InvalidNetwork(String::from(
            "At least one availability zone is required",
        )));
    }
    if spec.subnets.is_empty() {
        return Err(Error::InvalidNetwork(String::from(
            "At least one subnet tier is required",
        )));
    }

    let mut names = BTreeSet::new();
    let mut cursor = u64::from(vpc.base);
    let mut planned = Vec::with_capacity(spec.subnets.len() * zones);

    for tier in &spec.subnets {
        if !names.insert(logical_id(&tier.name)) {
            return Err(Error::InvalidNetwork(format!(
                "Subnet tier {} is declared twice",
                tier.name
            )));
        }
        if tier.cidr_mask < vpc.prefix || tier.cidr_mask > 28 {
            return Err(Error::InvalidNetwork(format!(
                "Subnet tier {} mask /{} does not fit in {}",
                tier.name, tier.cidr_mask, vpc
            )));
        }

        let size = 1u64 << (32 - u32::from(tier.cidr_mask));
        for zone in 0..zones {
            let start = (cursor + size - 1) / size * size;
            if start + size > vpc.end() {
                return Err(Error::InvalidNetwork(format!(
                    "{} has no room left for subnet {}{} (/{})",
                    vpc,
                    tier.name,
                    zone + 1,
                    tier.cidr_mask
                )));
            }

            planned.push(PlannedSubnet {
                tier: tier.name.clone(),
                kind: tier.kind,
                zone,
                block: Ipv4Block {
                    base: start as u32,
                    prefix: tier.cidr_mask,
                },
            });
            cursor = start + size;
        }
    }

    return Ok(planned);
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subnet {
    pub tier: String,
    pub kind: SubnetKind,
    pub zone: usize,
    pub cidr: String,
    pub subnet_id: Export,
}

/// Handle to a declared VPC.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    pub stack_id: String,
    pub vpc_id: Export,
    pub cidr: String,
    pub zones: usize,
    pub subnets: Vec<Subnet>,
}

impl Network {
    pub fn subnets(&self, kind: SubnetKind) -> Vec<&Subnet> {
        return self
            .subnets
            .iter()
            .filter(|subnet| subnet.kind == kind)
            .collect();
    }

    /// Subnets of `kind`, which have to cover at least two zones.
    pub fn spread_subnets(&self, kind: SubnetKind, purpose: &str) -> Result<Vec<&Subnet>, Error> {
        let subnets = self.subnets(kind);
        let zones: BTreeSet<usize> = subnets.iter().map(|subnet| subnet.zone).collect();
        if zones.len() < 2 {
            return Err(Error::InvalidPlacement(format!(
                "{} needs {:?} subnets in at least two zones, network {} has {}",
                purpose,
                kind,
                self.stack_id,
                zones.len()
            )));
        }

        return Ok(subnets);
    }
}

pub fn declare(app: &mut App, stack_id: &str, spec: &NetworkSpec) -> Result<Network, Error> {
    let planned = plan_subnets(spec)?;
    let zones = usize::from(spec.max_azs);

    let first_public = spec
        .subnets
        .iter()
        .find(|tier| tier.kind == SubnetKind::Public)
        .map(|tier| tier.name.clone());
    let needs_nat = spec
        .subnets
        .iter()
        .any(|tier| tier.kind == SubnetKind::PrivateWithEgress);
    if needs_nat && first_public.is_none() {
        return Err(Error::InvalidNetwork(String::from(
            "Private subnets with egress need a public subnet tier for their NAT gateways",
        )));
    }

    let stack = app.add_stack(stack_id)?;
    stack.set_description("Network: VPC with public, private and isolated subnets");

    let vpc = stack.add_resource(
        "VPC",
        Resource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": spec.cidr,
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "InstanceTenancy": "default",
                "Tags": template::tags(&[("Name", json!(format!("{}/VPC", stack_id)))]),
            }),
        ),
    )?;

    let gateway = match first_public {
        Some(_) => {
            let igw = stack.add_resource(
                "VPC/IGW",
                Resource::new(
                    "AWS::EC2::InternetGateway",
                    json!({ "Tags": template::tags(&[("Name", json!(format!("{}/VPC", stack_id)))]) }),
                ),
            )?;
            let attachment = stack.add_resource(
                "VPC/VPCGW",
                Resource::new(
                    "AWS::EC2::VPCGatewayAttachment",
                    json!({
                        "VpcId": template::reference(&vpc),
                        "InternetGatewayId": template::reference(&igw),
                    }),
                ),
            )?;
            Some((igw, attachment))
        }
        None => None,
    };

    // NAT gateways live in the first public tier, one per zone.
    let nat_gateways: Vec<String> = match (&first_public, needs_nat) {
        (Some(tier), true) => (0..zones)
            .map(|zone| logical_id(&format!("VPC/{}Subnet{}/NATGateway", tier, zone + 1)))
            .collect(),
        _ => Vec::new(),
    };

    let mut subnets = Vec::with_capacity(planned.len());
    for subnet in &planned {
        let name = format!("{}Subnet{}", subnet.tier, subnet.zone + 1);
        let path = format!("VPC/{}", name);

        let subnet_resource = stack.add_resource(
            &format!("{}/Subnet", path),
            Resource::new(
                "AWS::EC2::Subnet",
                json!({
                    "VpcId": template::reference(&vpc),
                    "AvailabilityZone": template::availability_zone(subnet.zone),
                    "CidrBlock": subnet.block.to_string(),
                    "MapPublicIpOnLaunch": subnet.kind == SubnetKind::Public,
                    "Tags": template::tags(&[
                        ("Name", json!(format!("{}/{}", stack_id, path))),
                        ("subnet-name", json!(subnet.tier)),
                        ("subnet-type", json!(subnet.kind.label())),
                    ]),
                }),
            ),
        )?;
        let route_table = stack.add_resource(
            &format!("{}/RouteTable", path),
            Resource::new(
                "AWS::EC2::RouteTable",
                json!({
                    "VpcId": template::reference(&vpc),
                    "Tags": template::tags(&[("Name", json!(format!("{}/{}", stack_id, path)))]),
                }),
            ),
        )?;
        let association = stack.add_resource(
            &format!("{}/RouteTableAssociation", path),
            Resource::new(
                "AWS::EC2::SubnetRouteTableAssociation",
                json!({
                    "RouteTableId": template::reference(&route_table),
                    "SubnetId": template::reference(&subnet_resource),
                }),
            ),
        )?;

        match subnet.kind {
            SubnetKind::Public => {
                if let Some((igw, attachment)) = &gateway {
                    let route = stack.add_resource(
                        &format!("{}/DefaultRoute", path),
                        Resource::new(
                            "AWS::EC2::Route",
                            json!({
                                "RouteTableId": template::reference(&route_table),
                                "DestinationCidrBlock": "0.0.0.0/0",
                                "GatewayId": template::reference(igw),
                            }),
                        )
                        .depends_on(attachment),
                    )?;

                    if needs_nat && first_public.as_deref() == Some(subnet.tier.as_str()) {
                        let eip = stack.add_resource(
                            &format!("{}/EIP", path),
                            Resource::new(
                                "AWS::EC2::EIP",
                                json!({
                                    "Domain": "vpc",
                                    "Tags": template::tags(&[("Name", json!(format!("{}/{}", stack_id, path)))]),
                                }),
                            ),
                        )?;
                        stack.add_resource(
                            &format!("{}/NATGateway", path),
                            Resource::new(
                                "AWS::EC2::NatGateway",
                                json!({
                                    "SubnetId": template::reference(&subnet_resource),
                                    "AllocationId": template::get_att(&eip, "AllocationId"),
                                    "Tags": template::tags(&[("Name", json!(format!("{}/{}", stack_id, path)))]),
                                }),
                            )
                            .depends_on(&route)
                            .depends_on(&association),
                        )?;
                    }
                }
            }
            SubnetKind::PrivateWithEgress => {
                stack.add_resource(
                    &format!("{}/DefaultRoute", path),
                    Resource::new(
                        "AWS::EC2::Route",
                        json!({
                            "RouteTableId": template::reference(&route_table),
                            "DestinationCidrBlock": "0.0.0.0/0",
                            "NatGatewayId": template::reference(&nat_gateways[subnet.zone]),
                        }),
                    ),
                )?;
            }
            SubnetKind::PrivateIsolated => {}
        }

        let subnet_id = stack.export(&name, template::reference(&subnet_resource))?;
        subnets.push(Subnet {
            tier: subnet.tier.clone(),
            kind: subnet.kind,
            zone: subnet.zone,
            cidr: subnet.block.to_string(),
            subnet_id,
        });
    }

    let vpc_id = stack.export("VpcId", template::reference(&vpc))?;

    info!(
        stack = stack_id,
        cidr = %spec.cidr,
        zones,
        subnets = subnets.len(),
        nat_gateways = nat_gateways.len(),
        "Declared network"
    );

    return Ok(Network {
        stack_id: stack_id.to_string(),
        vpc_id,
        cidr: spec.cidr.clone(),
        zones,
        subnets,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Environment;
    use crate::template::Template;

    fn synth(spec: &NetworkSpec) -> (Network, Template) {
        let mut app = App::new(Environment::default());
        let network = declare(&mut app, "VpcStack", spec).unwrap();
        let template = app.stack("VpcStack").unwrap().template().clone();
        return (network, template);
    }

    #[test]
    fn declares_three_tiers_across_two_zones() {
        let (network, template) = synth(&NetworkSpec::default());

        assert_eq!(
            true,
            template.has_resource_properties("AWS::EC2::VPC", &json!({ "CidrBlock": "10.0.0.0/21" }))
        );
        // 3 Subnets, 2 AZs
        assert_eq!(3 * 2, template.resource_count("AWS::EC2::Subnet"));
        // One for each AZ
        assert_eq!(2, template.resource_count("AWS::EC2::NatGateway"));
        // One in total
        assert_eq!(1, template.resource_count("AWS::EC2::InternetGateway"));

        assert_eq!(2, network.subnets(SubnetKind::PrivateIsolated).len());
        assert_eq!("VpcStack:VpcId", network.vpc_id.name);
    }

    #[test]
    fn partitions_the_block_without_overlap() {
        let (network, _) = synth(&NetworkSpec::default());
        let cidrs: Vec<&str> = network.subnets.iter().map(|subnet| subnet.cidr.as_str()).collect();

        assert_eq!(
            vec![
                "10.0.0.0/24",
                "10.0.1.0/24",
                "10.0.2.0/24",
                "10.0.3.0/24",
                "10.0.4.0/27",
                "10.0.4.32/27",
            ],
            cidrs
        );
    }

    #[test]
    fn private_subnets_route_through_the_nat_of_their_zone() {
        let (_, template) = synth(&NetworkSpec::default());

        assert_eq!(
            true,
            template.has_resource_properties(
                "AWS::EC2::Route",
                &json!({
                    "RouteTableId": { "Ref": "VPCPrivateSubnet2RouteTable" },
                    "NatGatewayId": { "Ref": "VPCPublicSubnet2NATGateway" },
                })
            )
        );
        assert_eq!(
            false,
            template
                .resources
                .contains_key("VPCDataSubnet1DefaultRoute")
        );
    }

    #[test]
    fn scales_with_zone_count() {
        let spec = NetworkSpec {
            max_azs: 3,
            ..NetworkSpec::default()
        };
        let (_, template) = synth(&spec);

        assert_eq!(3 * 3, template.resource_count("AWS::EC2::Subnet"));
        assert_eq!(3, template.resource_count("AWS::EC2::NatGateway"));
        assert_eq!(1, template.resource_count("AWS::EC2::InternetGateway"));
    }

    #[test]
    fn isolated_only_networks_have_no_gateways() {
        let spec = NetworkSpec {
            subnets: vec![SubnetTier {
                name: String::from("Data"),
                kind: SubnetKind::PrivateIsolated,
                cidr_mask: 24,
            }],
            ..NetworkSpec::default()
        };
        let (_, template) = synth(&spec);

        assert_eq!(2, template.resource_count("AWS::EC2::Subnet"));
        assert_eq!(0, template.resource_count("AWS::EC2::NatGateway"));
        assert_eq!(0, template.resource_count("AWS::EC2::InternetGateway"));
    }

    #[test]
    fn rejects_exhausted_address_space() {
        let spec = NetworkSpec {
            max_azs: 6,
            ..NetworkSpec::default()
        };
        let mut app = App::new(Environment::default());

        match declare(&mut app, "VpcStack", &spec) {
            Err(Error::InvalidNetwork(_)) => {}
            other => panic!("Expected `InvalidNetwork` error, got {:?}", other),
        }
        assert_eq!(true, app.stack("VpcStack").is_none());
    }

    #[test]
    fn rejects_misaligned_blocks_and_missing_public_tier() {
        let misaligned = NetworkSpec {
            cidr: String::from("10.0.0.1/21"),
            ..NetworkSpec::default()
        };
        let no_public = NetworkSpec {
            subnets: vec![SubnetTier {
                name: String::from("Private"),
                kind: SubnetKind::PrivateWithEgress,
                cidr_mask: 24,
            }],
            ..NetworkSpec::default()
        };

        for spec in [misaligned, no_public] {
            let mut app = App::new(Environment::default());
            assert_eq!(true, declare(&mut app, "VpcStack", &spec).is_err());
        }
    }

    #[test]
    fn validates_the_spec_shape() {
        assert_eq!(true, NetworkSpec::default().validate().is_ok());

        let duplicate_tiers = NetworkSpec {
            subnets: vec![
                SubnetTier {
                    name: String::from("Data"),
                    kind: SubnetKind::PrivateIsolated,
                    cidr_mask: 24,
                },
                SubnetTier {
                    name: String::from("Data"),
                    kind: SubnetKind::Public,
                    cidr_mask: 24,
                },
            ],
            ..NetworkSpec::default()
        };
        assert_eq!(true, duplicate_tiers.validate().is_err());

        let same_logical_id = NetworkSpec {
            subnets: vec![
                SubnetTier {
                    name: String::from("data"),
                    kind: SubnetKind::PrivateIsolated,
                    cidr_mask: 27,
                },
                SubnetTier {
                    name: String::from("Data"),
                    kind: SubnetKind::PrivateIsolated,
                    cidr_mask: 27,
                },
            ],
            ..NetworkSpec::default()
        };
        assert_eq!(true, same_logical_id.validate().is_err());
        let mut app = App::new(Environment::default());
        match declare(&mut app, "VpcStack", &same_logical_id) {
            Err(Error::InvalidNetwork(_)) => {}
            other => panic!("Expected `InvalidNetwork` error, got {:?}", other),
        }

        let single_zone = NetworkSpec {
            max_azs: 1,
            ..NetworkSpec::default()
        };
        assert_eq!(true, single_zone.validate().is_err());

        let too_many_zones = NetworkSpec {
            max_azs: 7,
            ..NetworkSpec::default()
        };
        assert_eq!(true, too_many_zones.validate().is_err());
    }

    #[test]
    fn spread_subnets_need_two_zones() {
        let (network, _) = synth(&NetworkSpec::default());
        assert_eq!(
            2,
            network
                .spread_subnets(SubnetKind::Public, "The load balancer")
                .unwrap()
                .len()
        );

        let (single_zone, _) = synth(&NetworkSpec {
            max_azs: 1,
            ..NetworkSpec::default()
        });
        match single_zone.spread_subnets(SubnetKind::PrivateIsolated, "The database") {
            Err(Error::InvalidPlacement(_)) => {}
            other => panic!("Expected `InvalidPlacement` error, got {:?}", other),
        }
    }
}
