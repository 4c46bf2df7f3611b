//! AWS EC2 provider implementation

use crate::error::{Phase, classify, has_code};
use async_trait::async_trait;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::primitives::Blob;
use aws_sdk_ec2::types::{
    AttributeBooleanValue, Filter, InstanceMarketOptionsRequest, InstanceType, IpPermission,
    IpRange, MarketType, ResourceType, SpotMarketOptions, Tag, TagSpecification,
};
use clusterflow_cloud::{
    Attributes, AuthStatus, CloudError, CloudProvider, CreatedResource, IngressRule, InstanceInfo,
    InstanceSpec, InstanceState, ResourceContext, ResourceKind, ResourceRole, ResourceSpec,
    Result,
};

const CLUSTER_TAG: &str = "clusterflow:cluster";
const ROLE_TAG: &str = "clusterflow:role";
const TOKEN_TAG: &str = "clusterflow:client-token";

/// EC2 provider
pub struct Ec2Provider {
    client: Client,
    region: String,
}

impl Ec2Provider {
    /// Build a client for `region` from the default credential chain
    pub async fn new(region: impl Into<String>) -> Self {
        let region = region.into();
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .load()
            .await;

        Self {
            client: Client::new(&config),
            region,
        }
    }

    pub fn from_client(client: Client, region: impl Into<String>) -> Self {
        Self {
            client,
            region: region.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    async fn create_vpc(&self, ctx: &ResourceContext<'_>, cidr_block: &str) -> Result<String> {
        let output = self
            .client
            .create_vpc()
            .cidr_block(cidr_block)
            .tag_specifications(tags(ResourceType::Vpc, ctx, "vpc"))
            .send()
            .await
            .map_err(|e| classify("CreateVpc", Phase::Mutate, e))?;

        required_id("CreateVpc", output.vpc().and_then(|v| v.vpc_id()))
    }

    async fn create_subnet(
        &self,
        ctx: &ResourceContext<'_>,
        cidr_block: &str,
        availability_zone: &str,
    ) -> Result<String> {
        let output = self
            .client
            .create_subnet()
            .vpc_id(dependency(ctx, ResourceRole::Vpc)?)
            .cidr_block(cidr_block)
            .availability_zone(availability_zone)
            .tag_specifications(tags(ResourceType::Subnet, ctx, "subnet"))
            .send()
            .await
            .map_err(|e| classify("CreateSubnet", Phase::Mutate, e))?;

        required_id("CreateSubnet", output.subnet().and_then(|s| s.subnet_id()))
    }

    async fn create_internet_gateway(&self, ctx: &ResourceContext<'_>) -> Result<String> {
        let output = self
            .client
            .create_internet_gateway()
            .tag_specifications(tags(ResourceType::InternetGateway, ctx, "igw"))
            .send()
            .await
            .map_err(|e| classify("CreateInternetGateway", Phase::Mutate, e))?;

        required_id(
            "CreateInternetGateway",
            output
                .internet_gateway()
                .and_then(|g| g.internet_gateway_id()),
        )
    }

    async fn create_route_table(&self, ctx: &ResourceContext<'_>) -> Result<String> {
        let output = self
            .client
            .create_route_table()
            .vpc_id(dependency(ctx, ResourceRole::Vpc)?)
            .tag_specifications(tags(ResourceType::RouteTable, ctx, "rtb"))
            .send()
            .await
            .map_err(|e| classify("CreateRouteTable", Phase::Mutate, e))?;

        required_id(
            "CreateRouteTable",
            output.route_table().and_then(|r| r.route_table_id()),
        )
    }

    async fn create_security_group(
        &self,
        ctx: &ResourceContext<'_>,
        description: &str,
    ) -> Result<String> {
        let group_name = ctx.resource_name("nodes");
        let vpc_id = dependency(ctx, ResourceRole::Vpc)?;
        let result = self
            .client
            .create_security_group()
            .group_name(&group_name)
            .description(description)
            .vpc_id(vpc_id)
            .tag_specifications(tags(ResourceType::SecurityGroup, ctx, "nodes"))
            .send()
            .await;

        match result {
            Ok(output) => required_id("CreateSecurityGroup", output.group_id()),
            // Group names are unique per VPC, and this VPC is ours
            Err(e) if has_code(&e, &["InvalidGroup.Duplicate"]) => {
                tracing::info!("Security group {} already exists in {}", group_name, vpc_id);
                let output = self
                    .client
                    .describe_security_groups()
                    .filters(Filter::builder().name("group-name").values(&group_name).build())
                    .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
                    .send()
                    .await
                    .map_err(|e| classify("DescribeSecurityGroups", Phase::Mutate, e))?;
                required_id(
                    "DescribeSecurityGroups",
                    output.security_groups().first().and_then(|g| g.group_id()),
                )
            }
            Err(e) => Err(classify("CreateSecurityGroup", Phase::Mutate, e)),
        }
    }

    /// Import the local public key, adopting a key pair that already
    /// exists under the same name
    async fn import_key_pair(
        &self,
        key_name: &str,
        public_key_path: &std::path::Path,
    ) -> Result<CreatedResource> {
        let material = tokio::fs::read(public_key_path).await.map_err(|e| {
            CloudError::InvalidConfig(format!(
                "cannot read public key {}: {}",
                public_key_path.display(),
                e
            ))
        })?;

        let result = self
            .client
            .import_key_pair()
            .key_name(key_name)
            .public_key_material(Blob::new(material))
            .send()
            .await;

        match result {
            Ok(output) => {
                let id = required_id("ImportKeyPair", output.key_pair_id())?;
                Ok(CreatedResource::new(id)
                    .with_attribute("key_name", serde_json::json!(key_name)))
            }
            Err(e) if has_code(&e, &["InvalidKeyPair.Duplicate"]) => {
                tracing::info!("Key pair {} already exists, using it as is", key_name);
                let existing = self
                    .client
                    .describe_key_pairs()
                    .key_names(key_name)
                    .send()
                    .await
                    .map_err(|e| classify("DescribeKeyPairs", Phase::Mutate, e))?;
                let id = required_id(
                    "DescribeKeyPairs",
                    existing.key_pairs().first().and_then(|k| k.key_pair_id()),
                )?;
                Ok(CreatedResource::adopted(id)
                    .with_attribute("key_name", serde_json::json!(key_name)))
            }
            Err(e) => Err(classify("ImportKeyPair", Phase::Mutate, e)),
        }
    }

    async fn run_instance(&self, ctx: &ResourceContext<'_>, spec: &InstanceSpec) -> Result<String> {
        let mut request = self
            .client
            .run_instances()
            .image_id(image_reference(&spec.image))
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .client_token(ctx.client_token)
            .subnet_id(dependency(ctx, ResourceRole::Subnet)?)
            .security_group_ids(dependency(ctx, ResourceRole::SecurityGroup)?)
            .tag_specifications(tags(ResourceType::Instance, ctx, &spec.name));

        request = request.key_name(self.key_name(ctx).await?);

        if let Some(max_price) = &spec.spot_max_price {
            request = request.instance_market_options(
                InstanceMarketOptionsRequest::builder()
                    .market_type(MarketType::Spot)
                    .spot_options(SpotMarketOptions::builder().max_price(max_price).build())
                    .build(),
            );
        }

        let output = request
            .send()
            .await
            .map_err(|e| classify("RunInstances", Phase::Mutate, e))?;

        required_id(
            "RunInstances",
            output.instances().first().and_then(|i| i.instance_id()),
        )
    }

    /// A resource an earlier attempt of this create already made, found by
    /// its client token tag. Covers calls whose response never arrived.
    async fn find_created(&self, ctx: &ResourceContext<'_>) -> Result<Option<String>> {
        let by_token = Filter::builder()
            .name(format!("tag:{}", TOKEN_TAG))
            .values(ctx.client_token)
            .build();

        let id = match ctx.role.kind() {
            ResourceKind::Vpc => self
                .client
                .describe_vpcs()
                .filters(by_token)
                .send()
                .await
                .map_err(|e| classify("DescribeVpcs", Phase::Lookup, e))?
                .vpcs()
                .first()
                .and_then(|v| v.vpc_id())
                .map(str::to_string),
            ResourceKind::Subnet => self
                .client
                .describe_subnets()
                .filters(by_token)
                .send()
                .await
                .map_err(|e| classify("DescribeSubnets", Phase::Lookup, e))?
                .subnets()
                .first()
                .and_then(|s| s.subnet_id())
                .map(str::to_string),
            ResourceKind::InternetGateway => self
                .client
                .describe_internet_gateways()
                .filters(by_token)
                .send()
                .await
                .map_err(|e| classify("DescribeInternetGateways", Phase::Lookup, e))?
                .internet_gateways()
                .first()
                .and_then(|g| g.internet_gateway_id())
                .map(str::to_string),
            ResourceKind::RouteTable => self
                .client
                .describe_route_tables()
                .filters(by_token)
                .send()
                .await
                .map_err(|e| classify("DescribeRouteTables", Phase::Lookup, e))?
                .route_tables()
                .first()
                .and_then(|r| r.route_table_id())
                .map(str::to_string),
            ResourceKind::SecurityGroup => self
                .client
                .describe_security_groups()
                .filters(by_token)
                .send()
                .await
                .map_err(|e| classify("DescribeSecurityGroups", Phase::Lookup, e))?
                .security_groups()
                .first()
                .and_then(|g| g.group_id())
                .map(str::to_string),
            ResourceKind::Instance => self
                .client
                .describe_instances()
                .filters(by_token)
                .filters(
                    Filter::builder()
                        .name("instance-state-name")
                        .values("pending")
                        .values("running")
                        .build(),
                )
                .send()
                .await
                .map_err(|e| classify("DescribeInstances", Phase::Lookup, e))?
                .reservations()
                .iter()
                .flat_map(|r| r.instances())
                .find_map(|i| i.instance_id())
                .map(str::to_string),
            // Imported by name; a duplicate is adopted
            ResourceKind::KeyPair => None,
        };
        Ok(id)
    }

    /// Key pair name of the recorded key pair id
    async fn key_name(&self, ctx: &ResourceContext<'_>) -> Result<String> {
        let key_pair_id = dependency(ctx, ResourceRole::KeyPair)?;
        let output = self
            .client
            .describe_key_pairs()
            .key_pair_ids(key_pair_id)
            .send()
            .await
            .map_err(|e| classify("DescribeKeyPairs", Phase::Mutate, e))?;

        required_id(
            "DescribeKeyPairs",
            output.key_pairs().first().and_then(|k| k.key_name()),
        )
    }

    async fn configure_vpc(&self, id: &str) -> Result<Attributes> {
        self.client
            .modify_vpc_attribute()
            .vpc_id(id)
            .enable_dns_hostnames(AttributeBooleanValue::builder().value(true).build())
            .send()
            .await
            .map_err(|e| classify("ModifyVpcAttribute", Phase::Mutate, e))?;
        Ok(Attributes::new())
    }

    async fn configure_subnet(&self, id: &str) -> Result<Attributes> {
        self.client
            .modify_subnet_attribute()
            .subnet_id(id)
            .map_public_ip_on_launch(AttributeBooleanValue::builder().value(true).build())
            .send()
            .await
            .map_err(|e| classify("ModifySubnetAttribute", Phase::Mutate, e))?;
        Ok(Attributes::new())
    }

    async fn attach_internet_gateway(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
    ) -> Result<Attributes> {
        let vpc_id = dependency(ctx, ResourceRole::Vpc)?;
        let result = self
            .client
            .attach_internet_gateway()
            .internet_gateway_id(id)
            .vpc_id(vpc_id)
            .send()
            .await;

        match result {
            Ok(_) => {}
            Err(e) if has_code(&e, &["Resource.AlreadyAssociated"]) => {
                tracing::debug!("Internet gateway {} already attached", id);
            }
            Err(e) => return Err(classify("AttachInternetGateway", Phase::Mutate, e)),
        }

        Ok(Attributes::from([(
            "vpc_id".to_string(),
            serde_json::json!(vpc_id),
        )]))
    }

    /// Default route via the gateway, then associate with the subnet
    async fn configure_route_table(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        destination: &str,
    ) -> Result<Attributes> {
        let gateway_id = dependency(ctx, ResourceRole::InternetGateway)?;
        let subnet_id = dependency(ctx, ResourceRole::Subnet)?;

        let route = self
            .client
            .create_route()
            .route_table_id(id)
            .destination_cidr_block(destination)
            .gateway_id(gateway_id)
            .send()
            .await;
        match route {
            Ok(_) => {}
            Err(e) if has_code(&e, &["RouteAlreadyExists"]) => {
                tracing::debug!("Route {} already present in {}", destination, id);
            }
            Err(e) => return Err(classify("CreateRoute", Phase::Mutate, e)),
        }

        let tables = self
            .client
            .describe_route_tables()
            .route_table_ids(id)
            .send()
            .await
            .map_err(|e| classify("DescribeRouteTables", Phase::Mutate, e))?;
        let existing = tables
            .route_tables()
            .iter()
            .flat_map(|t| t.associations())
            .find(|a| a.subnet_id() == Some(subnet_id))
            .and_then(|a| a.route_table_association_id())
            .map(str::to_string);

        let association_id = match existing {
            Some(association_id) => association_id,
            None => {
                let output = self
                    .client
                    .associate_route_table()
                    .route_table_id(id)
                    .subnet_id(subnet_id)
                    .send()
                    .await
                    .map_err(|e| classify("AssociateRouteTable", Phase::Mutate, e))?;
                required_id("AssociateRouteTable", output.association_id())?
            }
        };

        Ok(Attributes::from([(
            "association_id".to_string(),
            serde_json::json!(association_id),
        )]))
    }

    async fn authorize_ingress(&self, id: &str, rules: &[IngressRule]) -> Result<Attributes> {
        for rule in rules {
            let permission = IpPermission::builder()
                .ip_protocol(&rule.protocol)
                .from_port(rule.from_port)
                .to_port(rule.to_port)
                .ip_ranges(
                    IpRange::builder()
                        .cidr_ip(&rule.cidr)
                        .description(&rule.description)
                        .build(),
                )
                .build();

            let result = self
                .client
                .authorize_security_group_ingress()
                .group_id(id)
                .ip_permissions(permission)
                .send()
                .await;

            match result {
                Ok(_) => tracing::debug!("Authorized {} from {}", rule.description, rule.cidr),
                Err(e) if has_code(&e, &["InvalidPermission.Duplicate"]) => {
                    tracing::debug!("Rule {} already authorized", rule.description);
                }
                Err(e) => {
                    return Err(classify("AuthorizeSecurityGroupIngress", Phase::Mutate, e));
                }
            }
        }
        Ok(Attributes::new())
    }

    async fn delete_route_table(&self, id: &str, attributes: &Attributes) -> Result<()> {
        if let Some(association_id) = attributes.get("association_id").and_then(|v| v.as_str()) {
            let result = self
                .client
                .disassociate_route_table()
                .association_id(association_id)
                .send()
                .await;
            match result {
                Ok(_) => {}
                Err(e) if has_code(&e, &["InvalidAssociationID.NotFound"]) => {}
                Err(e) => return Err(classify("DisassociateRouteTable", Phase::Lookup, e)),
            }
        }

        self.client
            .delete_route_table()
            .route_table_id(id)
            .send()
            .await
            .map_err(|e| classify("DeleteRouteTable", Phase::Lookup, e))?;
        Ok(())
    }

    async fn delete_internet_gateway(&self, id: &str, attributes: &Attributes) -> Result<()> {
        if let Some(vpc_id) = attributes.get("vpc_id").and_then(|v| v.as_str()) {
            let result = self
                .client
                .detach_internet_gateway()
                .internet_gateway_id(id)
                .vpc_id(vpc_id)
                .send()
                .await;
            match result {
                Ok(_) => {}
                Err(e) if has_code(&e, &["Gateway.NotAttached"]) => {}
                Err(e) => return Err(classify("DetachInternetGateway", Phase::Lookup, e)),
            }
        }

        self.client
            .delete_internet_gateway()
            .internet_gateway_id(id)
            .send()
            .await
            .map_err(|e| classify("DeleteInternetGateway", Phase::Lookup, e))?;
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for Ec2Provider {
    fn name(&self) -> &str {
        "aws-ec2"
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        match self.client.describe_availability_zones().send().await {
            Ok(output) => Ok(AuthStatus::ok(format!(
                "{} ({} availability zones)",
                self.region,
                output.availability_zones().len()
            ))),
            Err(e) => match classify("DescribeAvailabilityZones", Phase::Lookup, e) {
                err @ CloudError::ProviderUnreachable(_) => Err(err),
                other => Ok(AuthStatus::failed(other.to_string())),
            },
        }
    }

    async fn create_resource(
        &self,
        ctx: &ResourceContext<'_>,
        spec: &ResourceSpec,
    ) -> Result<CreatedResource> {
        if let Some(id) = self.find_created(ctx).await? {
            tracing::info!("{} was already created as {} by an earlier attempt", ctx.role, id);
            let mut created = CreatedResource::new(id);
            if let ResourceSpec::Instance(instance) = spec {
                created = created
                    .with_attribute("instance_type", serde_json::json!(instance.instance_type));
            }
            return Ok(created);
        }

        let created = match spec {
            ResourceSpec::Vpc { cidr_block } => {
                CreatedResource::new(self.create_vpc(ctx, cidr_block).await?)
            }
            ResourceSpec::Subnet {
                cidr_block,
                availability_zone,
            } => CreatedResource::new(
                self.create_subnet(ctx, cidr_block, availability_zone)
                    .await?,
            ),
            ResourceSpec::InternetGateway => {
                CreatedResource::new(self.create_internet_gateway(ctx).await?)
            }
            ResourceSpec::RouteTable { .. } => {
                CreatedResource::new(self.create_route_table(ctx).await?)
            }
            ResourceSpec::SecurityGroup { description, .. } => {
                CreatedResource::new(self.create_security_group(ctx, description).await?)
            }
            ResourceSpec::KeyPair {
                key_name,
                public_key_path,
            } => self.import_key_pair(key_name, public_key_path).await?,
            ResourceSpec::Instance(instance) => {
                CreatedResource::new(self.run_instance(ctx, instance).await?)
                    .with_attribute("instance_type", serde_json::json!(instance.instance_type))
            }
        };

        tracing::debug!("EC2 assigned {} to {}", created.id, ctx.role);
        Ok(created)
    }

    async fn configure_resource(
        &self,
        ctx: &ResourceContext<'_>,
        spec: &ResourceSpec,
        id: &str,
    ) -> Result<Attributes> {
        match spec {
            ResourceSpec::Vpc { .. } => self.configure_vpc(id).await,
            ResourceSpec::Subnet { .. } => self.configure_subnet(id).await,
            ResourceSpec::InternetGateway => self.attach_internet_gateway(ctx, id).await,
            ResourceSpec::RouteTable { destination } => {
                self.configure_route_table(ctx, id, destination).await
            }
            ResourceSpec::SecurityGroup { ingress, .. } => self.authorize_ingress(id, ingress).await,
            ResourceSpec::KeyPair { .. } | ResourceSpec::Instance(_) => Ok(Attributes::new()),
        }
    }

    async fn resource_exists(&self, kind: ResourceKind, id: &str) -> Result<bool> {
        let result = match kind {
            ResourceKind::Vpc => self
                .client
                .describe_vpcs()
                .vpc_ids(id)
                .send()
                .await
                .map(|o| !o.vpcs().is_empty())
                .map_err(|e| classify("DescribeVpcs", Phase::Lookup, e)),
            ResourceKind::Subnet => self
                .client
                .describe_subnets()
                .subnet_ids(id)
                .send()
                .await
                .map(|o| !o.subnets().is_empty())
                .map_err(|e| classify("DescribeSubnets", Phase::Lookup, e)),
            ResourceKind::InternetGateway => self
                .client
                .describe_internet_gateways()
                .internet_gateway_ids(id)
                .send()
                .await
                .map(|o| !o.internet_gateways().is_empty())
                .map_err(|e| classify("DescribeInternetGateways", Phase::Lookup, e)),
            ResourceKind::RouteTable => self
                .client
                .describe_route_tables()
                .route_table_ids(id)
                .send()
                .await
                .map(|o| !o.route_tables().is_empty())
                .map_err(|e| classify("DescribeRouteTables", Phase::Lookup, e)),
            ResourceKind::SecurityGroup => self
                .client
                .describe_security_groups()
                .group_ids(id)
                .send()
                .await
                .map(|o| !o.security_groups().is_empty())
                .map_err(|e| classify("DescribeSecurityGroups", Phase::Lookup, e)),
            ResourceKind::KeyPair => self
                .client
                .describe_key_pairs()
                .key_pair_ids(id)
                .send()
                .await
                .map(|o| !o.key_pairs().is_empty())
                .map_err(|e| classify("DescribeKeyPairs", Phase::Lookup, e)),
            ResourceKind::Instance => self
                .describe_instance(id)
                .await
                .map(|info| info.is_some_and(|i| !i.state.is_gone())),
        };

        match result {
            Err(CloudError::ResourceNotFound(_)) => Ok(false),
            other => other,
        }
    }

    async fn describe_instance(&self, id: &str) -> Result<Option<InstanceInfo>> {
        let output = match self
            .client
            .describe_instances()
            .instance_ids(id)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if has_code(&e, &["InvalidInstanceID.NotFound"]) => return Ok(None),
            Err(e) => return Err(classify("DescribeInstances", Phase::Lookup, e)),
        };

        let info = output
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find(|i| i.instance_id() == Some(id))
            .map(|instance| InstanceInfo {
                state: instance
                    .state()
                    .and_then(|s| s.name())
                    .map(|name| InstanceState::from_provider(name.as_str()))
                    .unwrap_or(InstanceState::Unknown),
                public_ip: instance.public_ip_address().map(str::to_string),
                private_ip: instance.private_ip_address().map(str::to_string),
            });

        Ok(info)
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        attributes: &Attributes,
    ) -> Result<()> {
        match kind {
            ResourceKind::Instance => {
                self.client
                    .terminate_instances()
                    .instance_ids(id)
                    .send()
                    .await
                    .map_err(|e| classify("TerminateInstances", Phase::Lookup, e))?;
            }
            ResourceKind::KeyPair => {
                self.client
                    .delete_key_pair()
                    .key_pair_id(id)
                    .send()
                    .await
                    .map_err(|e| classify("DeleteKeyPair", Phase::Lookup, e))?;
            }
            ResourceKind::SecurityGroup => {
                self.client
                    .delete_security_group()
                    .group_id(id)
                    .send()
                    .await
                    .map_err(|e| classify("DeleteSecurityGroup", Phase::Lookup, e))?;
            }
            ResourceKind::RouteTable => self.delete_route_table(id, attributes).await?,
            ResourceKind::InternetGateway => self.delete_internet_gateway(id, attributes).await?,
            ResourceKind::Subnet => {
                self.client
                    .delete_subnet()
                    .subnet_id(id)
                    .send()
                    .await
                    .map_err(|e| classify("DeleteSubnet", Phase::Lookup, e))?;
            }
            ResourceKind::Vpc => {
                self.client
                    .delete_vpc()
                    .vpc_id(id)
                    .send()
                    .await
                    .map_err(|e| classify("DeleteVpc", Phase::Lookup, e))?;
            }
        }

        tracing::debug!("EC2 delete issued for {} {}", kind, id);
        Ok(())
    }
}

/// `Name`, cluster, role and client token tags for a new resource
fn tags(resource_type: ResourceType, ctx: &ResourceContext<'_>, suffix: &str) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource_type)
        .tags(
            Tag::builder()
                .key("Name")
                .value(ctx.resource_name(suffix))
                .build(),
        )
        .tags(Tag::builder().key(CLUSTER_TAG).value(ctx.cluster).build())
        .tags(Tag::builder().key(ROLE_TAG).value(ctx.role.key()).build())
        .tags(Tag::builder().key(TOKEN_TAG).value(ctx.client_token).build())
        .build()
}

/// EC2 resolves SSM parameters given as `resolve:ssm:<name>` image ids
fn image_reference(image: &str) -> String {
    if image.starts_with("ami-") || image.starts_with("resolve:ssm:") {
        image.to_string()
    } else {
        format!("resolve:ssm:{}", image)
    }
}

fn dependency<'a>(ctx: &'a ResourceContext<'_>, role: ResourceRole) -> Result<&'a str> {
    ctx.dependency(role).ok_or_else(|| {
        CloudError::StateError(format!("{} requires {} which is not recorded", ctx.role, role))
    })
}

fn required_id(operation: &str, id: Option<&str>) -> Result<String> {
    id.map(str::to_string).ok_or_else(|| {
        CloudError::fatal(operation, "MissingIdentifier", "response carried no identifier")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_image_reference() {
        assert_eq!(
            image_reference("/aws/service/canonical/ubuntu/server/24.04/stable/current/amd64/hvm/ebs-gp3/ami-id"),
            "resolve:ssm:/aws/service/canonical/ubuntu/server/24.04/stable/current/amd64/hvm/ebs-gp3/ami-id"
        );
        assert_eq!(image_reference("ami-0123456789abcdef0"), "ami-0123456789abcdef0");
        assert_eq!(image_reference("resolve:ssm:/x"), "resolve:ssm:/x");
    }

    #[test]
    fn test_tags_carry_cluster_and_role() {
        let deps = BTreeMap::new();
        let ctx = ResourceContext {
            cluster: "alpha",
            role: ResourceRole::WorkerInstance(1),
            client_token: "6f1c2a4e-0d7b-5c39-9a8e-3b2d1f0e4c5a",
            dependencies: &deps,
        };

        let spec = tags(ResourceType::Instance, &ctx, "cpu-worker-1");
        let tags: Vec<(&str, &str)> = spec
            .tags()
            .iter()
            .map(|t| (t.key().unwrap_or_default(), t.value().unwrap_or_default()))
            .collect();

        assert!(tags.contains(&("Name", "alpha-cpu-worker-1")));
        assert!(tags.contains(&(CLUSTER_TAG, "alpha")));
        assert!(tags.contains(&(ROLE_TAG, "worker_instance[1]")));
        assert!(tags.contains(&(TOKEN_TAG, "6f1c2a4e-0d7b-5c39-9a8e-3b2d1f0e4c5a")));
    }

    #[test]
    fn test_missing_dependency_is_reported() {
        let deps = BTreeMap::new();
        let ctx = ResourceContext {
            cluster: "alpha",
            role: ResourceRole::Subnet,
            client_token: "token",
            dependencies: &deps,
        };
        let err = dependency(&ctx, ResourceRole::Vpc).unwrap_err();
        assert!(err.to_string().contains("subnet requires vpc"));
    }
}
