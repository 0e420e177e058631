use aws_config::meta::region::RegionProviderChain;
use aws_sdk_cloudformation::model::Output;
use aws_types::region::Region;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Stack not found: {0}")]
    NotFoundError(String),
}

/// Output key to value; outputs missing either are skipped.
pub fn collect_outputs(outputs: &[Output]) -> BTreeMap<String, String> {
    let init: BTreeMap<String, String> = BTreeMap::new();
    return outputs.iter().fold(init, |mut acc, output| {
        if let (Some(key), Some(value)) = (output.output_key(), output.output_value()) {
            acc.insert(key.to_string(), value.to_string());
        }
        return acc;
    });
}

/// Read-only view of deployed stacks in one region.
pub struct Stacks {
    client: aws_sdk_cloudformation::Client,
}

impl Stacks {
    pub async fn new(region: Option<&str>) -> Self {
        let region_provider = RegionProviderChain::first_try(region.map(|region| Region::new(region.to_string())))
            .or_default_provider();

        let sdk_config = aws_config::from_env().region(region_provider).load().await;
        let client = aws_sdk_cloudformation::Client::new(&sdk_config);

        return Self { client };
    }

    pub async fn get_outputs(&self, stack_name: &str) -> Result<BTreeMap<String, String>, Error> {
        let result = self
            .client
            .describe_stacks()
            .stack_name(stack_name)
            .send()
            .await;

        let result = match result {
            Ok(data) => data,
            Err(err) => return Err(Error::ServiceError(err.to_string())),
        };

        let stacks = result.stacks().unwrap_or_else(|| &[]);
        let stack = match stacks.first() {
            Some(stack) => stack,
            None => return Err(Error::NotFoundError(stack_name.to_string())),
        };

        let outputs = collect_outputs(stack.outputs().unwrap_or_else(|| &[]));

        debug!(stack = stack_name, outputs = outputs.len(), "Fetched stack outputs");
        return Ok(outputs);
    }

    /// Fetches all stacks concurrently; the first failure wins.
    pub async fn get_all_outputs(
        &self,
        stack_names: &[String],
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>, Error> {
        let fetched = try_join_all(stack_names.iter().map(|stack_name| async move {
            let outputs = self.get_outputs(stack_name).await?;
            return Ok::<_, Error>((stack_name.clone(), outputs));
        }))
        .await?;

        info!(stacks = fetched.len(), "Fetched outputs of deployed stacks");
        return Ok(fetched.into_iter().collect());
    }
}
