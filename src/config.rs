use serde::{Deserialize, Serialize};
use std::{fs, io, path::PathBuf};
use validator::{Validate, ValidationError};

use crate::cluster::ClusterSpec;
use crate::database::DatabaseSpec;
use crate::network::NetworkSpec;
use crate::service::ServiceSpec;
use crate::stack::Environment;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors: {0}")]
    ValidationError(String),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StackNames {
    #[validate(custom = "validate_stack_name")]
    pub network: String,

    #[validate(custom = "validate_stack_name")]
    pub database: String,

    #[validate(custom = "validate_stack_name")]
    pub cluster: String,

    #[validate(custom = "validate_stack_name")]
    pub service: String,
}

impl Default for StackNames {
    fn default() -> Self {
        return Self {
            network: String::from("VpcStack"),
            database: String::from("RdsStack"),
            cluster: String::from("EcsStack"),
            service: String::from("ApplicationStack"),
        };
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    pub environment: Environment,

    #[validate]
    pub stacks: StackNames,

    #[validate]
    pub network: NetworkSpec,

    #[validate]
    pub database: DatabaseSpec,

    #[validate]
    pub cluster: ClusterSpec,

    #[validate]
    pub service: ServiceSpec,
}

pub fn parse(path: &PathBuf) -> Result<Config, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    let config: Config = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    match config.validate() {
        Ok(_) => (),
        Err(error) => return Err(Error::ValidationError(error.to_string())),
    }

    return Ok(config);
}

/// Reads `path` when given, the built-in deployment otherwise.
pub fn load(path: Option<&PathBuf>) -> Result<Config, Error> {
    return match path {
        Some(path) => parse(path),
        None => Ok(Config::default()),
    };
}

fn validate_stack_name(stack_name: &str) -> Result<(), ValidationError> {
    let mut chars = stack_name.chars();
    let starts_with_letter = match chars.next() {
        Some(first) => first.is_ascii_alphabetic(),
        None => false,
    };
    if !starts_with_letter || !chars.all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ValidationError::new(
            "Stack names have to start with a letter and contain only alphanumerics and `-`",
        ));
    }
    if stack_name.len() > 128 {
        return Err(ValidationError::new(
            "Stack names have to be at most 128 characters long",
        ));
    }

    return Ok(());
}
