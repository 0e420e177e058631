use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::app::CloudAssembly;

const MANIFEST_VERSION: &str = "21.0.0";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Unable to write {0}: {1}")]
    WriteError(String, String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    fn extension(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Yaml => "yaml",
        }
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    version: &'static str,
    artifacts: BTreeMap<&'a str, Artifact<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Artifact<'a> {
    #[serde(rename = "type")]
    artifact_type: &'static str,
    environment: &'a str,
    properties: ArtifactProperties,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactProperties {
    template_file: String,
}

/// Writes one template per stack plus `manifest.json` into `out_dir`.
pub fn write(out_dir: &Path, assembly: &CloudAssembly, format: Format) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(out_dir)
        .map_err(|error| Error::WriteError(out_dir.display().to_string(), error.to_string()))?;

    let mut written = Vec::with_capacity(assembly.stacks.len() + 1);
    let mut artifacts = BTreeMap::new();

    for stack in &assembly.stacks {
        let template_file = format!("{}.template.{}", stack.stack_id, format.extension());
        let contents = match format {
            Format::Json => serde_json::to_string_pretty(&stack.template)
                .map_err(|error| Error::SerializationError(error.to_string()))?,
            Format::Yaml => serde_yaml::to_string(&stack.template)
                .map_err(|error| Error::SerializationError(error.to_string()))?,
        };

        let path = out_dir.join(&template_file);
        write_file(&path, &contents)?;
        written.push(path);

        artifacts.insert(
            stack.stack_id.as_str(),
            Artifact {
                artifact_type: "aws:cloudformation:stack",
                environment: &stack.environment,
                properties: ArtifactProperties { template_file },
                dependencies: stack.dependencies.iter().map(String::as_str).collect(),
            },
        );
    }

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        artifacts,
    };
    let contents = serde_json::to_string_pretty(&manifest)
        .map_err(|error| Error::SerializationError(error.to_string()))?;
    let path = out_dir.join("manifest.json");
    write_file(&path, &contents)?;
    written.push(path);

    return Ok(written);
}

/// Writes `{ stack: { output key: output value } }` as JSON.
pub fn write_outputs(
    path: &Path,
    outputs: &BTreeMap<String, BTreeMap<String, String>>,
) -> Result<(), Error> {
    let contents = serde_json::to_string_pretty(outputs)
        .map_err(|error| Error::SerializationError(error.to_string()))?;

    return write_file(path, &contents);
}

fn write_file(path: &Path, contents: &str) -> Result<(), Error> {
    debug!(path = %path.display(), bytes = contents.len(), "Writing file");
    return fs::write(path, contents)
        .map_err(|error| Error::WriteError(path.display().to_string(), error.to_string()));
}
