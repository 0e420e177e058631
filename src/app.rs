use std::collections::BTreeSet;
use tracing::info;

use crate::stack::{Environment, Error, Stack};
use crate::template::Template;

/// Root of the stack graph.
pub struct App {
    environment: Environment,
    stacks: Vec<Stack>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackArtifact {
    pub stack_id: String,
    pub environment: String,
    pub template: Template,
    pub dependencies: Vec<String>,
}

/// Synthesized stacks, ordered so that every stack follows its dependencies.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudAssembly {
    pub stacks: Vec<StackArtifact>,
}

impl CloudAssembly {
    pub fn stack(&self, stack_id: &str) -> Option<&StackArtifact> {
        return self.stacks.iter().find(|stack| stack.stack_id == stack_id);
    }

    pub fn template(&self, stack_id: &str) -> Option<&Template> {
        return self.stack(stack_id).map(|stack| &stack.template);
    }
}

impl App {
    pub fn new(environment: Environment) -> Self {
        return Self {
            environment,
            stacks: Vec::new(),
        };
    }

    pub fn add_stack(&mut self, id: &str) -> Result<&mut Stack, Error> {
        if self.stacks.iter().any(|stack| stack.id == id) {
            return Err(Error::DuplicateStack(id.to_string()));
        }

        self.stacks.push(Stack::new(id, self.environment.clone()));
        let index = self.stacks.len() - 1;
        return Ok(&mut self.stacks[index]);
    }

    pub fn stack(&self, id: &str) -> Option<&Stack> {
        return self.stacks.iter().find(|stack| stack.id == id);
    }

    pub fn synth(&self) -> Result<CloudAssembly, Error> {
        let mut emitted: BTreeSet<&str> = BTreeSet::new();
        let mut ordered: Vec<&Stack> = Vec::with_capacity(self.stacks.len());

        for stack in &self.stacks {
            for dependency in stack.dependencies() {
                if self.stack(dependency).is_none() {
                    return Err(Error::UnknownDependency(stack.id.clone(), dependency.clone()));
                }
            }
        }

        // Declaration order breaks ties, which keeps the output stable.
        while ordered.len() < self.stacks.len() {
            let next = self.stacks.iter().find(|stack| {
                !emitted.contains(stack.id.as_str())
                    && stack
                        .dependencies()
                        .iter()
                        .all(|dependency| emitted.contains(dependency.as_str()))
            });

            match next {
                Some(stack) => {
                    emitted.insert(&stack.id);
                    ordered.push(stack);
                }
                None => {
                    let remaining: Vec<&str> = self
                        .stacks
                        .iter()
                        .filter(|stack| !emitted.contains(stack.id.as_str()))
                        .map(|stack| stack.id.as_str())
                        .collect();
                    return Err(Error::DependencyCycle(remaining.join(", ")));
                }
            }
        }

        let stacks: Vec<StackArtifact> = ordered
            .into_iter()
            .map(|stack| StackArtifact {
                stack_id: stack.id.clone(),
                environment: stack.environment.manifest_string(),
                template: stack.template().clone(),
                dependencies: stack.dependencies().iter().cloned().collect(),
            })
            .collect();

        for stack in &stacks {
            info!(
                stack = %stack.stack_id,
                resources = stack.template.resources.len(),
                outputs = stack.template.outputs.len(),
                "Synthesized stack"
            );
        }

        return Ok(CloudAssembly { stacks });
    }
}
