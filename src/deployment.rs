//! The linear composition pass: network, database, cluster, service.

use crate::app::App;
use crate::cluster::{self, Cluster};
use crate::config::Config;
use crate::database::{self, Database};
use crate::network::{self, Network};
use crate::service::{self, Service};
use crate::stack::Error;

pub struct Deployment {
    pub network: Network,
    pub database: Database,
    pub cluster: Cluster,
    pub service: Service,
}

pub fn declare(app: &mut App, config: &Config) -> Result<Deployment, Error> {
    let network = network::declare(app, &config.stacks.network, &config.network)?;
    let database = database::declare(app, &config.stacks.database, &network, &config.database)?;
    let cluster = cluster::declare(app, &config.stacks.cluster, &network, &config.cluster)?;
    let service = service::declare(
        app,
        &config.stacks.service,
        &cluster,
        &database.credential,
        &config.service,
    )?;

    return Ok(Deployment {
        network,
        database,
        cluster,
        service,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Environment;
    use serde_json::json;

    fn synth(config: &Config) -> crate::app::CloudAssembly {
        let mut app = App::new(config.environment.clone());
        declare(&mut app, config).unwrap();
        return app.synth().unwrap();
    }

    #[test]
    fn wires_the_stacks_in_dependency_order() {
        let assembly = synth(&Config::default());

        let order: Vec<&str> = assembly
            .stacks
            .iter()
            .map(|stack| stack.stack_id.as_str())
            .collect();
        assert_eq!(vec!["VpcStack", "RdsStack", "EcsStack", "ApplicationStack"], order);

        assert_eq!(Vec::<String>::new(), assembly.stack("VpcStack").unwrap().dependencies);
        assert_eq!(vec!["VpcStack"], assembly.stack("RdsStack").unwrap().dependencies);
        assert_eq!(vec!["VpcStack"], assembly.stack("EcsStack").unwrap().dependencies);
        // The credential is resolved by name, so there is no edge to the database.
        assert_eq!(
            vec!["EcsStack", "VpcStack"],
            assembly.stack("ApplicationStack").unwrap().dependencies
        );
    }

    #[test]
    fn every_import_has_a_matching_export() {
        let assembly = synth(&Config::default());

        let exports: Vec<String> = assembly
            .stacks
            .iter()
            .flat_map(|stack| stack.template.outputs.values())
            .filter_map(|output| output.export.as_ref().map(|export| export.name.clone()))
            .collect();

        for stack in &assembly.stacks {
            let body = serde_json::to_value(&stack.template).unwrap().to_string();
            for (index, _) in body.match_indices("Fn::ImportValue") {
                let rest = &body[index + "Fn::ImportValue\":\"".len()..];
                let name = &rest[..rest.find('"').unwrap()];
                assert_eq!(true, exports.iter().any(|export| export == name), "{}", name);
            }
        }
    }

    #[test]
    fn synthesis_is_idempotent() {
        let config = Config::default();

        let first = synth(&config);
        let second = synth(&config);
        assert_eq!(first, second);

        let first = serde_json::to_string(&first.template("ApplicationStack").unwrap()).unwrap();
        let second = serde_json::to_string(&second.template("ApplicationStack").unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn carries_the_target_environment() {
        let config = Config {
            environment: Environment {
                account: Some(String::from("123456789012")),
                region: Some(String::from("us-east-1")),
            },
            ..Config::default()
        };

        let assembly = synth(&config);
        for stack in &assembly.stacks {
            assert_eq!("aws://123456789012/us-east-1", stack.environment);
        }
        assert_eq!(
            true,
            assembly
                .template("VpcStack")
                .unwrap()
                .has_resource_properties("AWS::EC2::VPC", &json!({ "CidrBlock": "10.0.0.0/21" }))
        );
    }

    #[test]
    fn failed_declarations_abort_the_pass() {
        let mut config = Config::default();
        config.service.secrets.insert(String::from("VTT_DBNAME"), String::from("dbname"));

        let mut app = App::new(Environment::default());
        assert_eq!(true, declare(&mut app, &config).is_err());
        assert_eq!(true, app.stack("ApplicationStack").is_none());
    }
}
