//! # clustersync CLI
//!
//! Command-line utilities for event types, topic resolution and the
//! manifest store.

use anyhow::{bail, Context, Result};
use clustersync_agent::SqliteStore;
use clustersync_core::{
    AddressResolver, DataType, EventMetadata, EventType, ListOptions, SubResource,
};
use clustersync_mqtt::{MqttAgentResolver, MqttOptions, MqttSourceResolver};
use std::env;
use std::path::Path;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let output = match args[1].as_str() {
        "encode-type" => {
            if args.len() < 5 {
                usage("encode-type <group/version/resource> <spec|status> <action>");
            }
            encode_type(&args[2], &args[3], &args[4])?
        }
        "decode-type" => {
            if args.len() < 3 {
                usage("decode-type <type>");
            }
            decode_type(&args[2])?
        }
        "resolve" => {
            if args.len() < 6 {
                usage("resolve <mqtt-config> <source|agent> <id> <type> [clustername] [originalsource]");
            }
            let options = MqttOptions::from_file(Path::new(&args[2]))
                .context("Failed to load MQTT config")?;
            resolve(
                &options,
                &args[3],
                &args[4],
                &args[5],
                args.get(6).map(String::as_str),
                args.get(7).map(String::as_str),
            )?
        }
        "apply" => {
            if args.len() < 6 {
                usage("apply <db> <id> <clustername> <spec-json>");
            }
            let store = open_store(&args[2])?;
            apply(&store, &args[3], &args[4], &args[5])?
        }
        "remove" => {
            if args.len() < 5 {
                usage("remove <db> <id> <clustername>");
            }
            let store = open_store(&args[2])?;
            remove(&store, &args[3], &args[4])?
        }
        "list" => {
            if args.len() < 3 {
                usage("list <db> [clustername]");
            }
            let store = open_store(&args[2])?;
            list(&store, args.get(3).map(String::as_str))?
        }
        "help" | "--help" | "-h" => {
            print_help();
            return Ok(());
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    };

    println!("{output}");
    Ok(())
}

fn usage(text: &str) -> ! {
    eprintln!("Usage: clustersync {text}");
    std::process::exit(1);
}

fn open_store(path: &str) -> Result<SqliteStore> {
    SqliteStore::open(Path::new(path)).with_context(|| format!("Failed to open database {path}"))
}

fn parse_data_type(raw: &str) -> Result<DataType> {
    let parts: Vec<&str> = raw.split('/').collect();
    match parts.as_slice() {
        [group, version, resource] if parts.iter().all(|part| !part.is_empty()) => {
            Ok(DataType::new(*group, *version, *resource))
        }
        _ => bail!("invalid data type {raw:?}, expected <group>/<version>/<resource>"),
    }
}

fn encode_type(data_type: &str, sub_resource: &str, action: &str) -> Result<String> {
    let sub_resource: SubResource = sub_resource.parse()?;
    let event_type = EventType::new(parse_data_type(data_type)?, sub_resource, action);
    // reject anything that would not decode back
    let encoded = event_type.encode();
    EventType::decode(&encoded)?;
    Ok(encoded)
}

fn decode_type(raw: &str) -> Result<String> {
    let event_type = EventType::decode(raw)?;
    Ok(format!(
        "group:       {}\nversion:     {}\nresource:    {}\nsubresource: {}\naction:      {}",
        event_type.data_type.group,
        event_type.data_type.version,
        event_type.data_type.resource,
        event_type.sub_resource,
        event_type.action,
    ))
}

fn resolve(
    options: &MqttOptions,
    role: &str,
    id: &str,
    event_type: &str,
    cluster_name: Option<&str>,
    original_source: Option<&str>,
) -> Result<String> {
    let metadata = EventMetadata {
        event_type: EventType::decode(event_type)?,
        cluster_name: cluster_name.map(str::to_string),
        original_source: original_source.map(str::to_string),
        source: id.to_string(),
    };

    let address = match role {
        "source" => MqttSourceResolver::new(options.topics.clone(), id).resolve(&metadata)?,
        "agent" => MqttAgentResolver::new(options.topics.clone(), id).resolve(&metadata)?,
        other => bail!("unknown role {other:?}, expected source or agent"),
    };
    Ok(address)
}

fn apply(store: &SqliteStore, id: &str, cluster_name: &str, spec: &str) -> Result<String> {
    let spec: serde_json::Value = serde_json::from_str(spec).context("Invalid spec JSON")?;
    let version = store.apply_spec(id, cluster_name, &spec)?;
    Ok(format!("{id} ({cluster_name}) at version {version}"))
}

fn remove(store: &SqliteStore, id: &str, cluster_name: &str) -> Result<String> {
    match store.mark_deleted(id, cluster_name)? {
        Some(version) => Ok(format!("{id} ({cluster_name}) deleting at version {version}")),
        None => bail!("no live manifest {id} for {cluster_name}"),
    }
}

fn list(store: &SqliteStore, cluster_name: Option<&str>) -> Result<String> {
    let options = cluster_name.map_or_else(ListOptions::all, ListOptions::cluster);
    let lines = store
        .list(&options)?
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines.join("\n"))
}

fn print_help() {
    println!(
        r#"clustersync CLI

USAGE:
    clustersync <COMMAND> [OPTIONS]

COMMANDS:
    encode-type <g/v/r> <spec|status> <action>
                      Build an event type string
    decode-type <type>
                      Split an event type string into its parts
    resolve <mqtt-config> <source|agent> <id> <type> [clustername] [originalsource]
                      Print the topic an event would be published on
    apply <db> <id> <clustername> <spec-json>
                      Author or update a manifest
    remove <db> <id> <clustername>
                      Request deletion of a manifest
    list <db> [clustername]
                      Print stored manifests as JSON lines
    help              Show this help message

EXAMPLES:
    clustersync encode-type io.clustersync.works/v1/manifests spec create_request
    clustersync resolve mqtt.yaml agent cluster1 \
        io.clustersync.works/v1/manifests.status.update_request cluster1 hub1
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> MqttOptions {
        MqttOptions::from_yaml(
            r"
brokerHost: 127.0.0.1:1883
topics:
  sourceEvents: sources/hub1/clusters/+/sourceevents
  agentEvents: sources/hub1/clusters/+/agentevents
  agentBroadcast: clusters/+/agentbroadcast
",
        )
        .unwrap()
    }

    #[test]
    fn encode_and_decode_type() {
        let encoded =
            encode_type("io.clustersync.works/v1/manifests", "spec", "create_request").unwrap();
        assert_eq!(encoded, "io.clustersync.works/v1/manifests.spec.create_request");

        let decoded = decode_type(&encoded).unwrap();
        assert!(decoded.contains("subresource: spec"));
        assert!(decoded.contains("action:      create_request"));
    }

    #[test]
    fn encode_type_rejects_bad_input() {
        assert!(encode_type("io.clustersync.works/v1", "spec", "x").is_err());
        assert!(encode_type("g/v1/manifests", "metadata", "x").is_err());
        assert!(encode_type("g/v1/manifests", "spec", "a.b").is_err());
        assert!(decode_type("not-a-type").is_err());
    }

    #[test]
    fn resolves_both_roles() {
        let options = options();

        let spec = resolve(
            &options,
            "source",
            "hub1",
            "io.clustersync.works/v1/manifests.spec.create_request",
            Some("cluster1"),
            None,
        )
        .unwrap();
        assert_eq!(spec, "sources/hub1/clusters/cluster1/sourceevents");

        let status = resolve(
            &options,
            "agent",
            "cluster1",
            "io.clustersync.works/v1/manifests.status.update_request",
            Some("cluster1"),
            Some("hub1"),
        )
        .unwrap();
        assert_eq!(status, "sources/hub1/clusters/cluster1/agentevents");

        assert!(resolve(
            &options,
            "source",
            "hub1",
            "io.clustersync.works/v1/manifests.spec.create_request",
            None,
            None,
        )
        .is_err());
        assert!(resolve(&options, "hub", "x", "g/v/r.spec.a", None, None).is_err());
    }

    #[test]
    fn store_commands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.db");
        let store = open_store(path.to_str().unwrap()).unwrap();

        assert_eq!(
            apply(&store, "m1", "c1", r#"{"a": 1}"#).unwrap(),
            "m1 (c1) at version 1"
        );
        assert!(apply(&store, "m1", "c1", "{oops").is_err());
        assert_eq!(list(&store, Some("c1")).unwrap().lines().count(), 1);
        assert!(list(&store, Some("c2")).unwrap().is_empty());

        assert_eq!(
            remove(&store, "m1", "c1").unwrap(),
            "m1 (c1) deleting at version 2"
        );
        assert!(remove(&store, "m1", "c1").is_err());
    }
}
