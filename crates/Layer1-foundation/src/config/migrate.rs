//! Settings schema migrations
//!
//! Each step transforms the raw JSON document from version `n` to `n + 1`.
//! Documents without a `version` key are treated as version 1.

use crate::{Error, Result};
use serde_json::{Map, Value};
use tracing::debug;

/// Newest settings schema version
pub const CURRENT_VERSION: u32 = 3;

type Migration = fn(&mut Map<String, Value>) -> Result<()>;

/// Ordered migration steps; entry `i` upgrades version `i + 1`
const MIGRATIONS: [(u32, Migration); 2] = [(1, v1_to_v2), (2, v2_to_v3)];

/// Upgrade a raw settings document to [`CURRENT_VERSION`]
pub fn migrate(value: Value) -> Result<Value> {
    let Value::Object(mut doc) = value else {
        return Err(Error::Config("settings document must be a JSON object".into()));
    };

    let mut version = match doc.get("version") {
        None => 1,
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| Error::Config(format!("invalid settings version: {}", v)))?,
    };

    if version > CURRENT_VERSION {
        return Err(Error::UnsupportedVersion {
            found: version,
            latest: CURRENT_VERSION,
        });
    }

    for (from, step) in MIGRATIONS {
        if version == from {
            debug!(from, to = from + 1, "Migrating settings");
            step(&mut doc)?;
            version = from + 1;
        }
    }

    doc.insert("version".into(), Value::from(version));
    Ok(Value::Object(doc))
}

/// v1 kept retry knobs at the top level; v2 groups them under `supervisor`
fn v1_to_v2(doc: &mut Map<String, Value>) -> Result<()> {
    const MOVED: [&str; 4] = ["maxRetries", "backoffBaseMs", "backoffCapMs", "jitter"];

    let mut supervisor = match doc.remove("supervisor") {
        None => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(Error::migration(1, "`supervisor` must be an object")),
    };

    for key in MOVED {
        if let Some(value) = doc.remove(key) {
            supervisor.entry(key).or_insert(value);
        }
    }

    doc.insert("supervisor".into(), Value::Object(supervisor));
    Ok(())
}

/// v3 renames `environments[].maxAgents` to `maxAgentsRunning`
fn v2_to_v3(doc: &mut Map<String, Value>) -> Result<()> {
    let Some(environments) = doc.get_mut("environments") else {
        return Ok(());
    };
    let Value::Array(environments) = environments else {
        return Err(Error::migration(2, "`environments` must be an array"));
    };

    for env in environments.iter_mut() {
        let Value::Object(env) = env else {
            return Err(Error::migration(2, "environment entries must be objects"));
        };
        if let Some(value) = env.remove("maxAgents") {
            env.entry("maxAgentsRunning").or_insert(value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_v1_document_is_fully_migrated() {
        let doc = json!({
            "maxRetries": 5,
            "jitter": 0.2,
            "environments": [{"id": "default", "maxAgents": 2}]
        });

        let migrated = migrate(doc).unwrap();

        assert_eq!(migrated["version"], json!(CURRENT_VERSION));
        assert_eq!(migrated["supervisor"]["maxRetries"], json!(5));
        assert_eq!(migrated["supervisor"]["jitter"], json!(0.2));
        assert!(migrated.get("maxRetries").is_none());
        assert_eq!(migrated["environments"][0]["maxAgentsRunning"], json!(2));
        assert!(migrated["environments"][0].get("maxAgents").is_none());
    }

    #[test]
    fn test_current_document_untouched() {
        let doc = json!({
            "version": CURRENT_VERSION,
            "supervisor": {"maxRetries": 1},
            "environments": [{"id": "a", "maxAgentsRunning": 4}]
        });

        assert_eq!(migrate(doc.clone()).unwrap(), doc);
    }

    #[test]
    fn test_future_version_rejected() {
        let err = migrate(json!({"version": CURRENT_VERSION + 1})).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_existing_supervisor_value_wins() {
        let doc = json!({"version": 1, "maxRetries": 9, "supervisor": {"maxRetries": 2}});
        let migrated = migrate(doc).unwrap();
        assert_eq!(migrated["supervisor"]["maxRetries"], json!(2));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(migrate(json!([1, 2, 3])).is_err());
    }
}
