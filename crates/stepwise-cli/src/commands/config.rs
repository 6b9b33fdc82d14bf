//! Config show/get/set/validate command.

use crate::ui;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use stepwise_core::Config;

/// What to do with the configuration.
#[derive(Debug, Clone, Default)]
pub enum ConfigAction {
    /// Print the full file.
    #[default]
    Show,
    /// Print one value by dotted path.
    Get(String),
    /// Set one value by dotted path.
    Set {
        /// Dotted path, e.g. `agents.default.restriction.approval`.
        key: String,
        /// Raw value; parsed as JSON when possible.
        value: String,
    },
    /// Validate the file.
    Validate,
    /// Write a default configuration if none exists.
    Init,
}

/// Run the config command against `config_path`.
pub fn run_config(action: ConfigAction, config_path: &Path) -> Result<()> {
    match action {
        ConfigAction::Show => show_config(config_path),
        ConfigAction::Get(key) => get_config_value(config_path, &key),
        ConfigAction::Set { key, value } => set_config_value(config_path, &key, &value),
        ConfigAction::Validate => validate_config(config_path),
        ConfigAction::Init => init_config(config_path),
    }
}

fn read_value(config_path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(config_path)
        .with_context(|| format!("Config file not found: {}", config_path.display()))?;
    Ok(json5::from_str(&content)?)
}

fn show_config(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        ui::error(&format!("Config file not found: {}", config_path.display()));
        ui::info("Run 'stepwise config init' to create one");
        return Ok(());
    }

    println!("{}", serde_json::to_string_pretty(&read_value(config_path)?)?);
    Ok(())
}

fn get_config_value(config_path: &Path, key: &str) -> Result<()> {
    let value = read_value(config_path)?;

    match lookup(&value, key) {
        Ok(Value::String(s)) => println!("{s}"),
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => println!("{v}"),
        Ok(v) => println!("{}", serde_json::to_string_pretty(v)?),
        Err(e) => ui::error(&e),
    }
    Ok(())
}

/// Follow a dotted path through objects and arrays.
fn lookup<'a>(root: &'a Value, key: &str) -> Result<&'a Value, String> {
    let mut current = root;

    for part in key.split('.') {
        current = match current {
            Value::Object(map) => map.get(part).ok_or_else(|| format!("Key not found: {key}"))?,
            Value::Array(items) => {
                let idx: usize = part
                    .parse()
                    .map_err(|_| format!("Invalid array index: {part}"))?;
                items
                    .get(idx)
                    .ok_or_else(|| format!("Index out of bounds: {part}"))?
            }
            _ => return Err(format!("Cannot navigate into non-object: {part}")),
        };
    }

    Ok(current)
}

fn set_config_value(config_path: &Path, key: &str, raw: &str) -> Result<()> {
    let mut value = if config_path.exists() {
        read_value(config_path)?
    } else {
        serde_json::json!({})
    };

    let path: Vec<&str> = key.split('.').collect();
    set_nested_value(&mut value, &path, parse_scalar(raw));

    // Round-trip through the typed config so invalid edits are never written.
    let config = Config::parse(&serde_json::to_string(&value)?)
        .with_context(|| format!("Refusing to set {key}"))?;
    config.save(config_path)?;

    ui::success(&format!("Set {key} = {raw}"));
    Ok(())
}

/// Set a nested value, creating objects along the way.
fn set_nested_value(root: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = root;
    for part in parents {
        if !current.is_object() {
            *current = serde_json::json!({});
        }
        let Value::Object(obj) = current else {
            return;
        };
        current = obj
            .entry((*part).to_string())
            .or_insert_with(|| serde_json::json!({}));
    }

    if !current.is_object() {
        *current = serde_json::json!({});
    }
    if let Some(obj) = current.as_object_mut() {
        obj.insert((*last).to_string(), value);
    }
}

/// JSON if it parses, otherwise a plain string.
fn parse_scalar(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn validate_config(config_path: &Path) -> Result<()> {
    ui::header("Validating Configuration");

    if !config_path.exists() {
        ui::error(&format!("Config file not found: {}", config_path.display()));
        return Ok(());
    }

    let content = std::fs::read_to_string(config_path)?;

    if let Err(e) = json5::from_str::<Value>(&content) {
        ui::error(&format!("Syntax error: {e}"));
        return Ok(());
    }
    ui::success("Syntax: Valid JSON5");

    match Config::parse(&content) {
        Ok(config) => {
            ui::success("Schema: Configuration is valid");
            if config.agents.is_empty() {
                ui::warning("No agents configured");
            }
            for (id, agent) in &config.agents {
                ui::kv(
                    id,
                    &format!(
                        "{} via {}, {} allowlist pattern(s), approval {:?}",
                        agent.model,
                        agent.provider,
                        agent.restriction.command_allowlist.len(),
                        agent.restriction.approval
                    ),
                );
            }
        }
        Err(e) => ui::error(&format!("Schema error: {e}")),
    }

    Ok(())
}

fn init_config(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        ui::warning(&format!("Config already exists: {}", config_path.display()));
        return Ok(());
    }

    let mut config = Config::default();
    config
        .agents
        .insert("default".to_string(), stepwise_core::AgentConfig::default());
    config.save(config_path)?;

    ui::success(&format!("Wrote {}", config_path.display()));
    Ok(())
}
