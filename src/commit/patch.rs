use crate::commit::command::PatchRequest;
use crate::error::MergeDbError;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    Modified(Value),
    NotModified,
}

/// Runs a patch script against a snapshot of a document body.
pub trait ScriptEngine: Send + Sync {
    fn execute(
        &self,
        request: &PatchRequest,
        document: &Value,
    ) -> Result<PatchOutcome, MergeDbError>;
}

/// Applies the script as a JSON merge patch (RFC 7396). String values of the
/// form `"$name"` are replaced with `args[name]` before merging.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergePatchEngine;

impl ScriptEngine for MergePatchEngine {
    fn execute(
        &self,
        request: &PatchRequest,
        document: &Value,
    ) -> Result<PatchOutcome, MergeDbError> {
        let patch: Value = serde_json::from_str(&request.script)
            .map_err(|e| MergeDbError::Validation(format!("patch script is not valid JSON: {e}")))?;
        let patch = substitute_args(patch, &request.args)?;
        let mut patched = document.clone();
        merge_patch(&mut patched, &patch);
        if &patched == document {
            Ok(PatchOutcome::NotModified)
        } else {
            Ok(PatchOutcome::Modified(patched))
        }
    }
}

fn substitute_args(value: Value, args: &Map<String, Value>) -> Result<Value, MergeDbError> {
    match value {
        Value::String(text) => match text.strip_prefix('$') {
            Some(name) => args
                .get(name)
                .cloned()
                .ok_or_else(|| {
                    MergeDbError::Validation(format!("patch argument '{name}' is missing"))
                }),
            None => Ok(Value::String(text)),
        },
        Value::Array(items) => items
            .into_iter()
            .map(|item| substitute_args(item, args))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key, substitute_args(item, args)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other),
    }
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
