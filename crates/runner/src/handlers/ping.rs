#![forbid(unsafe_code)]

use crate::context::ExecutionContext;
use crate::error::{Fault, ValidationError};
use crate::registry::JobHandler;
use jv_core::JsonMap;
use serde_json::{Value, json};
use std::path::{Component, Path};
use std::time::Duration;

const MAX_SLEEP_SEC: f64 = 3600.0;
const DEFAULT_STEPS: u64 = 10;
const MAX_STEPS: u64 = 1000;

/// `PING`: sleeps in steps, heartbeating and polling for abort between them.
///
/// Params: `sleep_sec` (0..=3600, default 0), `steps` (1..=1000, default 10),
/// `fail` (bool), `write_outputs` (relative file names written under the
/// artifacts dir and declared in `outputs`), `declare_outputs` (declared
/// without being written).
#[derive(Clone, Copy, Debug, Default)]
pub struct PingHandler;

#[derive(Debug)]
struct PingParams {
    sleep_sec: f64,
    steps: u64,
    fail: bool,
    write_outputs: Vec<String>,
    declare_outputs: Vec<String>,
}

fn string_list(params: &JsonMap, key: &str) -> Result<Vec<String>, ValidationError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ValidationError::for_field(key, format!("{key} must contain only strings")))
            })
            .collect(),
        Some(_) => Err(ValidationError::for_field(
            key,
            format!("{key} must be an array of strings"),
        )),
    }
}

fn is_plain_relative(name: &str) -> bool {
    let path = Path::new(name);
    !name.trim().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        && path.components().any(|c| matches!(c, Component::Normal(_)))
}

fn parse_params(params: &JsonMap) -> Result<PingParams, ValidationError> {
    let sleep_sec = match params.get("sleep_sec") {
        None | Some(Value::Null) => 0.0,
        Some(value) => value
            .as_f64()
            .ok_or_else(|| ValidationError::for_field("sleep_sec", "sleep_sec must be a number"))?,
    };
    if !sleep_sec.is_finite() || sleep_sec < 0.0 {
        return Err(ValidationError::for_field(
            "sleep_sec",
            format!("sleep_sec must be >= 0 (got {sleep_sec})"),
        ));
    }
    if sleep_sec > MAX_SLEEP_SEC {
        return Err(ValidationError::for_field(
            "sleep_sec",
            format!("sleep_sec must be <= {MAX_SLEEP_SEC} (got {sleep_sec})"),
        ));
    }

    let steps = match params.get("steps") {
        None | Some(Value::Null) => DEFAULT_STEPS,
        Some(value) => value
            .as_u64()
            .filter(|s| (1..=MAX_STEPS).contains(s))
            .ok_or_else(|| {
                ValidationError::for_field("steps", format!("steps must be an integer in 1..={MAX_STEPS}"))
            })?,
    };

    let fail = match params.get("fail") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(fail)) => *fail,
        Some(_) => return Err(ValidationError::for_field("fail", "fail must be a boolean")),
    };

    let write_outputs = string_list(params, "write_outputs")?;
    if let Some(bad) = write_outputs.iter().find(|name| !is_plain_relative(name)) {
        return Err(ValidationError::for_field(
            "write_outputs",
            format!("write_outputs entries must be relative paths inside the job directory: {bad}"),
        ));
    }
    let declare_outputs = string_list(params, "declare_outputs")?;

    Ok(PingParams {
        sleep_sec,
        steps,
        fail,
        write_outputs,
        declare_outputs,
    })
}

impl JobHandler for PingHandler {
    fn validate_params(&self, params: &JsonMap) -> Result<(), ValidationError> {
        parse_params(params).map(|_| ())
    }

    fn execute(
        &self,
        params: &JsonMap,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<JsonMap, Fault> {
        let params = parse_params(params).map_err(|err| Fault::new("ValidationError", err.message))?;
        let per_step = Duration::from_secs_f64(params.sleep_sec / params.steps as f64);

        for step in 0..params.steps {
            if ctx.is_abort_requested() {
                tracing::info!(job_id = %ctx.job_id(), completed_steps = step, "ping aborted");
                let mut result = JsonMap::new();
                result.insert("aborted".to_string(), json!(true));
                result.insert("completed_steps".to_string(), json!(step));
                result.insert("steps".to_string(), json!(params.steps));
                return Ok(result);
            }
            std::thread::sleep(per_step);
            let done = step + 1;
            ctx.heartbeat(
                done as f64 / params.steps as f64,
                Some(&format!("step {done}/{}", params.steps)),
            )?;
        }

        if params.fail {
            return Err(Fault::new("PingFailure", "ping was asked to fail"));
        }

        let mut outputs = Vec::with_capacity(params.write_outputs.len() + params.declare_outputs.len());
        for name in &params.write_outputs {
            let path = ctx.artifacts_dir().join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| Fault::new("OutputWriteError", format!("{name}: {err}")))?;
            }
            std::fs::write(&path, format!("pong {} {name}\n", ctx.job_id()))
                .map_err(|err| Fault::new("OutputWriteError", format!("{name}: {err}")))?;
            outputs.push(json!(name));
        }
        outputs.extend(params.declare_outputs.iter().map(|name| json!(name)));

        let mut result = JsonMap::new();
        result.insert("pong".to_string(), json!(true));
        result.insert("slept_sec".to_string(), json!(params.sleep_sec));
        result.insert("steps".to_string(), json!(params.steps));
        result.insert("outputs".to_string(), Value::Array(outputs));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn defaults_apply_when_params_are_empty() {
        let parsed = parse_params(&JsonMap::new()).expect("empty params are valid");
        assert_eq!(parsed.sleep_sec, 0.0);
        assert_eq!(parsed.steps, DEFAULT_STEPS);
        assert!(!parsed.fail);
    }

    #[test]
    fn negative_sleep_is_a_validation_error() {
        let err = PingHandler
            .validate_params(&params(json!({"sleep_sec": -1})))
            .expect_err("negative");
        assert_eq!(err.field.as_deref(), Some("sleep_sec"));
        assert!(err.message.contains(">= 0"));
    }

    #[test]
    fn bounds_and_types_are_checked() {
        for bad in [
            json!({"sleep_sec": "fast"}),
            json!({"sleep_sec": 3601}),
            json!({"steps": 0}),
            json!({"steps": 1001}),
            json!({"steps": 2.5}),
            json!({"fail": "yes"}),
            json!({"write_outputs": "out.txt"}),
            json!({"write_outputs": ["../escape.txt"]}),
            json!({"write_outputs": ["/etc/passwd"]}),
            json!({"declare_outputs": [1]}),
        ] {
            assert!(
                PingHandler.validate_params(&params(bad.clone())).is_err(),
                "expected rejection for {bad}"
            );
        }
        assert!(
            PingHandler
                .validate_params(&params(json!({
                    "sleep_sec": 0.5,
                    "steps": 5,
                    "fail": false,
                    "write_outputs": ["out/report.txt"],
                    "declare_outputs": ["../outside.txt"]
                })))
                .is_ok()
        );
    }
}
