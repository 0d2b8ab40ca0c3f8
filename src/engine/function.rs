//! KRM function execution
//!
//! A function takes a `ResourceList` (items plus `functionConfig`) and returns
//! one. [`ExecRuntime`] maps images to local executables and pipes YAML
//! through stdin and stdout; [`BuiltinRuntime`] runs in-process closures.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde_yaml::{Mapping, Value};

use crate::cancel::CancellationToken;
use crate::error::{PorchError, Result};
use crate::resources::{self, ResourceDoc};

pub trait FunctionRuntime: Send + Sync {
    /// Run `image` over a `ResourceList`
    fn run(&self, image: &str, input: &Value, token: &CancellationToken) -> Result<Value>;
}

/// Runs functions as local executables
#[derive(Debug, Clone, Default)]
pub struct ExecRuntime {
    executables: BTreeMap<String, PathBuf>,
}

impl ExecRuntime {
    pub fn new(executables: BTreeMap<String, PathBuf>) -> Self {
        Self { executables }
    }
}

impl FunctionRuntime for ExecRuntime {
    fn run(&self, image: &str, input: &Value, token: &CancellationToken) -> Result<Value> {
        token.check("run function")?;
        let executable = self.executables.get(image).ok_or_else(|| PorchError::FunctionFailed {
            image: image.to_string(),
            reason: "no executable configured for image".to_string(),
        })?;
        let failed = |reason: String| PorchError::FunctionFailed {
            image: image.to_string(),
            reason,
        };
        let payload = serde_yaml::to_string(input)?;
        let mut child = Command::new(executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(format!("failed to start {}: {e}", executable.display())))?;

        // Feed stdin and drain both outputs concurrently so neither side
        // blocks on a full pipe.
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, written, stdout, stderr) = std::thread::scope(|scope| {
            let writer = scope.spawn(|| -> std::io::Result<()> {
                if let Some(mut stdin) = stdin {
                    stdin.write_all(payload.as_bytes())?;
                }
                Ok(())
            });
            let out = scope.spawn(|| drain(stdout));
            let err = scope.spawn(|| drain(stderr));
            let status = wait_or_kill(&mut child, token);
            let joined = |r: std::thread::Result<std::io::Result<Vec<u8>>>| {
                r.unwrap_or_else(|_| Err(std::io::Error::other("pipe reader panicked")))
            };
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            (status, written, joined(out.join()), joined(err.join()))
        });
        let status = status?;
        let stderr = stderr.unwrap_or_default();
        if !status.success() {
            return Err(failed(format!(
                "exited with {status}: {}",
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        // A function may exit without reading all of its input.
        if let Err(e) = written {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(failed(format!("failed to write input: {e}")));
            }
        }
        let stdout = stdout.map_err(|e| failed(format!("failed to read output: {e}")))?;
        serde_yaml::from_slice(&stdout).map_err(|e| failed(format!("invalid ResourceList output: {e}")))
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

fn drain(pipe: Option<impl Read>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

/// Wait for `child`, killing it when `token` is cancelled or expires
fn wait_or_kill(child: &mut Child, token: &CancellationToken) -> Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if let Err(err) = token.check("run function") {
            if let Err(e) = child.kill() {
                tracing::warn!(error = %e, "failed to kill function process");
            }
            child.wait()?;
            return Err(err);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

type FunctionFn = dyn Fn(&Value) -> Result<Value> + Send + Sync;

/// In-process functions keyed by image
#[derive(Default, Clone)]
pub struct BuiltinRuntime {
    functions: HashMap<String, Arc<FunctionFn>>,
}

impl BuiltinRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, image: &str, f: impl Fn(&Value) -> Result<Value> + Send + Sync + 'static) {
        self.functions.insert(image.to_string(), Arc::new(f));
    }
}

impl FunctionRuntime for BuiltinRuntime {
    fn run(&self, image: &str, input: &Value, token: &CancellationToken) -> Result<Value> {
        token.check("run function")?;
        let f = self.functions.get(image).ok_or_else(|| PorchError::FunctionFailed {
            image: image.to_string(),
            reason: "function not registered".to_string(),
        })?;
        f(input)
    }
}

/// `ConfigMap` function config built from key-value data
pub fn config_map(data: &BTreeMap<String, String>) -> Value {
    let mut metadata = Mapping::new();
    metadata.insert("name".into(), "function-input".into());
    let mut map = Mapping::new();
    map.insert("apiVersion".into(), "v1".into());
    map.insert("kind".into(), "ConfigMap".into());
    map.insert("metadata".into(), Value::Mapping(metadata));
    map.insert(
        "data".into(),
        Value::Mapping(
            data.iter()
                .map(|(k, v)| (Value::from(k.clone()), Value::from(v.clone())))
                .collect(),
        ),
    );
    Value::Mapping(map)
}

/// Run one function over documents and return the resulting documents
///
/// Error results reported by the function fail the call.
pub fn run_function(
    runtime: &dyn FunctionRuntime,
    image: &str,
    config: Option<Value>,
    docs: &[ResourceDoc],
    token: &CancellationToken,
) -> Result<Vec<ResourceDoc>> {
    let input = resources::to_resource_list(docs, config);
    let output = runtime.run(image, &input, token)?;
    let errors: Vec<String> = output
        .get("results")
        .and_then(Value::as_sequence)
        .into_iter()
        .flatten()
        .filter(|r| r.get("severity").and_then(Value::as_str) == Some("error"))
        .map(|r| {
            r.get("message")
                .and_then(Value::as_str)
                .unwrap_or("function reported an error")
                .to_string()
        })
        .collect();
    if !errors.is_empty() {
        return Err(PorchError::FunctionFailed {
            image: image.to_string(),
            reason: errors.join("; "),
        });
    }
    resources::from_resource_list(&output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str) -> ResourceDoc {
        let value: Value = serde_yaml::from_str(&format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n"
        ))
        .unwrap();
        ResourceDoc {
            file: format!("{name}.yaml"),
            index: 0,
            value,
            merge_comment: None,
        }
    }

    #[test]
    fn test_builtin_function_sees_config() {
        let mut runtime = BuiltinRuntime::new();
        runtime.register("set-ns", |list| {
            let ns = list["functionConfig"]["data"]["namespace"].clone();
            let mut out = list.clone();
            if let Some(items) = out.get_mut("items").and_then(Value::as_sequence_mut) {
                for item in items {
                    item["metadata"]["namespace"] = ns.clone();
                }
            }
            Ok(out)
        });
        let config = config_map(&[("namespace".to_string(), "prod".to_string())].into());
        let docs = run_function(&runtime, "set-ns", Some(config), &[doc("a")], &CancellationToken::none()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].namespace(), "prod");
        assert_eq!(docs[0].file, "a.yaml");
    }

    #[test]
    fn test_error_results_fail() {
        let mut runtime = BuiltinRuntime::new();
        runtime.register("deny", |list| {
            let mut out = list.clone();
            out["results"] = serde_yaml::from_str("- severity: error\n  message: denied\n").unwrap();
            Ok(out)
        });
        let err = run_function(&runtime, "deny", None, &[doc("a")], &CancellationToken::none()).unwrap_err();
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_unknown_image() {
        let runtime = ExecRuntime::default();
        let err = runtime
            .run("example.com/missing:v1", &Value::Null, &CancellationToken::none())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_runtime_pipes_resource_list() {
        let temp = tempfile::TempDir::new().unwrap();
        let script = temp.path().join("identity.sh");
        std::fs::write(&script, "#!/bin/sh\ncat\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let runtime = ExecRuntime::new([("identity".to_string(), script)].into());
        let docs = run_function(&runtime, "identity", None, &[doc("a"), doc("b")], &CancellationToken::none()).unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[cfg(unix)]
    fn script(temp: &tempfile::TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = temp.path().join("fn.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_runtime_streams_large_lists() {
        let temp = tempfile::TempDir::new().unwrap();
        let runtime = ExecRuntime::new([("cat".to_string(), script(&temp, "exec cat"))].into());
        let docs: Vec<ResourceDoc> = (0..4000).map(|i| doc(&format!("cm-{i}"))).collect();
        let token = CancellationToken::new().with_deadline(Duration::from_secs(60));
        let out = run_function(&runtime, "cat", None, &docs, &token).unwrap();
        assert_eq!(out.len(), 4000);
        assert_eq!(out[3999].name(), "cm-3999");
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_runtime_kills_on_deadline() {
        let temp = tempfile::TempDir::new().unwrap();
        let runtime = ExecRuntime::new([("slow".to_string(), script(&temp, "exec sleep 30"))].into());
        let token = CancellationToken::new().with_deadline(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = runtime.run("slow", &Value::Null, &token).unwrap_err();
        assert!(matches!(err, PorchError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_runtime_reports_failure() {
        let temp = tempfile::TempDir::new().unwrap();
        let runtime = ExecRuntime::new([("fail".to_string(), script(&temp, "echo boom >&2; exit 3"))].into());
        let err = runtime.run("fail", &Value::Null, &CancellationToken::none()).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
