/// Node execution handlers
///
/// Parameters are interpolated first, then resolved into a typed `NodeAction`
/// for the node's type. Each action owns its parameter shape:
/// - http / webhook: outbound request via reqwest (no `url` means no-op)
/// - js: sandboxed Lua function body receiving `input`
/// - wait: sleeps for `seconds`
/// - everything else: parameters pass through as output

use crate::{
    config::EngineConfig,
    error::NodeExecutionError,
    runtime::{
        expression::{EvalContext, ExpressionEvaluator},
        sandbox::{LuaSandbox, ScriptOutput},
        template::{expression_count, TemplateInterpolator},
    },
    workflow::types::{Node, NodeType},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Delay used by wait nodes whose `seconds` is absent or not numeric
const DEFAULT_WAIT_SECS: f64 = 1.0;

/// Response bodies quoted in HTTP status errors are cut to this many chars
const ERROR_BODY_EXCERPT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Success,
    Error,
}

/// Uniform outcome of one node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub status: NodeStatus,
    pub output: Value,
    /// Present iff `status` is `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Elapsed time on the runtime clock
    pub duration_ms: u64,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl NodeResult {
    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Success
    }
}

/// Interpolated, typed work for one node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeAction {
    Http(HttpCall),
    Script(ScriptCall),
    Wait(WaitDelay),
    /// Output the parameters unchanged; `note` goes to the node logs
    PassThrough { output: Value, note: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpCall {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptCall {
    pub code: String,
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitDelay {
    pub millis: u64,
}

impl NodeAction {
    /// Build the action for `node_type` from already-interpolated parameters
    pub fn resolve(
        node_type: &NodeType,
        params: Map<String, Value>,
        context: &EvalContext,
    ) -> Result<Self, NodeExecutionError> {
        match node_type {
            NodeType::Http | NodeType::Webhook => Ok(HttpCall::from_params(params)),
            NodeType::Script => ScriptCall::from_params(params, context).map(NodeAction::Script),
            NodeType::Wait => Ok(NodeAction::Wait(WaitDelay::from_params(&params))),
            NodeType::Manual | NodeType::Timer | NodeType::Other(_) => Ok(NodeAction::PassThrough {
                output: Value::Object(params),
                note: None,
            }),
        }
    }
}

impl HttpCall {
    /// A missing or blank `url` degrades to a successful no-op so disconnected
    /// trigger and test nodes still run
    fn from_params(params: Map<String, Value>) -> NodeAction {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);

        let Some(url) = url else {
            return NodeAction::PassThrough {
                output: Value::Object(params),
                note: Some("no url configured, request skipped".to_string()),
            };
        };

        let method = params
            .get("method")
            .and_then(Value::as_str)
            .map(|m| m.trim().to_uppercase())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "GET".to_string());

        let headers = params
            .get("headers")
            .and_then(Value::as_object)
            .map(|headers| {
                headers
                    .iter()
                    .filter(|(_, value)| !value.is_null())
                    .map(|(name, value)| {
                        let value = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (name.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let body = params.get("body").filter(|body| !body.is_null()).cloned();

        NodeAction::Http(HttpCall {
            method,
            url,
            headers,
            body,
        })
    }
}

impl ScriptCall {
    fn from_params(mut params: Map<String, Value>, context: &EvalContext) -> Result<Self, NodeExecutionError> {
        let code = match params.remove("code") {
            Some(Value::String(code)) => code,
            Some(other) => {
                return Err(NodeExecutionError::InvalidParameter {
                    name: "code",
                    reason: format!("expected a string, got {other}"),
                })
            }
            None => {
                return Err(NodeExecutionError::MissingParameter {
                    node_type: NodeType::Script.to_string(),
                    name: "code",
                })
            }
        };

        let input = params.remove("input").unwrap_or_else(|| context.inputs.clone());
        Ok(Self { code, input })
    }
}

impl WaitDelay {
    fn from_params(params: &Map<String, Value>) -> Self {
        let seconds = params
            .get("seconds")
            .and_then(|value| match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            })
            .filter(|secs| secs.is_finite())
            .unwrap_or(DEFAULT_WAIT_SECS);

        Self {
            millis: (seconds.max(0.0) * 1000.0).round() as u64,
        }
    }
}

/// Dispatches nodes to their type-specific handler
#[derive(Debug, Clone)]
pub struct NodeExecutor {
    interpolator: Arc<TemplateInterpolator>,
    sandbox: LuaSandbox,
    http: reqwest::Client,
    script_timeout: Duration,
}

impl NodeExecutor {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let sandbox = LuaSandbox::new(config.sandbox_memory_limit);
        let evaluator = ExpressionEvaluator::new(sandbox.clone(), config.expression_timeout());
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            interpolator: Arc::new(TemplateInterpolator::new(evaluator)),
            sandbox,
            http,
            script_timeout: config.script_timeout(),
        })
    }

    pub fn interpolator(&self) -> &Arc<TemplateInterpolator> {
        &self.interpolator
    }

    /// Execute a node against `context`. Never fails: errors are reported in
    /// the returned result.
    pub async fn execute(&self, node: &Node, context: &EvalContext) -> NodeResult {
        tracing::info!("🚀 Starting node execution: {} (type: {})", node.name, node.node_type);

        let start_time = Utc::now();
        let started = tokio::time::Instant::now();
        let mut logs = Vec::new();

        let outcome = self.run(node, context, &mut logs).await;

        let end_time = Utc::now();
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;

        match outcome {
            Ok(output) => {
                tracing::info!("✅ Node execution completed: {} in {:?}", node.name, duration);
                tracing::debug!("📤 Output data: {}", output);
                NodeResult {
                    status: NodeStatus::Success,
                    output,
                    error: None,
                    start_time,
                    end_time,
                    duration_ms,
                    logs,
                }
            }
            Err(e) => {
                tracing::error!("❌ Node execution failed: {} in {:?} - Error: {}", node.name, duration, e);
                NodeResult {
                    status: NodeStatus::Error,
                    output: Value::Null,
                    error: Some(e.to_string()),
                    start_time,
                    end_time,
                    duration_ms,
                    logs,
                }
            }
        }
    }

    async fn run(
        &self,
        node: &Node,
        context: &EvalContext,
        logs: &mut Vec<String>,
    ) -> Result<Value, NodeExecutionError> {
        let params = self.interpolate_parameters(&node.parameters, context, logs).await?;
        let action = NodeAction::resolve(&node.node_type, params, context)?;

        match action {
            NodeAction::Http(spec) => self.execute_http(spec, logs).await,
            NodeAction::Script(spec) => self.execute_script(spec, logs).await,
            NodeAction::Wait(spec) => {
                tokio::time::sleep(Duration::from_millis(spec.millis)).await;
                logs.push(format!("waited {}ms", spec.millis));
                Ok(json!({ "waited": spec.millis }))
            }
            NodeAction::PassThrough { output, note } => {
                logs.extend(note);
                Ok(output)
            }
        }
    }

    /// Sandbox evaluation is CPU-bound, so it runs on the blocking pool. If the
    /// whole tree overruns its budget the literal parameters are used instead.
    async fn interpolate_parameters(
        &self,
        parameters: &Map<String, Value>,
        context: &EvalContext,
        logs: &mut Vec<String>,
    ) -> Result<Map<String, Value>, NodeExecutionError> {
        let expressions: usize = parameters.values().map(expression_count).sum();
        if expressions == 0 {
            return Ok(parameters.clone());
        }

        let per_expression = self.interpolator.evaluator().await_limit();
        let limit = per_expression
            .checked_mul(u32::try_from(expressions).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX);
        let interpolator = Arc::clone(&self.interpolator);
        let literal = parameters.clone();
        let context = context.clone();
        let task = tokio::task::spawn_blocking(move || interpolator.interpolate_map(&literal, &context));

        match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined.map_err(|e| NodeExecutionError::Join(e.to_string())),
            Err(_) => {
                tracing::warn!("⏰ Parameter interpolation exceeded {:?}, using literal parameters", limit);
                logs.push(format!("parameter interpolation timed out after {limit:?}, parameters left uninterpolated"));
                Ok(parameters.clone())
            }
        }
    }

    async fn execute_http(
        &self,
        spec: HttpCall,
        logs: &mut Vec<String>,
    ) -> Result<Value, NodeExecutionError> {
        tracing::debug!("🌍 HTTP Request: {} {}", spec.method, spec.url);

        let method = reqwest::Method::from_bytes(spec.method.as_bytes()).map_err(|_| {
            NodeExecutionError::InvalidParameter {
                name: "method",
                reason: format!("unsupported HTTP method '{}'", spec.method),
            }
        })?;

        let mut request = self.http.request(method, &spec.url);
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match spec.body {
            Some(Value::String(text)) => request.body(text),
            Some(body) => request.json(&body),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| NodeExecutionError::Transport(e.to_string()))?;

        let status = response.status();
        logs.push(format!("{} {} -> {}", spec.method, spec.url, status.as_u16()));

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| NodeExecutionError::Transport(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(NodeExecutionError::HttpStatus {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_EXCERPT).collect(),
            });
        }

        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        tracing::info!("✅ HTTP request completed: {} {} (status: {})", spec.method, spec.url, status);

        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
        }))
    }

    async fn execute_script(
        &self,
        spec: ScriptCall,
        logs: &mut Vec<String>,
    ) -> Result<Value, NodeExecutionError> {
        tracing::debug!("🧠 Executing script ({} bytes)", spec.code.len());

        let sandbox = self.sandbox.clone();
        let timeout = self.script_timeout;
        let task = tokio::task::spawn_blocking(move || {
            sandbox.run_function_body(&spec.code, &spec.input, timeout)
        });

        // the in-sandbox deadline normally fires first; this bounds the await
        // if the interpreter is stuck inside a single long native call
        let joined = tokio::time::timeout(timeout * 2, task)
            .await
            .map_err(|_| NodeExecutionError::Timeout(timeout))?;

        let ScriptOutput { value, logs: printed } =
            joined.map_err(|e| NodeExecutionError::Join(e.to_string()))??;
        logs.extend(printed);
        Ok(value)
    }
}
