//! Local tool bridge for the server harness.
//!
//! The server discovers custom tools from `<dir>/.opencode/tool/*.js`. For
//! each local tool a small module is injected there whose `execute` posts the
//! arguments back to a callback listener bound to 127.0.0.1.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path as UrlPath, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::harness::{LocalTool, ToolDefinition};

type ToolMap = Arc<HashMap<String, LocalTool>>;

pub struct ToolBridge {
    addr: SocketAddr,
    cancel: CancellationToken,
    files: Vec<PathBuf>,
    created_dirs: Vec<PathBuf>,
}

impl ToolBridge {
    /// Start the callback listener and inject one tool file per tool.
    pub async fn start(tools: Vec<LocalTool>, directory: &Path) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind tool callback listener")?;
        let addr = listener.local_addr()?;

        let definitions: Vec<ToolDefinition> =
            tools.iter().map(|t| t.definition.clone()).collect();
        let map: ToolMap = Arc::new(
            tools
                .into_iter()
                .map(|t| (file_stem(&t.definition.name), t))
                .collect(),
        );
        let app = Router::new()
            .route("/tool/:name", post(call_tool))
            .with_state(map);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("Tool callback listener failed: {}", e);
            }
        });

        let mut bridge = Self {
            addr,
            cancel,
            files: Vec::new(),
            created_dirs: Vec::new(),
        };

        let opencode_dir = directory.join(".opencode");
        let tool_dir = opencode_dir.join("tool");
        for dir in [&opencode_dir, &tool_dir] {
            if !dir.exists() {
                std::fs::create_dir(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
                bridge.created_dirs.push(dir.clone());
            }
        }
        for definition in &definitions {
            let path = tool_dir.join(format!("{}.js", file_stem(&definition.name)));
            std::fs::write(&path, render_tool_module(definition, addr.port()))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            debug!("Injected tool file {}", path.display());
            bridge.files.push(path);
        }

        Ok(bridge)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn injected_files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Stop the listener and remove everything that was injected.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        for file in self.files.drain(..) {
            if let Err(e) = std::fs::remove_file(&file) {
                debug!("Failed to remove {}: {}", file.display(), e);
            }
        }
        while let Some(dir) = self.created_dirs.pop() {
            // Leaves the directory alone if anything else was put there.
            let _ = std::fs::remove_dir(&dir);
        }
    }
}

impl Drop for ToolBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn call_tool(
    State(tools): State<ToolMap>,
    UrlPath(name): UrlPath<String>,
    Json(input): Json<Value>,
) -> Json<Value> {
    let Some(tool) = tools.get(&name) else {
        return Json(json!({ "content": format!("Unknown tool: {}", name), "is_error": true }));
    };
    let output = tool.handler.call(input).await;
    Json(json!({ "content": output.content, "is_error": output.is_error }))
}

/// Tool names restricted to what is safe in a file name.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn render_tool_module(definition: &ToolDefinition, port: u16) -> String {
    let schema = &definition.input_schema;
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let mut args = String::new();
    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (name, property) in properties {
            let description = property
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or(name);
            let optional = if required.contains(&name.as_str()) {
                ""
            } else {
                ".optional()"
            };
            args.push_str(&format!(
                "    {}: tool.schema.any(){}.describe({}),\n",
                js_string(name),
                optional,
                js_string(description)
            ));
        }
    }

    let url = format!(
        "http://127.0.0.1:{}/tool/{}",
        port,
        urlencoding::encode(&file_stem(&definition.name))
    );

    format!(
        r#"import {{ tool }} from "@opencode-ai/plugin"

export default tool({{
  description: {description},
  args: {{
{args}  }},
  async execute(args) {{
    const res = await fetch({url}, {{
      method: "POST",
      headers: {{ "content-type": "application/json" }},
      body: JSON.stringify(args),
    }})
    const body = await res.json()
    if (body.is_error) throw new Error(body.content)
    return body.content
  }},
}})
"#,
        description = js_string(&definition.description),
        args = args,
        url = js_string(&url),
    )
}
