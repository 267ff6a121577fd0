//! CNI plugin invocation.
//!
//! Executes the plugin binaries of a config list one after another, feeding
//! each `ADD` the previous result. `DEL` walks the list in reverse and keeps
//! going past failures so teardown is as complete as possible.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use cdbox_core::container::PortMapping;
use cdbox_core::error::{BoxError, Result};
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{CniResult, CniRuntimeConf, NetworkPlugin};

/// Invokes CNI plugins found under a search path.
pub struct CniExec {
    /// Colon-separated directories, as in `CNI_PATH`.
    cni_path: String,
}

impl CniExec {
    pub fn new(cni_path: impl Into<String>) -> Self {
        Self {
            cni_path: cni_path.into(),
        }
    }

    fn find_plugin(&self, plugin_type: &str) -> Result<PathBuf> {
        if plugin_type.contains('/') {
            return Err(BoxError::invalid(format!(
                "invalid CNI plugin type {plugin_type:?}"
            )));
        }
        self.cni_path
            .split(':')
            .filter(|d| !d.is_empty())
            .map(|d| Path::new(d).join(plugin_type))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                BoxError::runtime(
                    "network",
                    format!("CNI plugin {plugin_type:?} not found in {}", self.cni_path),
                )
            })
    }

    async fn invoke(
        &self,
        command: &str,
        plugin: &Value,
        conflist: &Value,
        prev_result: Option<&Value>,
        rt: &CniRuntimeConf,
    ) -> Result<Value> {
        let plugin_type = plugin
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BoxError::invalid("CNI plugin entry without \"type\""))?;
        let binary = self.find_plugin(plugin_type)?;
        let stdin = plugin_config(plugin, conflist, prev_result, rt);

        let netns = rt
            .netns
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let mut child = Command::new(&binary)
            .env_clear()
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &rt.container_id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", &rt.ifname)
            .env("CNI_PATH", &self.cni_path)
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BoxError::runtime("network", format!("failed to run {}: {}", binary.display(), e))
            })?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(&serde_json::to_vec(&stdin)?).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        tracing::debug!(
            plugin = plugin_type,
            command,
            status = ?output.status.code(),
            "CNI plugin finished"
        );

        if !output.status.success() {
            let message = serde_json::from_slice::<Value>(&output.stdout)
                .ok()
                .and_then(|v| {
                    let msg = v.get("msg")?.as_str()?.to_string();
                    let details = v.get("details").and_then(Value::as_str).unwrap_or("");
                    Some(if details.is_empty() {
                        msg
                    } else {
                        format!("{msg}: {details}")
                    })
                })
                .unwrap_or_else(|| String::from_utf8_lossy(&output.stderr).trim().to_string());
            return Err(BoxError::runtime(
                "network",
                format!("plugin {plugin_type} {command} failed: {message}"),
            ));
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

fn plugins(conflist: &Value) -> Result<&Vec<Value>> {
    conflist
        .get("plugins")
        .and_then(Value::as_array)
        .ok_or_else(|| BoxError::invalid("CNI config list has no \"plugins\""))
}

/// Build the stdin document for one plugin of a list.
fn plugin_config(
    plugin: &Value,
    conflist: &Value,
    prev_result: Option<&Value>,
    rt: &CniRuntimeConf,
) -> Value {
    let mut conf: Map<String, Value> = plugin.as_object().cloned().unwrap_or_default();
    conf.insert("name".to_string(), conflist["name"].clone());
    conf.insert("cniVersion".to_string(), conflist["cniVersion"].clone());
    if let Some(prev) = prev_result.filter(|p| !p.is_null()) {
        conf.insert("prevResult".to_string(), prev.clone());
    }

    let capabilities = plugin.get("capabilities").cloned().unwrap_or(Value::Null);
    let enabled = |cap: &str| capabilities.get(cap).and_then(Value::as_bool) == Some(true);
    let mut runtime_config = Map::new();
    if enabled("portMappings") && !rt.port_mappings.is_empty() {
        runtime_config.insert(
            "portMappings".to_string(),
            Value::Array(rt.port_mappings.iter().map(port_mapping_json).collect()),
        );
    }
    if enabled("ips") {
        if let Some(ip) = &rt.ip {
            runtime_config.insert("ips".to_string(), json!([ip]));
        }
    }
    if enabled("mac") {
        if let Some(mac) = &rt.mac {
            runtime_config.insert("mac".to_string(), json!(mac));
        }
    }
    if !runtime_config.is_empty() {
        conf.insert("runtimeConfig".to_string(), Value::Object(runtime_config));
    }
    Value::Object(conf)
}

fn port_mapping_json(p: &PortMapping) -> Value {
    let mut m = json!({
        "hostPort": p.host_port,
        "containerPort": p.container_port,
        "protocol": p.protocol,
    });
    if !p.host_ip.is_empty() && p.host_ip != "0.0.0.0" {
        m["hostIP"] = json!(p.host_ip);
    }
    m
}

/// Pull addresses, gateway and MAC out of a CNI result (0.3.x or 1.x).
fn parse_result(raw: Value) -> CniResult {
    let mut result = CniResult::default();
    if let Some(ips) = raw.get("ips").and_then(Value::as_array) {
        for ip in ips {
            if let Some(address) = ip.get("address").and_then(Value::as_str) {
                result.ips.push(address.to_string());
            }
            if result.gateway.is_none() {
                result.gateway = ip.get("gateway").and_then(Value::as_str).map(String::from);
            }
        }
    }
    result.mac = raw
        .get("interfaces")
        .and_then(Value::as_array)
        .and_then(|ifaces| {
            ifaces
                .iter()
                .find(|i| i.get("sandbox").is_some())
                .or_else(|| ifaces.first())
        })
        .and_then(|i| i.get("mac"))
        .and_then(Value::as_str)
        .map(String::from);
    result.raw = raw;
    result
}

#[async_trait]
impl NetworkPlugin for CniExec {
    async fn add(&self, conflist: &Value, rt: &CniRuntimeConf) -> Result<CniResult> {
        if rt.netns.is_none() {
            return Err(BoxError::invalid("CNI ADD requires a network namespace"));
        }
        let mut prev = Value::Null;
        for plugin in plugins(conflist)? {
            let out = self.invoke("ADD", plugin, conflist, Some(&prev), rt).await?;
            if !out.is_null() {
                prev = out;
            }
        }
        Ok(parse_result(prev))
    }

    async fn del(&self, conflist: &Value, rt: &CniRuntimeConf) -> Result<()> {
        let mut first_err = None;
        for plugin in plugins(conflist)?.iter().rev() {
            if let Err(e) = self.invoke("DEL", plugin, conflist, None, rt).await {
                tracing::warn!(container = %rt.container_id, error = %e, "CNI DEL failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn check(&self, conflist: &Value, rt: &CniRuntimeConf) -> Result<()> {
        for plugin in plugins(conflist)? {
            self.invoke("CHECK", plugin, conflist, None, rt).await?;
        }
        Ok(())
    }
}
