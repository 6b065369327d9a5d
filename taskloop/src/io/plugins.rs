//! Tool discovery.
//!
//! Tools come from in-process [`ToolPlugin`]s and from TOML manifests that
//! describe command-backed tools. Discovery is tolerant (a broken source is
//! logged and skipped) and idempotent (a source that loaded once is not run
//! again by the same loader).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::io::config::EngineConfig;
use crate::io::registry::{ToolRegistry, ToolSpec};
use crate::io::tool::CommandTool;

/// Default stdout cap for manifest command tools.
pub const DEFAULT_TOOL_OUTPUT_LIMIT_BYTES: usize = 100_000;

/// An in-process bundle of tools.
pub trait ToolPlugin: Send + Sync {
    /// Stable identifier used for idempotent loading.
    fn id(&self) -> &str;

    fn register(&self, registry: &ToolRegistry) -> Result<()>;
}

/// A command tool declared in `<plugins_dir>/*.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Argv; elements may contain `{argument}` placeholders.
    pub command: Vec<String>,
    #[serde(default)]
    pub safe: bool,
    pub timeout_secs: Option<u64>,
    pub retries: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// JSON Schema for the arguments, written as a TOML table.
    pub schema: Option<Value>,
    pub output_limit_bytes: Option<usize>,
}

/// Values applied when a manifest leaves them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolDefaults {
    pub timeout: Duration,
    pub retries: u32,
    pub output_limit_bytes: usize,
}

impl ToolDefaults {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.default_tool_timeout(),
            retries: config.default_tool_retries,
            output_limit_bytes: DEFAULT_TOOL_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl ToolManifest {
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("parse tool manifest")
    }

    /// Fails on a zero `timeout_secs`; every attempt would time out at once.
    pub fn into_tool(self, defaults: &ToolDefaults) -> Result<(ToolSpec, CommandTool)> {
        if self.timeout_secs == Some(0) {
            bail!("tool {}: timeout_secs must be at least 1", self.name);
        }
        let timeout = self
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);
        let tool = CommandTool::new(
            self.command,
            timeout,
            self.output_limit_bytes
                .unwrap_or(defaults.output_limit_bytes),
        )?;
        let spec = ToolSpec::new(
            self.name,
            self.description,
            self.schema.unwrap_or_else(|| json!({"type": "object"})),
        )
        .safe(self.safe)
        .timeout(timeout)
        .retries(self.retries.unwrap_or(defaults.retries))
        .tags(self.tags);
        Ok((spec, tool))
    }
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Sources already loaded by an earlier pass.
    pub skipped: Vec<String>,
    /// Source id and error.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct PluginLoader {
    defaults: ToolDefaults,
    loaded: HashSet<String>,
}

impl PluginLoader {
    pub fn new(defaults: ToolDefaults) -> Self {
        Self {
            defaults,
            loaded: HashSet::new(),
        }
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.loaded.contains(id)
    }

    /// Register every plugin not yet loaded by this loader.
    pub fn load_plugins(
        &mut self,
        registry: &ToolRegistry,
        plugins: &[Arc<dyn ToolPlugin>],
    ) -> LoadReport {
        let mut report = LoadReport::default();
        for plugin in plugins {
            let id = format!("plugin:{}", plugin.id());
            self.load_source(&mut report, id, || plugin.register(registry));
        }
        report
    }

    /// Register the command tools described by `dir/*.toml`, in file name order.
    ///
    /// A missing directory is not an error.
    pub fn load_manifests(&mut self, registry: &ToolRegistry, dir: &Path) -> LoadReport {
        let mut report = LoadReport::default();
        if !dir.exists() {
            debug!(dir = %dir.display(), "plugins directory missing; nothing to load");
            return report;
        }
        let paths = match manifest_paths(dir) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(dir = %dir.display(), err = %err, "failed to scan plugins directory");
                report
                    .failed
                    .push((dir.display().to_string(), format!("{err:#}")));
                return report;
            }
        };
        for path in paths {
            let id = format!("manifest:{}", path.display());
            let defaults = self.defaults;
            self.load_source(&mut report, id, || {
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("read {}", path.display()))?;
                let manifest = ToolManifest::parse(&contents)
                    .with_context(|| format!("load {}", path.display()))?;
                let (spec, tool) = manifest.into_tool(&defaults)?;
                registry.register(spec, Arc::new(tool))?;
                Ok(())
            });
        }
        report
    }

    fn load_source(
        &mut self,
        report: &mut LoadReport,
        id: String,
        load: impl FnOnce() -> Result<()>,
    ) {
        if self.loaded.contains(&id) {
            debug!(source = %id, "already loaded; skipping");
            report.skipped.push(id);
            return;
        }
        match load() {
            Ok(()) => {
                info!(source = %id, "loaded tools");
                self.loaded.insert(id.clone());
                report.loaded.push(id);
            }
            Err(err) => {
                warn!(source = %id, err = %format!("{err:#}"), "failed to load tools; skipping");
                report.failed.push((id, format!("{err:#}")));
            }
        }
    }
}

fn manifest_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("read entry in {}", dir.display()))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
