/*!
Rule directories and configs for tests.

`RuleDir` writes YAML rules into a temp directory and hands out a `RuleBook`
over it. `ConfigBuilder` assembles a valid `Config` without YAML.
*/

use anyhow::Result;
use std::path::Path;
use tempfile::TempDir;
use upswake_kernel::config::{Config, NutSource, WakeTarget};
use upswake_kernel::policy::RuleBook;
use upswake_kernel::wol::DEFAULT_WOL_PORT;

pub struct RuleDir {
    dir: TempDir,
}

impl RuleDir {
    pub fn new() -> Result<Self> {
        Ok(Self { dir: tempfile::tempdir()? })
    }

    /// Writes `<name>.yaml`.
    pub fn write(&self, name: &str, yaml: &str) -> Result<&Self> {
        std::fs::write(self.dir.path().join(format!("{name}.yaml")), yaml)?;
        Ok(self)
    }

    /// `always_true`, `always_false`, `on_mains` and `battery_ok` (charge >= 50).
    pub fn with_defaults(self) -> Result<Self> {
        self.write("always_true", "when: { always: true }\n")?;
        self.write("always_false", "when: { always: false }\n")?;
        self.write(
            "on_mains",
            concat!(
                "description: utility power present\n",
                "when:\n",
                "  variable: ups.status\n",
                "  op: contains\n",
                "  value: OL\n",
            ),
        )?;
        self.write(
            "battery_ok",
            concat!(
                "when:\n",
                "  all:\n",
                "    - { variable: battery.charge, op: gte, value: 50 }\n",
                "    - not: { variable: ups.status, op: contains, value: LB }\n",
            ),
        )?;
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn rule_book(&self) -> RuleBook {
        RuleBook::new(self.dir.path())
    }
}

pub struct ConfigBuilder {
    sources: Vec<NutSource>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self { sources: Vec::new() }
    }

    /// Adds a source with dummy credentials on localhost.
    pub fn source(mut self, name: &str) -> Self {
        self.sources.push(NutSource {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            username: "monuser".to_string(),
            password: "secret".to_string(),
            targets: vec![],
        });
        self
    }

    /// Adds a prepared source, e.g. from `FakeNutServer::source`.
    pub fn with_source(mut self, source: NutSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Adds a target to the last source.
    pub fn target(
        mut self,
        name: &str,
        mac: &str,
        broadcast: Option<&str>,
        interval: &str,
        rules: &[&str],
    ) -> Self {
        if self.sources.is_empty() {
            self = self.source("default");
        }
        if let Some(src) = self.sources.last_mut() {
            src.targets.push(WakeTarget {
                name: name.to_string(),
                mac: mac.to_string(),
                broadcast: broadcast.map(String::from),
                port: DEFAULT_WOL_PORT,
                interval: interval.to_string(),
                rules: rules.iter().map(|r| r.to_string()).collect(),
            });
        }
        self
    }

    pub fn build(self) -> Config {
        Config {
            nut_servers: self.sources,
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
