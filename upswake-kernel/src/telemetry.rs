//! UPS telemetry retrieval over the NUT (Network UPS Tools) protocol.
//!
//! One session per fetch: log in, `LIST UPS`, `LIST VAR` for every unit,
//! `LOGOUT`. The result is flattened into JSON for the policy engine:
//!
//! ```json
//! {"ups": [{"name": "rack", "description": "APC",
//!           "variables": {"battery.charge": 100, "ups.status": "OL"}}]}
//! ```

use crate::config::NutSource;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out talking to {addr}")]
    Timeout { addr: String },
    #[error("{addr} refused credentials: {code}")]
    Access { addr: String, code: String },
    #[error("{addr} answered ERR {code}")]
    Server { addr: String, code: String },
    #[error("unexpected reply from {addr}: {line:?}")]
    Protocol { addr: String, line: String },
    #[error("i/o error with {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode telemetry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Fetches a JSON snapshot of a UPS source.
#[async_trait]
pub trait TelemetryClient: Send + Sync {
    async fn fetch_json(&self, source: &NutSource) -> Result<String, TelemetryError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telemetry {
    pub ups: Vec<UpsSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsSnapshot {
    pub name: String,
    pub description: String,
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct NutClient {
    timeout: Duration,
}

impl NutClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn fetch(&self, source: &NutSource) -> Result<Telemetry, TelemetryError> {
        let addr = format!("{}:{}", source.host, source.effective_port());
        match tokio::time::timeout(self.timeout, session(&addr, source)).await {
            Ok(res) => res,
            Err(_) => Err(TelemetryError::Timeout { addr }),
        }
    }
}

#[async_trait]
impl TelemetryClient for NutClient {
    async fn fetch_json(&self, source: &NutSource) -> Result<String, TelemetryError> {
        let telemetry = self.fetch(source).await?;
        Ok(serde_json::to_string(&telemetry)?)
    }
}

async fn session(addr: &str, source: &NutSource) -> Result<Telemetry, TelemetryError> {
    let stream = TcpStream::connect((source.host.as_str(), source.effective_port()))
        .await
        .map_err(|e| TelemetryError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
    let mut conn = Conn {
        addr,
        stream: BufReader::new(stream),
    };

    if !source.username.is_empty() {
        conn.send(&format!("USERNAME {}", source.username)).await?;
        conn.expect_ok().await?;
    }
    if !source.password.is_empty() {
        conn.send(&format!("PASSWORD {}", source.password)).await?;
        conn.expect_ok().await?;
    }

    let mut telemetry = Telemetry::default();
    for line in conn.list("UPS").await? {
        let words = split_words(&line);
        let [kind, name, rest @ ..] = words.as_slice() else {
            return Err(conn.protocol(&line));
        };
        if kind != "UPS" {
            return Err(conn.protocol(&line));
        }
        telemetry.ups.push(UpsSnapshot {
            name: name.clone(),
            description: rest.first().cloned().unwrap_or_default(),
            variables: Map::new(),
        });
    }

    for ups in &mut telemetry.ups {
        for line in conn.list(&format!("VAR {}", ups.name)).await? {
            let words = split_words(&line);
            let [kind, _ups, var, value, ..] = words.as_slice() else {
                return Err(conn.protocol(&line));
            };
            if kind != "VAR" {
                return Err(conn.protocol(&line));
            }
            ups.variables.insert(var.clone(), typed_value(value));
        }
        debug!(
            source = %source.name,
            ups = %ups.name,
            vars = ups.variables.len(),
            "fetched UPS variables"
        );
    }

    // best effort, the server may already have dropped us
    if conn.send("LOGOUT").await.is_ok() {
        let _ = conn.read_line().await;
    }
    Ok(telemetry)
}

struct Conn<'a> {
    addr: &'a str,
    stream: BufReader<TcpStream>,
}

impl Conn<'_> {
    async fn send(&mut self, cmd: &str) -> Result<(), TelemetryError> {
        let line = format!("{cmd}\n");
        self.stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.io(e))
    }

    async fn read_line(&mut self) -> Result<String, TelemetryError> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await.map_err(|e| self.io(e))?;
        if n == 0 {
            return Err(self.protocol("<connection closed>"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn expect_ok(&mut self) -> Result<(), TelemetryError> {
        let line = self.read_line().await?;
        if line.starts_with("OK") {
            Ok(())
        } else {
            Err(self.reply_error(&line))
        }
    }

    /// `LIST <what>` and the lines between `BEGIN LIST <what>` and `END LIST <what>`.
    async fn list(&mut self, what: &str) -> Result<Vec<String>, TelemetryError> {
        self.send(&format!("LIST {what}")).await?;
        let begin = self.read_line().await?;
        if begin != format!("BEGIN LIST {what}") {
            return Err(self.reply_error(&begin));
        }
        let end = format!("END LIST {what}");
        let mut out = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == end {
                return Ok(out);
            }
            out.push(line);
        }
    }

    fn reply_error(&self, line: &str) -> TelemetryError {
        let addr = self.addr.to_string();
        match line.strip_prefix("ERR ") {
            Some(code) => {
                let code = code.split_whitespace().next().unwrap_or_default().to_string();
                match code.as_str() {
                    "ACCESS-DENIED" | "USERNAME-REQUIRED" | "PASSWORD-REQUIRED" | "INVALID-USERNAME"
                    | "INVALID-PASSWORD" => TelemetryError::Access { addr, code },
                    _ => TelemetryError::Server { addr, code },
                }
            }
            None => self.protocol(line),
        }
    }

    fn protocol(&self, line: &str) -> TelemetryError {
        TelemetryError::Protocol {
            addr: self.addr.to_string(),
            line: line.to_string(),
        }
    }

    fn io(&self, source: std::io::Error) -> TelemetryError {
        TelemetryError::Io {
            addr: self.addr.to_string(),
            source,
        }
    }
}

/// Splits a NUT reply into words; double quotes group, `\"` and `\\` escape.
pub fn split_words(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut pending = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    cur.push(next);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending {
                    out.push(std::mem::take(&mut cur));
                    pending = false;
                }
            }
            c => {
                cur.push(c);
                pending = true;
            }
        }
    }
    if pending {
        out.push(cur);
    }
    out
}

/// Numeric-looking values become JSON numbers so rules can compare them.
fn typed_value(raw: &str) -> Value {
    let s = raw.trim();
    let leading_zero = s.len() > 1 && s.starts_with('0') && !s.starts_with("0.");
    if !leading_zero {
        if let Ok(i) = s.parse::<i64>() {
            return Value::Number(i.into());
        }
        let float = s.parse::<f64>().ok().filter(|f| f.is_finite());
        if let Some(n) = float.and_then(Number::from_f64) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}
