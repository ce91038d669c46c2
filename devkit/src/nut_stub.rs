/*!
Fake NUT server for tests without a real upsd.

Speaks USERNAME, PASSWORD, LIST UPS, LIST VAR and LOGOUT over TCP on
127.0.0.1. Variables can be changed while the server runs, so a test can
flip a UPS from mains to battery between two requests.
*/

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;
use upswake_kernel::config::NutSource;

#[derive(Default)]
struct Ups {
    description: String,
    vars: BTreeMap<String, String>,
}

struct State {
    username: String,
    password: String,
    ups: BTreeMap<String, Ups>,
}

pub struct FakeNutServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    sessions: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeNutServer {
    /// Starts listening on an ephemeral port. Only `username`/`password` log in.
    pub async fn start(username: &str, password: &str) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(State {
            username: username.to_string(),
            password: password.to_string(),
            ups: BTreeMap::new(),
        }));
        let sessions = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let state = state.clone();
            let sessions = sessions.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    sessions.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, state.clone()));
                }
            }
        });

        debug!(%addr, "fake upsd listening");
        Ok(Self {
            addr,
            state,
            sessions,
            task,
        })
    }

    pub fn with_ups(self, name: &str, description: &str, vars: &[(&str, &str)]) -> Self {
        self.state.lock().ups.insert(
            name.to_string(),
            Ups {
                description: description.to_string(),
                vars: vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            },
        );
        self
    }

    pub fn set_var(&self, ups: &str, var: &str, value: &str) {
        self.state
            .lock()
            .ups
            .entry(ups.to_string())
            .or_default()
            .vars
            .insert(var.to_string(), value.to_string());
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections accepted so far.
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// A source pointing at this server with its own credentials.
    pub fn source(&self, name: &str) -> NutSource {
        let st = self.state.lock();
        NutSource {
            name: name.to_string(),
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            username: st.username.clone(),
            password: st.password.clone(),
            targets: vec![],
        }
    }
}

impl Drop for FakeNutServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<State>>) {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();
    let mut user: Option<String> = None;
    let mut pass: Option<String> = None;

    while let Ok(Some(line)) = lines.next_line().await {
        let words: Vec<&str> = line.split_whitespace().collect();
        let reply = match words.as_slice() {
            ["USERNAME", u] => {
                user = Some(u.to_string());
                "OK\n".to_string()
            }
            ["PASSWORD", p] => {
                pass = Some(p.to_string());
                "OK\n".to_string()
            }
            ["LOGOUT"] => {
                let _ = wr.write_all(b"OK Goodbye\n").await;
                return;
            }
            ["LIST", ..] if !logged_in(&state, &user, &pass) => "ERR ACCESS-DENIED\n".to_string(),
            ["LIST", "UPS"] => {
                let st = state.lock();
                let mut out = String::from("BEGIN LIST UPS\n");
                for (name, ups) in &st.ups {
                    out.push_str(&format!("UPS {name} \"{}\"\n", quote(&ups.description)));
                }
                out.push_str("END LIST UPS\n");
                out
            }
            ["LIST", "VAR", name] => {
                let st = state.lock();
                match st.ups.get(*name) {
                    Some(ups) => {
                        let mut out = format!("BEGIN LIST VAR {name}\n");
                        for (var, value) in &ups.vars {
                            out.push_str(&format!("VAR {name} {var} \"{}\"\n", quote(value)));
                        }
                        out.push_str(&format!("END LIST VAR {name}\n"));
                        out
                    }
                    None => "ERR UNKNOWN-UPS\n".to_string(),
                }
            }
            _ => "ERR UNKNOWN-COMMAND\n".to_string(),
        };
        if wr.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn logged_in(state: &Mutex<State>, user: &Option<String>, pass: &Option<String>) -> bool {
    let st = state.lock();
    user.as_deref() == Some(st.username.as_str()) && pass.as_deref() == Some(st.password.as_str())
}

fn quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
