/**
 * EVALUATOR - Decides whether a MAC address may be woken right now
 *
 * For every UPS source owning a target with the requested MAC, telemetry is
 * fetched once and each matching target's rules are walked in order
 * (first true wins for that target). Outcomes of duplicate MACs are OR-ed:
 * a later "allowed" is never lost to an earlier "not allowed".
 *
 * Telemetry and policy failures abort the whole call and stay distinct so
 * operators can tell "can't reach the UPS" from "the rule is broken".
 * The evaluator never sends packets; callers look at `allowed`.
 */

use crate::config::{Config, WakeTarget};
use crate::models::EvaluationResult;
use crate::policy::{PolicyEngine, PolicyError};
use crate::telemetry::{TelemetryClient, TelemetryError};
use crate::wol::MacAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error("telemetry from {nut}: {error}")]
    Telemetry {
        nut: String,
        #[source]
        error: TelemetryError,
    },
    #[error("target {target}: {error}")]
    Policy {
        target: String,
        rule: String,
        #[source]
        error: PolicyError,
    },
}

#[derive(Clone)]
pub struct Evaluator {
    telemetry: Arc<dyn TelemetryClient>,
    policy: Arc<dyn PolicyEngine>,
}

impl Evaluator {
    pub fn new(telemetry: Arc<dyn TelemetryClient>, policy: Arc<dyn PolicyEngine>) -> Self {
        Self { telemetry, policy }
    }

    /// Walks every target whose MAC matches `mac`.
    ///
    /// Only sources that own a matching target are fetched, once each.
    /// An unknown MAC touches no source and returns a default result.
    pub async fn evaluate(
        &self,
        config: &Config,
        mac: &str,
    ) -> Result<EvaluationResult, EvaluateError> {
        let wanted = MacMatcher::new(mac);
        let mut result = EvaluationResult::default();

        for src in &config.nut_servers {
            let matching: Vec<&WakeTarget> =
                src.targets.iter().filter(|t| wanted.matches(&t.mac)).collect();
            if matching.is_empty() {
                continue;
            }

            let telemetry = self
                .telemetry
                .fetch_json(src)
                .await
                .map_err(|error| EvaluateError::Telemetry {
                    nut: src.name.clone(),
                    error,
                })?;

            for target in matching {
                result.found = true;
                let allowed = self.first_true(&telemetry, target).await?;
                debug!(source = %src.name, wake_target = %target.name, allowed, "target evaluated");

                if allowed && !result.allowed {
                    result.allowed = true;
                    result.target = Some(target.clone());
                } else if result.target.is_none() {
                    result.target = Some(target.clone());
                }
            }
        }

        info!(mac, found = result.found, allowed = result.allowed, "evaluation finished");
        Ok(result)
    }

    /// Empty rule lists never allow.
    async fn first_true(
        &self,
        telemetry: &str,
        target: &WakeTarget,
    ) -> Result<bool, EvaluateError> {
        for rule in &target.rules {
            let wrap = |error| EvaluateError::Policy {
                target: target.name.clone(),
                rule: rule.clone(),
                error,
            };
            self.policy.validate(rule).await.map_err(wrap)?;
            if self.policy.evaluate(telemetry, rule).await.map_err(wrap)? {
                debug!(wake_target = %target.name, rule = %rule, "rule allowed wake");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

struct MacMatcher<'a> {
    raw: &'a str,
    parsed: Option<MacAddr>,
}

impl<'a> MacMatcher<'a> {
    fn new(raw: &'a str) -> Self {
        Self {
            raw: raw.trim(),
            parsed: raw.parse().ok(),
        }
    }

    fn matches(&self, other: &str) -> bool {
        match (self.parsed, other.parse::<MacAddr>().ok()) {
            (Some(a), Some(b)) => a == b,
            _ => self.raw.eq_ignore_ascii_case(other.trim()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NutSource;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeTelemetry {
        fail: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TelemetryClient for FakeTelemetry {
        async fn fetch_json(&self, source: &NutSource) -> Result<String, TelemetryError> {
            self.calls.lock().push(source.name.clone());
            if self.fail.contains(&source.name) {
                return Err(TelemetryError::Timeout {
                    addr: source.host.clone(),
                });
            }
            Ok(format!(r#"{{"ups":[],"source":"{}"}}"#, source.name))
        }
    }

    /// Rule name -> verdict; `invalid` fails validation.
    struct FakePolicy {
        verdicts: HashMap<&'static str, bool>,
        evaluated: Mutex<Vec<String>>,
    }

    impl FakePolicy {
        fn new(verdicts: &[(&'static str, bool)]) -> Self {
            Self {
                verdicts: verdicts.iter().copied().collect(),
                evaluated: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PolicyEngine for FakePolicy {
        async fn validate(&self, rule: &str) -> Result<(), PolicyError> {
            if rule == "invalid" {
                return Err(PolicyError::Invalid {
                    rule: rule.into(),
                    reason: "bad package".into(),
                });
            }
            Ok(())
        }

        async fn evaluate(&self, _telemetry: &str, rule: &str) -> Result<bool, PolicyError> {
            self.evaluated.lock().push(rule.to_string());
            Ok(self.verdicts.get(rule).copied().unwrap_or(false))
        }
    }

    fn target(name: &str, mac: &str, rules: &[&str]) -> WakeTarget {
        WakeTarget {
            name: name.into(),
            mac: mac.into(),
            broadcast: Some("192.168.1.255".into()),
            port: 9,
            interval: "1m".into(),
            rules: rules.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn source(name: &str, targets: Vec<WakeTarget>) -> NutSource {
        NutSource {
            name: name.into(),
            host: "127.0.0.1".into(),
            port: 0,
            username: "u".into(),
            password: "p".into(),
            targets,
        }
    }

    fn evaluator(telemetry: Arc<FakeTelemetry>, policy: Arc<FakePolicy>) -> Evaluator {
        Evaluator::new(telemetry, policy)
    }

    const MAC: &str = "00:11:22:33:44:55";

    #[tokio::test]
    async fn test_single_allowed_target() {
        let cfg = Config {
            nut_servers: vec![source(
                "rack",
                vec![target("nas", MAC, &["no", "yes", "never-reached"])],
            )],
        };
        let verdicts = [("no", false), ("yes", true), ("never-reached", true)];
        let policy = Arc::new(FakePolicy::new(&verdicts));
        let ev = evaluator(Arc::default(), policy.clone());

        let res = ev.evaluate(&cfg, MAC).await.unwrap();
        assert!(res.found && res.allowed);
        assert_eq!(res.target.unwrap().name, "nas");
        assert_eq!(*policy.evaluated.lock(), vec!["no", "yes"]);
    }

    #[tokio::test]
    async fn test_unknown_mac() {
        let cfg = Config {
            nut_servers: vec![source("rack", vec![target("nas", MAC, &["yes"])])],
        };
        let telemetry = Arc::new(FakeTelemetry::default());
        let ev = evaluator(telemetry.clone(), Arc::new(FakePolicy::new(&[("yes", true)])));

        let res = ev.evaluate(&cfg, "66:77:88:99:aa:bb").await.unwrap();
        assert_eq!(res, EvaluationResult::default());
        assert!(telemetry.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_rules_never_allow() {
        let cfg = Config {
            nut_servers: vec![source("rack", vec![target("nas", MAC, &[])])],
        };
        let ev = evaluator(Arc::default(), Arc::new(FakePolicy::new(&[])));
        let res = ev.evaluate(&cfg, MAC).await.unwrap();
        assert!(res.found);
        assert!(!res.allowed);
        assert_eq!(res.target.unwrap().name, "nas");
    }

    #[tokio::test]
    async fn test_duplicate_macs_are_ored_in_any_order() {
        let deny = target("deny", MAC, &["no"]);
        let allow = target("allow", MAC, &["yes"]);
        let policy = || Arc::new(FakePolicy::new(&[("no", false), ("yes", true)]));

        for cfg in [
            Config {
                nut_servers: vec![
                    source("a", vec![deny.clone()]),
                    source("b", vec![allow.clone()]),
                ],
            },
            Config {
                nut_servers: vec![
                    source("b", vec![allow.clone()]),
                    source("a", vec![deny.clone()]),
                ],
            },
            Config {
                nut_servers: vec![source("a", vec![deny.clone(), allow.clone()])],
            },
        ] {
            let res = evaluator(Arc::default(), policy()).evaluate(&cfg, MAC).await.unwrap();
            assert!(res.found && res.allowed);
            assert_eq!(res.target.unwrap().name, "allow");
        }
    }

    #[tokio::test]
    async fn test_one_fetch_per_source() {
        let cfg = Config {
            nut_servers: vec![
                source(
                    "rack",
                    vec![
                        target("a", MAC, &["no"]),
                        target("b", MAC, &["no"]),
                        target("c", MAC, &["no"]),
                    ],
                ),
                source("closet", vec![target("d", "aa:aa:aa:aa:aa:aa", &["no"])]),
            ],
        };
        let telemetry = Arc::new(FakeTelemetry::default());
        let ev = evaluator(telemetry.clone(), Arc::new(FakePolicy::new(&[("no", false)])));
        ev.evaluate(&cfg, MAC).await.unwrap();
        assert_eq!(*telemetry.calls.lock(), vec!["rack"]);
    }

    #[tokio::test]
    async fn test_mac_comparison_ignores_case_and_separator() {
        let cfg = Config {
            nut_servers: vec![source("rack", vec![target("nas", "AA-BB-CC-DD-EE-FF", &["yes"])])],
        };
        let ev = evaluator(Arc::default(), Arc::new(FakePolicy::new(&[("yes", true)])));
        assert!(ev.evaluate(&cfg, "aa:bb:cc:dd:ee:ff").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_telemetry_failure_aborts() {
        let cfg = Config {
            nut_servers: vec![
                source("good", vec![target("allow", MAC, &["yes"])]),
                source("down", vec![target("other", MAC, &["yes"])]),
            ],
        };
        let telemetry = Arc::new(FakeTelemetry {
            fail: vec!["down".into()],
            ..Default::default()
        });
        let ev = evaluator(telemetry, Arc::new(FakePolicy::new(&[("yes", true)])));
        let err = ev.evaluate(&cfg, MAC).await.unwrap_err();
        assert!(matches!(err, EvaluateError::Telemetry { ref nut, .. } if nut == "down"), "{err}");
    }

    #[tokio::test]
    async fn test_invalid_rule_aborts_with_rule_name() {
        let cfg = Config {
            nut_servers: vec![source("rack", vec![target("nas", MAC, &["invalid", "yes"])])],
        };
        let ev = evaluator(Arc::default(), Arc::new(FakePolicy::new(&[("yes", true)])));
        match ev.evaluate(&cfg, MAC).await.unwrap_err() {
            EvaluateError::Policy { target, rule, .. } => {
                assert_eq!(target, "nas");
                assert_eq!(rule, "invalid");
            }
            other => panic!("unexpected {other}"),
        }
    }
}
