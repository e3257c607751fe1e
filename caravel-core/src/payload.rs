//! Runner invocation payloads
//!
//! The JSON document dispatched to a runner, tagged by the `warm` flag. Warm
//! invocations carry only what the bootstrap needs to stay hot; real runs
//! carry the full deployment context.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::runner::Engine;
use crate::domain::trigger::Trigger;

/// Temporary credentials for the customer account, forwarded to the runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
}

/// Location of the versioned build-script bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildspecSource {
    pub version: String,
    pub bucket: String,
}

/// Payload dispatched to a runner
///
/// Serialized untagged; the two variants are told apart by the fields they
/// carry, with `warm` kept explicit for the runner-side bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunnerPayload {
    Run(RunPayload),
    Warm(WarmPayload),
}

impl RunnerPayload {
    pub fn warm(clone_url: String, buildspec: BuildspecSource, credentials: Credentials) -> Self {
        RunnerPayload::Warm(WarmPayload {
            warm: true,
            clone_url,
            buildspec,
            credentials,
        })
    }

    pub fn is_warm(&self) -> bool {
        matches!(self, RunnerPayload::Warm(_))
    }

    pub fn buildspec(&self) -> &BuildspecSource {
        match self {
            RunnerPayload::Run(payload) => &payload.buildspec,
            RunnerPayload::Warm(payload) => &payload.buildspec,
        }
    }
}

/// Full deployment payload (`warm: false`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPayload {
    pub warm: bool,
    pub engine: Engine,
    pub run_id: Uuid,
    pub workspace_id: Uuid,
    pub state_update_id: Uuid,

    /// Target stage name
    pub stage: String,

    /// Merged deployment environment for the stage
    pub env: HashMap<String, String>,

    pub clone_url: String,
    pub buildspec: BuildspecSource,
    pub credentials: Credentials,
    pub trigger: Trigger,
}

impl RunPayload {
    pub fn into_payload(mut self) -> RunnerPayload {
        self.warm = false;
        RunnerPayload::Run(self)
    }
}

/// Keep-alive payload (`warm: true`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmPayload {
    pub warm: bool,
    pub clone_url: String,
    pub buildspec: BuildspecSource,
    pub credentials: Credentials,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trigger::{
        TriggerAction, TriggerCommit, TriggerRepo, TriggerSender, TriggerSource,
    };

    fn credentials() -> Credentials {
        Credentials {
            access_key_id: "AKIA".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: "token".to_string(),
        }
    }

    fn buildspec() -> BuildspecSource {
        BuildspecSource {
            version: "v42".to_string(),
            bucket: "caravel-buildspec".to_string(),
        }
    }

    fn run_payload() -> RunnerPayload {
        RunPayload {
            warm: true, // overwritten by into_payload
            engine: Engine::Lambda,
            run_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            state_update_id: Uuid::new_v4(),
            stage: "production".to_string(),
            env: HashMap::from([("REGION".to_string(), "us-east-1".to_string())]),
            clone_url: "https://github.com/acme/storefront.git".to_string(),
            buildspec: buildspec(),
            credentials: credentials(),
            trigger: Trigger::Branch {
                action: TriggerAction::Pushed,
                source: TriggerSource::Github,
                repo: TriggerRepo {
                    id: 1,
                    owner: "acme".to_string(),
                    repo: "storefront".to_string(),
                },
                branch: "main".to_string(),
                commit: TriggerCommit {
                    id: "abc".to_string(),
                    message: "deploy".to_string(),
                },
                sender: TriggerSender {
                    id: 1,
                    username: "jo".to_string(),
                },
            },
        }
        .into_payload()
    }

    #[test]
    fn test_run_payload_wire_shape() {
        let value = serde_json::to_value(run_payload()).unwrap();
        assert_eq!(value["warm"], false);
        assert_eq!(value["engine"], "lambda");
        assert!(value["runId"].is_string());
        assert!(value["stateUpdateId"].is_string());
        assert_eq!(value["env"]["REGION"], "us-east-1");
        assert_eq!(value["buildspec"]["version"], "v42");
        assert_eq!(value["credentials"]["accessKeyId"], "AKIA");
    }

    #[test]
    fn test_warm_payload_wire_shape() {
        let payload = RunnerPayload::warm(
            "https://github.com/acme/storefront.git".to_string(),
            buildspec(),
            credentials(),
        );
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["warm"], true);
        assert!(value.get("runId").is_none());
        assert!(value.get("trigger").is_none());
    }

    #[test]
    fn test_untagged_round_trip_picks_variant() {
        let run = run_payload();
        let json = serde_json::to_string(&run).unwrap();
        let back: RunnerPayload = serde_json::from_str(&json).unwrap();
        assert!(!back.is_warm());

        let warm = RunnerPayload::warm(
            "https://github.com/acme/storefront.git".to_string(),
            buildspec(),
            credentials(),
        );
        let json = serde_json::to_string(&warm).unwrap();
        let back: RunnerPayload = serde_json::from_str(&json).unwrap();
        assert!(back.is_warm());
    }
}
