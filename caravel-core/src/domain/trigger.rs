//! Trigger domain types
//!
//! A trigger describes the source-control push that caused a run. It is
//! immutable and carried unchanged from run creation through to the runner
//! payload.

use serde::{Deserialize, Serialize};

/// The originating push event for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// A push to (or removal of) a branch
    Branch {
        action: TriggerAction,
        source: TriggerSource,
        repo: TriggerRepo,
        branch: String,
        commit: TriggerCommit,
        sender: TriggerSender,
    },

    /// A push to a pull request head
    PullRequest {
        action: TriggerAction,
        source: TriggerSource,
        repo: TriggerRepo,
        number: u64,
        base: String,
        head: String,
        commit: TriggerCommit,
        sender: TriggerSender,
    },
}

impl Trigger {
    /// The repository the push happened in
    pub fn repo(&self) -> &TriggerRepo {
        match self {
            Trigger::Branch { repo, .. } => repo,
            Trigger::PullRequest { repo, .. } => repo,
        }
    }

    /// The commit at the tip of the push
    pub fn commit(&self) -> &TriggerCommit {
        match self {
            Trigger::Branch { commit, .. } => commit,
            Trigger::PullRequest { commit, .. } => commit,
        }
    }
}

/// What the sender did to the ref
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    Pushed,
    Removed,
}

/// Which git host produced the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Github,
}

/// Repository identity as reported by the git host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRepo {
    pub id: u64,
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCommit {
    pub id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSender {
    pub id: u64,
    pub username: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch_trigger() -> Trigger {
        Trigger::Branch {
            action: TriggerAction::Pushed,
            source: TriggerSource::Github,
            repo: TriggerRepo {
                id: 123,
                owner: "acme".to_string(),
                repo: "storefront".to_string(),
            },
            branch: "main".to_string(),
            commit: TriggerCommit {
                id: "f0e1d2c3".to_string(),
                message: "fix checkout".to_string(),
            },
            sender: TriggerSender {
                id: 9,
                username: "jo".to_string(),
            },
        }
    }

    #[test]
    fn test_branch_trigger_wire_shape() {
        let value = serde_json::to_value(branch_trigger()).unwrap();
        assert_eq!(value["type"], "branch");
        assert_eq!(value["action"], "pushed");
        assert_eq!(value["source"], "github");
        assert_eq!(value["repo"]["owner"], "acme");
        assert_eq!(value["commit"]["id"], "f0e1d2c3");
    }

    #[test]
    fn test_trigger_round_trip() {
        let trigger = branch_trigger();
        let json = serde_json::to_string(&trigger).unwrap();
        let back: Trigger = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trigger);
    }

    #[test]
    fn test_pull_request_tag() {
        let trigger = Trigger::PullRequest {
            action: TriggerAction::Pushed,
            source: TriggerSource::Github,
            repo: TriggerRepo {
                id: 1,
                owner: "acme".to_string(),
                repo: "storefront".to_string(),
            },
            number: 42,
            base: "main".to_string(),
            head: "feature/cart".to_string(),
            commit: TriggerCommit {
                id: "abc".to_string(),
                message: "wip".to_string(),
            },
            sender: TriggerSender {
                id: 9,
                username: "jo".to_string(),
            },
        };
        let value = serde_json::to_value(&trigger).unwrap();
        assert_eq!(value["type"], "pull_request");
        assert_eq!(value["number"], 42);
    }
}
