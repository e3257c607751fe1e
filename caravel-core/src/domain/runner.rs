//! Runner domain types
//!
//! A runner is a reusable, long-lived handle to provisioned compute in the
//! customer's AWS account. Its identity is the tuple (workspace, account,
//! repo, region, engine, type fingerprint); the orchestrator reuses a runner
//! whenever a run asks for the same fingerprint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution backend for a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Lambda,
    Codebuild,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Lambda => "lambda",
            Engine::Codebuild => "codebuild",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lambda" => Some(Engine::Lambda),
            "codebuild" => Some(Engine::Codebuild),
            _ => None,
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architecture of the runner image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "x86_64" => Some(Architecture::X86_64),
            "arm64" => Some(Architecture::Arm64),
            _ => None,
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute tier for the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compute {
    Small,
    Medium,
    Large,
    Xlarge,
}

impl Compute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compute::Small => "small",
            Compute::Medium => "medium",
            Compute::Large => "large",
            Compute::Xlarge => "xlarge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "small" => Some(Compute::Small),
            "medium" => Some(Compute::Medium),
            "large" => Some(Compute::Large),
            "xlarge" => Some(Compute::Xlarge),
            _ => None,
        }
    }
}

impl std::fmt::Display for Compute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloud resource handles backing a runner, tagged by engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "engine", content = "properties", rename_all = "lowercase")]
pub enum Resource {
    Lambda { role: String, function: String },
    Codebuild { role: String, project: String },
}

impl Resource {
    pub fn engine(&self) -> Engine {
        match self {
            Resource::Lambda { .. } => Engine::Lambda,
            Resource::Codebuild { .. } => Engine::Codebuild,
        }
    }

    /// IAM role ARN backing the resource
    pub fn role(&self) -> &str {
        match self {
            Resource::Lambda { role, .. } => role,
            Resource::Codebuild { role, .. } => role,
        }
    }
}

/// Runner selection requested by a run's deploy config
///
/// All fields are optional; the orchestrator fills in defaults before
/// computing the identity fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub engine: Option<Engine>,
    pub architecture: Option<Architecture>,
    pub image: Option<String>,
    pub compute: Option<Compute>,
    pub timeout_minutes: Option<u32>,
}

/// Runner selection with every field defaulted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRunnerConfig {
    pub engine: Engine,
    pub architecture: Architecture,
    pub image: String,
    pub compute: Compute,
    pub timeout_minutes: Option<u32>,
}

impl ResolvedRunnerConfig {
    /// Identity fingerprint for runner reuse
    ///
    /// Two runs asking for the same engine, architecture, image and compute
    /// tier must map to the same fingerprint so they share a runner.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.engine, self.architecture, self.compute, self.image
        )
    }

    /// Inverse of [`fingerprint`](Self::fingerprint); timeout is not part of
    /// the identity and comes back unset
    pub fn from_fingerprint(s: &str) -> Option<Self> {
        let mut parts = s.splitn(4, ':');
        let engine = Engine::parse(parts.next()?)?;
        let architecture = Architecture::parse(parts.next()?)?;
        let compute = Compute::parse(parts.next()?)?;
        let image = parts.next()?.to_string();
        Some(ResolvedRunnerConfig {
            engine,
            architecture,
            image,
            compute,
            timeout_minutes: None,
        })
    }
}

/// A provisioned runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub aws_account_id: Uuid,
    pub app_repo_id: Uuid,
    pub region: String,
    pub engine: Engine,

    /// Identity fingerprint (see [`ResolvedRunnerConfig::fingerprint`])
    pub runner_type: String,

    /// Cloud handles; `None` while another process is mid-provisioning
    pub resource: Option<Resource>,

    /// Name of the active warm-keep schedule, if any
    pub warmer: Option<String>,

    /// Last time a real run was dispatched to this runner
    pub time_run: Option<DateTime<Utc>>,

    pub time_created: DateTime<Utc>,
    pub time_updated: DateTime<Utc>,
}

/// "Stage S last used runner R at time T" record
///
/// Used to decide whether a runner is still active enough to keep warm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerUsage {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub runner_id: Uuid,
    pub stage_id: Uuid,
    pub time_run: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved() -> ResolvedRunnerConfig {
        ResolvedRunnerConfig {
            engine: Engine::Lambda,
            architecture: Architecture::Arm64,
            image: "registry.example.com/runner:arm64-1".to_string(),
            compute: Compute::Small,
            timeout_minutes: None,
        }
    }

    #[test]
    fn test_fingerprint_is_pure() {
        assert_eq!(resolved().fingerprint(), resolved().fingerprint());
        assert_eq!(
            resolved().fingerprint(),
            "lambda:arm64:small:registry.example.com/runner:arm64-1"
        );
    }

    #[test]
    fn test_fingerprint_distinguishes_compute() {
        let mut other = resolved();
        other.compute = Compute::Large;
        assert_ne!(resolved().fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_timeout_does_not_affect_identity() {
        let mut other = resolved();
        other.timeout_minutes = Some(45);
        assert_eq!(resolved().fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_fingerprint_round_trip() {
        // the image segment may itself contain colons
        let config = resolved();
        let back = ResolvedRunnerConfig::from_fingerprint(&config.fingerprint()).unwrap();
        assert_eq!(back, config);
        assert!(ResolvedRunnerConfig::from_fingerprint("bogus").is_none());
        assert!(ResolvedRunnerConfig::from_fingerprint("lambda:x86_64").is_none());
    }

    #[test]
    fn test_engine_round_trip() {
        for engine in [Engine::Lambda, Engine::Codebuild] {
            assert_eq!(Engine::parse(engine.as_str()), Some(engine));
        }
        assert_eq!(Engine::parse("fargate"), None);
    }

    #[test]
    fn test_resource_wire_shape() {
        let resource = Resource::Codebuild {
            role: "arn:aws:iam::123456789012:role/runner".to_string(),
            project: "arn:aws:codebuild:us-east-1:123456789012:project/runner".to_string(),
        };
        let value = serde_json::to_value(&resource).unwrap();
        assert_eq!(value["engine"], "codebuild");
        assert!(value["properties"]["project"].is_string());

        let back: Resource = serde_json::from_value(value).unwrap();
        assert_eq!(back, resource);
    }
}
