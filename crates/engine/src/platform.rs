//! Connected platforms and the handles policy code calls them through.
//!
//! A [`PlatformAdapter`] is supplied by each platform integration. The
//! [`PlatformRegistry`] lists which adapters a community has connected; the
//! context builder binds one handle per entry, named after the platform.

use std::collections::BTreeMap;
use std::sync::Arc;

use polity_sandbox::json::{from_json, to_json};
use polity_sandbox::{CallArgs, HostObject, RuntimeError, Value};
use polity_storage::{ActionRecord, CommunityId, PolicyStore, ProposalId};
use serde_json::json;
use tracing::debug;

use crate::host::{keywords_to_json, modify_proposal};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlatformError {
    #[error("call to '{endpoint}' failed: {message}")]
    Call { endpoint: String, message: String },

    #[error("platform '{0}' is not connected")]
    NotConnected(String),

    #[error("platform '{platform}' does not support {operation}")]
    Unsupported {
        platform: String,
        operation: &'static str,
    },
}

/// One platform integration, bound to one community.
///
/// Implementations own their authentication and retry behavior.
pub trait PlatformAdapter: Send + Sync {
    /// Handle name exposed to policy code, e.g. `"slack"`.
    fn name(&self) -> &str;

    /// Call a platform API endpoint and return the decoded response.
    fn make_call(
        &self,
        endpoint: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, PlatformError>;

    /// Carry out a governed action on the platform.
    fn execute(&self, action: &ActionRecord) -> Result<(), PlatformError>;

    /// Undo an action that already happened on the platform.
    fn revert(&self, action: &ActionRecord) -> Result<(), PlatformError>;

    fn post_message(
        &self,
        text: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, PlatformError> {
        let mut body = match params {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        body.insert("text".into(), json!(text));
        self.make_call("post_message", &serde_json::Value::Object(body))
    }

    /// Open a vote on the platform for a proposal. Returns the identifier of
    /// the post carrying the vote, if the platform made one.
    fn initiate_vote(
        &self,
        proposal: ProposalId,
        params: &serde_json::Value,
    ) -> Result<Option<String>, PlatformError> {
        let _ = (proposal, params);
        Err(PlatformError::Unsupported {
            platform: self.name().to_string(),
            operation: "initiate_vote",
        })
    }
}

/// Which adapters each community has connected.
#[derive(Default, Clone)]
pub struct PlatformRegistry {
    communities: BTreeMap<CommunityId, Vec<Arc<dyn PlatformAdapter>>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect an adapter, replacing an earlier one with the same name.
    pub fn register(&mut self, community: CommunityId, adapter: Arc<dyn PlatformAdapter>) {
        let connected = self.communities.entry(community).or_default();
        connected.retain(|a| a.name() != adapter.name());
        connected.push(adapter);
    }

    pub fn with(mut self, community: CommunityId, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.register(community, adapter);
        self
    }

    pub fn connected(&self, community: CommunityId) -> &[Arc<dyn PlatformAdapter>] {
        self.communities
            .get(&community)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, community: CommunityId, name: &str) -> Option<Arc<dyn PlatformAdapter>> {
        self.connected(community)
            .iter()
            .find(|a| a.name() == name)
            .cloned()
    }

    pub fn names(&self, community: CommunityId) -> Vec<String> {
        self.connected(community)
            .iter()
            .map(|a| a.name().to_string())
            .collect()
    }
}

// ──────────────────────────────────────────────
// Policy-facing handle
// ──────────────────────────────────────────────

/// The value bound under a platform's name. Vote calls are tied to the
/// proposal being evaluated.
pub(crate) struct PlatformHandle {
    pub adapter: Arc<dyn PlatformAdapter>,
    pub community: CommunityId,
    pub proposal: Option<ProposalId>,
    pub store: Arc<dyn PolicyStore>,
}

impl PlatformHandle {
    fn proposal_id(&self, method: &str) -> Result<ProposalId, RuntimeError> {
        self.proposal.ok_or_else(|| {
            RuntimeError::new(
                "RuntimeError",
                format!("{}() needs a saved proposal", method),
            )
        })
    }
}

impl HostObject for PlatformHandle {
    fn type_name(&self) -> &str {
        "Platform"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        match name {
            "name" | "platform" => Some(Value::from(self.adapter.name())),
            "community_id" => Some(Value::Int(self.community.0 as i64)),
            _ => None,
        }
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "make_call" | "post_message" | "initiate_vote")
    }

    fn call_method(&self, name: &str, args: CallArgs) -> Result<Value, RuntimeError> {
        let platform = self.adapter.name();
        match name {
            "make_call" => {
                args.at_most(2, "make_call")?;
                let endpoint = args.require(0, "endpoint", "make_call")?.expect_str("endpoint")?;
                let params = match args.get(1, "values") {
                    Some(v) => to_json(v)?,
                    None => json!({}),
                };
                debug!(platform, endpoint, "platform call from policy code");
                let response = self.adapter.make_call(endpoint, &params).map_err(platform_error)?;
                Ok(from_json(&response))
            }
            "post_message" => {
                args.at_most(1, "post_message")?;
                let text = args.require(0, "text", "post_message")?.expect_str("text")?;
                let params = keywords_to_json(&args, &["text"])?;
                let response = self
                    .adapter
                    .post_message(text, &params)
                    .map_err(platform_error)?;
                Ok(from_json(&response))
            }
            "initiate_vote" => {
                args.at_most(0, "initiate_vote")?;
                let proposal = self.proposal_id("initiate_vote")?;
                let params = keywords_to_json(&args, &[])?;
                let post = self
                    .adapter
                    .initiate_vote(proposal, &params)
                    .map_err(platform_error)?;
                if let Some(post) = &post {
                    modify_proposal(self.store.as_ref(), proposal, |p| {
                        p.community_post = Some(post.clone());
                        true
                    })?;
                }
                Ok(post.map(Value::Str).unwrap_or(Value::None))
            }
            _ => Err(RuntimeError::attribute_error(format!(
                "'Platform' object has no method '{}'",
                name
            ))),
        }
    }

    fn repr(&self) -> String {
        format!("<Platform {}>", self.adapter.name())
    }
}

fn platform_error(e: PlatformError) -> RuntimeError {
    RuntimeError::new("PlatformError", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl PlatformAdapter for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn make_call(
            &self,
            endpoint: &str,
            params: &serde_json::Value,
        ) -> Result<serde_json::Value, PlatformError> {
            Ok(json!({ "endpoint": endpoint, "params": params }))
        }

        fn execute(&self, _action: &ActionRecord) -> Result<(), PlatformError> {
            Ok(())
        }

        fn revert(&self, _action: &ActionRecord) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    #[test]
    fn registry_keeps_one_adapter_per_name() {
        let community = CommunityId(1);
        let registry = PlatformRegistry::new()
            .with(community, Arc::new(Named("slack")))
            .with(community, Arc::new(Named("github")))
            .with(community, Arc::new(Named("slack")));
        assert_eq!(registry.names(community), ["github", "slack"]);
        assert!(registry.get(community, "github").is_some());
        assert!(registry.get(CommunityId(2), "github").is_none());
        assert!(registry.connected(CommunityId(2)).is_empty());
    }

    #[test]
    fn post_message_goes_through_make_call() {
        let response = Named("slack")
            .post_message("hello", &json!({ "channel": "C1" }))
            .unwrap();
        assert_eq!(response["endpoint"], "post_message");
        assert_eq!(response["params"], json!({ "channel": "C1", "text": "hello" }));
    }

    #[test]
    fn votes_are_unsupported_by_default() {
        let err = Named("reddit")
            .initiate_vote(ProposalId(3), &json!({}))
            .unwrap_err();
        assert!(matches!(err, PlatformError::Unsupported { operation: "initiate_vote", .. }));
    }
}
