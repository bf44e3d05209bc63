use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One named slot of policy code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Filter,
    Initialize,
    Check,
    Notify,
    Success,
    Fail,
}

impl Stage {
    /// Every stage, in life-cycle order.
    pub const ALL: [Stage; 6] = [
        Stage::Filter,
        Stage::Initialize,
        Stage::Check,
        Stage::Notify,
        Stage::Success,
        Stage::Fail,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Filter => "filter",
            Stage::Initialize => "initialize",
            Stage::Check => "check",
            Stage::Notify => "notify",
            Stage::Success => "success",
            Stage::Fail => "fail",
        }
    }

    /// Names bound as arguments of the implicit stage function, besides one
    /// handle per connected platform.
    ///
    /// The governance client is scoped to a proposal, and the filter stage may
    /// run before one exists, so `metagov` is absent there.
    pub fn context_names(self) -> &'static [&'static str] {
        match self {
            Stage::Filter => &["action", "policy", "proposal", "logger", "variables"],
            _ => &[
                "action",
                "policy",
                "proposal",
                "logger",
                "variables",
                "metagov",
            ],
        }
    }

    /// Context names plus the given platform handle names.
    pub fn arguments<S: AsRef<str>>(self, platforms: &[S]) -> Vec<String> {
        let mut args: Vec<String> = self.context_names().iter().map(|s| s.to_string()).collect();
        for p in platforms {
            let p = p.as_ref();
            if !args.iter().any(|a| a == p) {
                args.push(p.to_owned());
            }
        }
        args
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_has_no_governance_client() {
        assert!(!Stage::Filter.context_names().contains(&"metagov"));
        assert!(Stage::Check.context_names().contains(&"metagov"));
    }

    #[test]
    fn arguments_append_platforms_once() {
        let args = Stage::Notify.arguments(&["slack", "slack", "loomio"]);
        assert_eq!(args.iter().filter(|a| *a == "slack").count(), 1);
        assert!(args.contains(&"loomio".to_string()));
    }

    #[test]
    fn parses_stage_names() {
        assert_eq!("check".parse::<Stage>().unwrap(), Stage::Check);
        assert!("teardown".parse::<Stage>().is_err());
    }
}
