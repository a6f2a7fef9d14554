//! Client for the Kew POWO name-matching service.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use wcvp_taxo_core::{LookupError, NameMatcher};

use crate::config::KewMatchConfig;

const SCIENTIFIC_NAME_HEADER: &str = "Scientific Name";

pub struct KewNameMatch {
    agent: ureq::Agent,
    url: String,
}

#[derive(Debug, Deserialize)]
struct MatchReply {
    stats: MatchStats,
    #[serde(default)]
    records: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct MatchStats {
    #[serde(default)]
    matched: u64,
}

impl KewNameMatch {
    #[must_use]
    pub fn new(config: &KewMatchConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self { agent, url: config.url.trim().to_string() }
    }
}

impl NameMatcher for KewNameMatch {
    fn lookup(&self, name: &str) -> Result<Option<String>, LookupError> {
        let body = serde_json::json!({
            "column": 0,
            "headers": false,
            "outputAllColumns": true,
            "currentChunk": 0,
            "data": [[name]]
        });

        let response = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_json(body)
            .map_err(|err| LookupError::Transport(err.to_string()))?;
        let reply: MatchReply =
            response.into_json().map_err(|err| LookupError::Decode(err.to_string()))?;

        let matched = scientific_name(&reply)?;
        tracing::debug!(query = name, matched = ?matched, "kew name match");
        Ok(matched)
    }
}

// `records[0]` is the header row and `records[1]` the values of the first match.
fn scientific_name(reply: &MatchReply) -> Result<Option<String>, LookupError> {
    if reply.stats.matched == 0 {
        return Ok(None);
    }

    let (Some(headers), Some(values)) = (reply.records.first(), reply.records.get(1)) else {
        return Err(LookupError::Decode("matched reply carries no record rows".to_string()));
    };
    let Some(index) =
        headers.iter().position(|header| header.as_str() == Some(SCIENTIFIC_NAME_HEADER))
    else {
        return Err(LookupError::Decode(format!(
            "matched reply has no `{SCIENTIFIC_NAME_HEADER}` column"
        )));
    };

    Ok(values
        .get(index)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToString::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(json: &str) -> MatchReply {
        match serde_json::from_str(json) {
            Ok(reply) => reply,
            Err(err) => panic!("fixture reply should parse: {err}"),
        }
    }

    #[test]
    fn matched_reply_yields_scientific_name() {
        let body = r#"{
            "stats": {"submitted": 1, "matched": 1},
            "records": [
                ["Submitted Name", "Scientific Name", "Authors", "IPNI ID"],
                ["Combretum mussaendiflora", "Combretum mussaendiflorum", "Engl. & Diels", "170752-1"]
            ]
        }"#;
        let name = scientific_name(&reply(body));
        assert_eq!(name, Ok(Some("Combretum mussaendiflorum".to_string())));
    }

    #[test]
    fn unmatched_reply_is_no_match() {
        let body = r#"{"stats": {"submitted": 1, "matched": 0}, "records": []}"#;
        assert_eq!(scientific_name(&reply(body)), Ok(None));
    }

    #[test]
    fn malformed_matched_reply_is_a_decode_error() {
        let no_rows = r#"{"stats": {"matched": 1}}"#;
        assert!(matches!(scientific_name(&reply(no_rows)), Err(LookupError::Decode(_))));

        let no_column = r#"{"stats": {"matched": 1}, "records": [["Name"], ["Rosa canina"]]}"#;
        assert!(matches!(scientific_name(&reply(no_column)), Err(LookupError::Decode(_))));
    }

    #[test]
    fn unreachable_service_is_a_transport_error() {
        let matcher = KewNameMatch::new(&KewMatchConfig {
            url: "http://127.0.0.1:9/api/v2/powo/csv".to_string(),
            timeout_secs: 2,
        });
        assert!(matches!(matcher.lookup("Rosa canina"), Err(LookupError::Transport(_))));
    }
}
