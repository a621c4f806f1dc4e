// src/types.rs

//! Identifiers shared by every component: units, layers and pipeline keys.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]+$").expect("valid label regex"));

/// Validate a BIDS label after stripping `prefix` (e.g. `sub-`).
fn parse_label(raw: &str, prefix: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let label = trimmed.strip_prefix(prefix).unwrap_or(trimmed);
    if LABEL_RE.is_match(label) {
        Ok(label.to_string())
    } else {
        Err(format!(
            "invalid label '{trimmed}' (expected alphanumerics, optionally prefixed by '{prefix}')"
        ))
    }
}

/// Participant label without the `sub-` prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn label(&self) -> &str {
        &self.0
    }

    /// Directory name used in BIDS layouts (`sub-<label>`).
    pub fn dir_name(&self) -> String {
        format!("sub-{}", self.0)
    }
}

impl FromStr for ParticipantId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_label(s, "sub-").map(ParticipantId)
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.dir_name()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Session label without the `ses-` prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn label(&self) -> &str {
        &self.0
    }

    pub fn dir_name(&self) -> String {
        format!("ses-{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_label(s, "ses-").map(SessionId)
    }
}

impl TryFrom<String> for SessionId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.dir_name()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ses-{}", self.0)
    }
}

/// A (participant, session) pair: the atomic tracked entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId {
    pub participant: ParticipantId,
    pub session: SessionId,
}

impl UnitId {
    pub fn new(participant: ParticipantId, session: SessionId) -> Self {
        Self {
            participant,
            session,
        }
    }

    /// Parse both labels, accepting either bare or prefixed forms.
    pub fn parse(participant: &str, session: &str) -> Result<Self, String> {
        Ok(Self::new(participant.parse()?, session.parse()?))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.participant, self.session)
    }
}

/// Identifies one registered pipeline version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PipelineKey {
    pub name: String,
    pub version: String,
}

impl PipelineKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Column name used for this pipeline in the status table.
    pub fn column_name(&self) -> String {
        format!("processed:{}:{}", self.name, self.version)
    }
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// One layer of the on-disk dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Layer {
    /// Raw source data as delivered by the ingestion process.
    Source,
    /// BIDS-organized data.
    Bids,
    /// Derivatives of one pipeline version.
    Derivative(PipelineKey),
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Source => write!(f, "source"),
            Layer::Bids => write!(f, "bids"),
            Layer::Derivative(key) => write!(f, "derivative({key})"),
        }
    }
}

/// Parse a duration string like `"500ms"`, `"30s"`, `"15m"`, `"6h"` or `"2d"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        "d" => Ok(Duration::from_secs(value * 60 * 60 * 24)),
        other => Err(format!(
            "invalid duration unit '{other}' (expected ms, s, m, h or d)"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_accept_prefixed_and_bare_forms() {
        let a: ParticipantId = "sub-01".parse().unwrap();
        let b: ParticipantId = "01".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "sub-01");
        assert_eq!(a.label(), "01");
    }

    #[test]
    fn labels_reject_separators() {
        assert!("sub-01_x".parse::<ParticipantId>().is_err());
        assert!("".parse::<SessionId>().is_err());
        assert!("ses-".parse::<SessionId>().is_err());
    }

    #[test]
    fn durations_parse_all_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("6h").unwrap(), Duration::from_secs(21_600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10w").is_err());
    }
}
