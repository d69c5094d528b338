//! Ordered step collections.
//!
//! A flow's steps live in a [`StepSequence`]: an ordered map from
//! [`OrderToken`] to [`Step`].  Rules enforced on every insertion:
//! 1. Order tokens are unique within the sequence.
//! 2. Step names are unique within the sequence.
//! 3. Step names are non-empty.
//!
//! Token ordering: tokens made only of ASCII digits compare numerically and
//! sort before every other token; all other tokens compare as strings.  A
//! numeric tie (`"01"` vs `"1"`) falls back to string order, so two tokens
//! compare equal only when they are the same string.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::{EngineError, Step};

// ---------------------------------------------------------------------------
// OrderToken
// ---------------------------------------------------------------------------

/// Position key of a step within a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderToken(String);

impl OrderToken {
    pub fn new(token: impl Into<String>) -> Result<Self, EngineError> {
        let token = token.into();
        if token.trim().is_empty() || token.trim() != token {
            return Err(EngineError::InvalidOrderToken(token));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        if self.0.bytes().all(|b| b.is_ascii_digit()) {
            self.0.parse().ok()
        } else {
            None
        }
    }
}

impl Ord for OrderToken {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for OrderToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OrderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OrderToken {
    type Err = EngineError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for OrderToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// StepSequence
// ---------------------------------------------------------------------------

/// The ordered `(token → step)` collection of a flow.
///
/// Serialises as a JSON object whose keys appear in execution order.
///
/// A sequence read out of the registry remembers the flow version it was
/// read at; [`FlowRegistry::set_steps`](crate::FlowRegistry::set_steps)
/// refuses it once the flow has moved on.  Equality ignores that version.
#[derive(Debug, Clone, Default)]
pub struct StepSequence {
    steps: BTreeMap<OrderToken, Step>,
    read_at: Option<u64>,
}

impl PartialEq for StepSequence {
    fn eq(&self, other: &Self) -> bool {
        self.steps == other.steps
    }
}

impl StepSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flow version this sequence was read at; `None` for a sequence built
    /// from scratch.
    pub fn read_at(&self) -> Option<u64> {
        self.read_at
    }

    pub(crate) fn mark_read_at(&mut self, version: u64) {
        self.read_at = Some(version);
    }

    /// Insert `step` at `token`.
    ///
    /// # Errors
    /// - [`EngineError::EmptyName`] if the step has no name.
    /// - [`EngineError::DuplicateOrderToken`] if `token` is taken.
    /// - [`EngineError::DuplicateStepName`] if another step has the same name.
    pub fn insert(&mut self, token: OrderToken, step: Step) -> Result<(), EngineError> {
        step.validate()?;
        if self.steps.contains_key(&token) {
            return Err(EngineError::DuplicateOrderToken(token.0));
        }
        if self.steps.values().any(|existing| existing.name == step.name) {
            return Err(EngineError::DuplicateStepName(step.name));
        }
        self.steps.insert(token, step);
        Ok(())
    }

    /// Append `step` after the last numeric token and return its token.
    pub fn push(&mut self, step: Step) -> Result<OrderToken, EngineError> {
        let token = self.next_token();
        self.insert(token.clone(), step)?;
        Ok(token)
    }

    pub fn remove(&mut self, token: &OrderToken) -> Option<Step> {
        self.steps.remove(token)
    }

    pub fn get(&self, token: &OrderToken) -> Option<&Step> {
        self.steps.get(token)
    }

    pub fn find_by_name(&self, name: &str) -> Option<(&OrderToken, &Step)> {
        self.steps.iter().find(|(_, step)| step.name == name)
    }

    /// Look a step up by its `name-type` display identifier.
    pub fn find_by_id(&self, id: &str) -> Option<(&OrderToken, &Step)> {
        self.steps.iter().find(|(_, step)| step.id() == id)
    }

    /// Steps in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (&OrderToken, &Step)> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.values().map(|step| step.name.as_str()).collect()
    }

    /// One past the highest numeric token, or `"1"` if there is none.
    pub fn next_token(&self) -> OrderToken {
        let next = self
            .steps
            .keys()
            .filter_map(OrderToken::numeric)
            .max()
            .map_or(1, |max| max.saturating_add(1));
        OrderToken(next.to_string())
    }

    /// Pick the named steps, keeping the sequence's relative order.
    ///
    /// Returns the names that match no step as the error value.
    pub fn select(&self, names: &[String]) -> Result<Vec<(&OrderToken, &Step)>, Vec<String>> {
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();

        let mut missing: Vec<String> = Vec::new();
        for name in names {
            if self.find_by_name(name).is_none() && !missing.contains(name) {
                missing.push(name.clone());
            }
        }
        if !missing.is_empty() {
            return Err(missing);
        }

        Ok(self
            .steps
            .iter()
            .filter(|(_, step)| wanted.contains(step.name.as_str()))
            .collect())
    }
}

impl<'a> IntoIterator for &'a StepSequence {
    type Item = (&'a OrderToken, &'a Step);
    type IntoIter = std::collections::btree_map::Iter<'a, OrderToken, Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

impl Serialize for StepSequence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.steps.len()))?;
        for (token, step) in &self.steps {
            map.serialize_entry(token, step)?;
        }
        map.end()
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::StepType;

    fn token(t: &str) -> OrderToken {
        OrderToken::new(t).unwrap()
    }

    fn make_step(name: &str) -> Step {
        Step::new(name, StepType::Custom)
    }

    fn sequence(entries: &[(&str, &str)]) -> StepSequence {
        let mut seq = StepSequence::new();
        for (t, name) in entries {
            seq.insert(token(t), make_step(name)).unwrap();
        }
        seq
    }

    #[test]
    fn numeric_tokens_sort_numerically_before_text() {
        let seq = sequence(&[("b", "s5"), ("10", "s3"), ("a", "s4"), ("2", "s2"), ("1", "s1")]);
        assert_eq!(seq.names(), vec!["s1", "s2", "s3", "s4", "s5"]);
    }

    #[test]
    fn numeric_ties_are_distinct_tokens() {
        assert!(token("01") < token("1"));
        assert_ne!(token("01"), token("1"));
    }

    #[test]
    fn read_version_survives_edits_but_not_equality() {
        let mut read = sequence(&[("1", "a")]);
        read.mark_read_at(4);
        read.insert(token("2"), make_step("b")).unwrap();

        assert_eq!(read.clone().read_at(), Some(4));
        assert_eq!(read, sequence(&[("1", "a"), ("2", "b")]));
        assert_eq!(StepSequence::new().read_at(), None);
    }

    #[test]
    fn blank_or_padded_tokens_are_rejected() {
        assert!(matches!(OrderToken::new(""), Err(EngineError::InvalidOrderToken(_))));
        assert!(matches!(OrderToken::new(" 1"), Err(EngineError::InvalidOrderToken(_))));
    }

    #[test]
    fn duplicate_token_is_rejected() {
        let mut seq = sequence(&[("1", "load")]);
        assert!(matches!(
            seq.insert(token("1"), make_step("other")),
            Err(EngineError::DuplicateOrderToken(t)) if t == "1"
        ));
    }

    #[test]
    fn duplicate_step_name_is_rejected() {
        let mut seq = sequence(&[("1", "load")]);
        assert!(matches!(
            seq.insert(token("2"), make_step("load")),
            Err(EngineError::DuplicateStepName(n)) if n == "load"
        ));
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn next_token_follows_highest_numeric_token() {
        assert_eq!(StepSequence::new().next_token(), token("1"));

        let mut seq = sequence(&[("3", "a"), ("zz", "b"), ("10", "c")]);
        assert_eq!(seq.next_token(), token("11"));

        let pushed = seq.push(make_step("d")).unwrap();
        assert_eq!(pushed, token("11"));
        assert_eq!(seq.names().last().copied(), Some("d"));
    }

    #[test]
    fn select_keeps_sequence_order_and_reports_unknown_names() {
        let seq = sequence(&[("1", "load"), ("2", "map"), ("3", "master")]);

        let picked: Vec<&str> = seq
            .select(&["master".to_string(), "load".to_string()])
            .unwrap()
            .into_iter()
            .map(|(_, step)| step.name.as_str())
            .collect();
        assert_eq!(picked, vec!["load", "master"]);

        let missing = seq
            .select(&["load".to_string(), "ghost".to_string(), "ghost".to_string()])
            .unwrap_err();
        assert_eq!(missing, vec!["ghost".to_string()]);
    }

    #[test]
    fn lookup_by_display_id() {
        let seq = sequence(&[("1", "ingest1")]);
        let (t, step) = seq.find_by_id("ingest1-CUSTOM").unwrap();
        assert_eq!(t.as_str(), "1");
        assert_eq!(step.name, "ingest1");
        assert!(seq.find_by_id("ingest1-MAPPING").is_none());
    }

    #[test]
    fn serialises_in_execution_order() {
        let seq = sequence(&[("10", "late"), ("9", "early")]);
        let json = serde_json::to_string(&seq).unwrap();
        assert!(json.find("\"9\"").unwrap() < json.find("\"10\"").unwrap());
    }
}
