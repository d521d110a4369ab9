use std::collections::{BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

use crate::action::{CommandAction, Hook};

/// Characters stripped from both ends of a phrase before indexing
const PHRASE_PUNCTUATION: &[char] = &[',', '.', '!', '?', ':', ';'];

/// Lowercase and strip surrounding punctuation and whitespace
#[must_use]
pub fn normalize_phrase(phrase: &str) -> String {
    phrase
        .to_lowercase()
        .trim_matches(|c: char| c.is_whitespace() || PHRASE_PUNCTUATION.contains(&c))
        .to_owned()
}

/// Handle of a registered trigger; ordered by registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TriggerId(usize);

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trigger-{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a trigger needs at least one phrase")]
    NoPhrases,

    #[error("phrase {0:?} is empty after normalization")]
    EmptyPhrase(String),

    #[error("phrase {phrase:?} is already registered to {existing}")]
    DuplicatePhrase {
        phrase: String,
        existing: TriggerId,
    },
}

/// A command waiting to be registered
///
/// ```no_run
/// use voice_trigger::action::CommandAction;
/// use voice_trigger::registry::{Trigger, TriggerRegistry};
///
/// let mut registry = TriggerRegistry::new();
/// registry.register(
///     Trigger::new(["hello", "hi"], CommandAction::immediate(|_| Ok(()))).with_priority(1),
/// )?;
/// # Ok::<(), voice_trigger::registry::RegistryError>(())
/// ```
pub struct Trigger {
    phrases: Vec<String>,
    action: CommandAction,
    priority: i32,
    on_wait_start: Option<Hook>,
    on_wait_end: Option<Hook>,
}

impl Trigger {
    pub fn new<I, S>(phrases: I, action: CommandAction) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phrases: phrases.into_iter().map(Into::into).collect(),
            action,
            priority: 0,
            on_wait_start: None,
            on_wait_end: None,
        }
    }

    /// Among simultaneous matches only the highest priority is dispatched
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Runs as soon as the command is queued
    #[must_use]
    pub fn on_wait_start(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_wait_start = Some(Box::new(hook));
        self
    }

    /// Runs right before the command's action
    #[must_use]
    pub fn on_wait_end(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_wait_end = Some(Box::new(hook));
        self
    }
}

/// A registered trigger; immutable once registered
pub struct TriggerDescriptor {
    id: TriggerId,
    phrases: Vec<String>,
    priority: i32,
    action: CommandAction,
    on_wait_start: Option<Hook>,
    on_wait_end: Option<Hook>,
}

impl TriggerDescriptor {
    #[must_use]
    pub const fn id(&self) -> TriggerId {
        self.id
    }

    /// Normalized phrases
    #[must_use]
    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    #[must_use]
    pub const fn is_modal(&self) -> bool {
        self.action.is_modal()
    }

    #[must_use]
    pub const fn action(&self) -> &CommandAction {
        &self.action
    }

    pub(crate) fn wait_start_hook(&self) -> Option<&Hook> {
        self.on_wait_start.as_ref()
    }

    pub(crate) fn wait_end_hook(&self) -> Option<&Hook> {
        self.on_wait_end.as_ref()
    }
}

impl fmt::Debug for TriggerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerDescriptor")
            .field("id", &self.id)
            .field("phrases", &self.phrases)
            .field("priority", &self.priority)
            .field("modal", &self.is_modal())
            .finish_non_exhaustive()
    }
}

/// Phrase index plus the descriptors it points at
#[derive(Debug, Default)]
pub struct TriggerRegistry {
    triggers: Vec<TriggerDescriptor>,
    phrase_index: HashMap<String, TriggerId>,
}

impl TriggerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a trigger under all of its phrases
    ///
    /// # Errors
    /// Rejects a trigger with no phrases, a phrase that normalizes to nothing,
    /// or a phrase another trigger already owns. Nothing is indexed on error.
    pub fn register(&mut self, trigger: Trigger) -> Result<TriggerId, RegistryError> {
        if trigger.phrases.is_empty() {
            return Err(RegistryError::NoPhrases);
        }

        let id = TriggerId(self.triggers.len());
        let mut phrases: Vec<String> = Vec::with_capacity(trigger.phrases.len());
        for raw in &trigger.phrases {
            let phrase = normalize_phrase(raw);
            if phrase.is_empty() {
                return Err(RegistryError::EmptyPhrase(raw.clone()));
            }
            if let Some(&existing) = self.phrase_index.get(&phrase) {
                return Err(RegistryError::DuplicatePhrase { phrase, existing });
            }
            if !phrases.contains(&phrase) {
                phrases.push(phrase);
            }
        }

        for phrase in &phrases {
            self.phrase_index.insert(phrase.clone(), id);
        }

        tracing::debug!(
            trigger = %id,
            phrases = ?phrases,
            priority = trigger.priority,
            modal = trigger.action.is_modal(),
            "trigger registered"
        );

        self.triggers.push(TriggerDescriptor {
            id,
            phrases,
            priority: trigger.priority,
            action: trigger.action,
            on_wait_start: trigger.on_wait_start,
            on_wait_end: trigger.on_wait_end,
        });

        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: TriggerId) -> Option<&TriggerDescriptor> {
        self.triggers.get(id.0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TriggerDescriptor> {
        self.triggers.iter()
    }

    /// Exact (non-substring) lookup of one phrase
    #[must_use]
    pub fn lookup_exact(&self, phrase: &str) -> Option<TriggerId> {
        self.phrase_index.get(&normalize_phrase(phrase)).copied()
    }

    /// Every trigger with a phrase contained in the transcript
    ///
    /// Containment is plain substring search on the lowercased transcript,
    /// so "hi" also fires inside "this".
    #[must_use]
    pub fn find_matches(&self, transcript: &str) -> BTreeSet<TriggerId> {
        let transcript = transcript.to_lowercase();
        self.phrase_index
            .iter()
            .filter(|(phrase, _)| transcript.contains(phrase.as_str()))
            .map(|(_, &id)| id)
            .collect()
    }

    /// All matched triggers sharing the highest priority, in registration order
    #[must_use]
    pub fn resolve_winners(&self, matched: &BTreeSet<TriggerId>) -> Vec<TriggerId> {
        let priorities: Vec<(TriggerId, i32)> = matched
            .iter()
            .filter_map(|&id| self.get(id).map(|t| (id, t.priority)))
            .collect();

        let Some(highest) = priorities.iter().map(|&(_, p)| p).max() else {
            return Vec::new();
        };

        priorities
            .into_iter()
            .filter(|&(_, p)| p == highest)
            .map(|(id, _)| id)
            .collect()
    }

    /// `find_matches` followed by `resolve_winners`
    #[must_use]
    pub fn match_transcript(&self, transcript: &str) -> Vec<TriggerId> {
        self.resolve_winners(&self.find_matches(transcript))
    }
}
