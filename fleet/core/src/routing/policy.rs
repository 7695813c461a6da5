//! Routing Policy
//!
//! Static tables that turn a request into an ordered list of models:
//! - keyword -> category, scanned in table order (first match wins)
//! - category -> ordered model preferences, with a `"default"` entry
//! - role -> category
//!
//! # Routing Decision Flow
//!
//! ```text
//! 1. Category: explicit, else classify(prompt)
//! 2. Preferences: override, else learned model + table entry
//! 3. Selector walks the preferences over the registry snapshot
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::discovery::PeerId;

/// Category used when no keyword matches
pub const DEFAULT_CATEGORY: &str = "general";

/// Preference table entry used for unknown categories
pub const DEFAULT_PREFERENCE_KEY: &str = "default";

// ============================================================================
// Routing Request
// ============================================================================

/// A routing request with classification hints
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingRequest {
    /// The prompt/message
    pub prompt: String,

    /// Category to use instead of classifying the prompt
    pub explicit_category: Option<String>,

    /// Role to map to a category (ignored when `explicit_category` is set)
    pub role: Option<String>,

    /// Ordered models to use instead of the policy table
    pub model_preference_override: Option<Vec<String>>,

    /// Peers that must not be selected
    pub excluded_peer_ids: BTreeSet<PeerId>,
}

impl RoutingRequest {
    /// Create a new routing request
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Request for a role rather than a prompt
    pub fn for_role(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            ..Default::default()
        }
    }

    /// Set the category explicitly
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.explicit_category = Some(category.into());
        self
    }

    /// Override the preference list
    #[must_use]
    pub fn with_preferences<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.model_preference_override = Some(models.into_iter().map(Into::into).collect());
        self
    }

    /// Exclude a peer
    #[must_use]
    pub fn excluding(mut self, peer_id: impl Into<PeerId>) -> Self {
        self.excluded_peer_ids.insert(peer_id.into());
        self
    }

    /// Exclude several peers
    #[must_use]
    pub fn with_excluded<I>(mut self, peer_ids: I) -> Self
    where
        I: IntoIterator<Item = PeerId>,
    {
        self.excluded_peer_ids.extend(peer_ids);
        self
    }
}

// ============================================================================
// Routing Result
// ============================================================================

/// The selected `(endpoint, peer, model)` triple
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingResult {
    /// Base URL of the selected endpoint
    pub endpoint_url: String,

    /// Peer serving the request
    pub peer_id: PeerId,

    /// Model to request
    pub model_id: String,

    /// Whether this is the local fallback rather than a fleet selection
    #[serde(default)]
    pub is_fallback: bool,
}

// ============================================================================
// Learned Preferences
// ============================================================================

/// Read-only view of an external learning component
///
/// Consulted once per preference resolution; must not block.
pub trait LearnedPreference: Send + Sync {
    /// Best model observed for `category`, if any
    ///
    /// # Errors
    ///
    /// Implementations may fail; the policy logs the error and carries on
    /// with its static table.
    fn preferred_model(&self, category: &str) -> anyhow::Result<Option<String>>;
}

// ============================================================================
// Policy Configuration
// ============================================================================

/// A keyword that maps prompts to a category
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    /// Substring matched case-insensitively
    pub keyword: String,
    /// Category it selects
    pub category: String,
}

/// Additions and replacements applied over the built-in tables
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Category used when no keyword matches
    pub default_category: Option<String>,

    /// Category -> models; replaces the built-in entry for that category
    pub preferences: BTreeMap<String, Vec<String>>,

    /// Extra keywords, checked before the built-in ones in the given order
    pub keywords: Vec<KeywordRule>,

    /// Extra or replacement role mappings
    pub roles: BTreeMap<String, String>,
}

// ============================================================================
// Preference Policy
// ============================================================================

const BUILTIN_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "coding",
        &[
            "code", "python", "function", "debug", "program", "script", "rust", "javascript",
            "bug", "compile",
        ],
    ),
    ("math", &["math", "calculate", "equation", "solve", "integral", "algebra"]),
    ("summarization", &["summar", "tl;dr", "condense", "recap"]),
    ("analysis", &["analy", "compare", "evaluate", "assess"]),
    ("research", &["research", "investigate", "sources", "literature"]),
    ("writing", &["write", "story", "essay", "blog", "poem", "draft"]),
];

const BUILTIN_PREFERENCES: &[(&str, &[&str])] = &[
    ("coding", &["codellama:13b", "llama3.1:8b", "mistral:7b"]),
    ("math", &["qwen2-math:7b", "llama3.1:8b", "mistral:7b"]),
    ("analysis", &["llama3.1:70b", "mixtral:8x7b", "llama3.1:8b"]),
    ("research", &["llama3.1:70b", "llama3.1:8b", "mistral:7b"]),
    ("writing", &["mistral:7b", "llama3.1:8b"]),
    ("summarization", &["llama3.2:3b", "mistral:7b", "llama3.1:8b"]),
    ("general", &["llama3.1:8b", "mistral:7b", "llama3.2:3b"]),
    (DEFAULT_PREFERENCE_KEY, &["llama3.1:8b", "mistral:7b", "llama3.2:3b"]),
];

const BUILTIN_ROLES: &[(&str, &str)] = &[
    ("researcher", "research"),
    ("writer", "writing"),
    ("developer", "coding"),
    ("coder", "coding"),
    ("engineer", "coding"),
    ("analyst", "analysis"),
    ("mathematician", "math"),
    ("summarizer", "summarization"),
    ("editor", "summarization"),
    ("assistant", "general"),
];

/// Category classification and preference resolution
#[derive(Clone)]
pub struct PreferencePolicy {
    /// Lowercased keyword -> category, in match order
    keywords: Vec<(String, String)>,
    /// Category -> ordered models
    preferences: HashMap<String, Vec<String>>,
    /// Lowercased role -> category
    roles: HashMap<String, String>,
    /// Category when nothing matches
    default_category: String,
    /// Optional external hook
    learned: Option<Arc<dyn LearnedPreference>>,
}

impl std::fmt::Debug for PreferencePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreferencePolicy")
            .field("keywords", &self.keywords.len())
            .field("categories", &self.preferences.len())
            .field("default_category", &self.default_category)
            .field("learned", &self.learned.is_some())
            .finish()
    }
}

impl Default for PreferencePolicy {
    fn default() -> Self {
        let keywords = BUILTIN_KEYWORDS
            .iter()
            .flat_map(|(category, words)| {
                words
                    .iter()
                    .map(move |w| ((*w).to_string(), (*category).to_string()))
            })
            .collect();

        let preferences = BUILTIN_PREFERENCES
            .iter()
            .map(|(category, models)| {
                (
                    (*category).to_string(),
                    models.iter().map(|m| (*m).to_string()).collect(),
                )
            })
            .collect();

        let roles = BUILTIN_ROLES
            .iter()
            .map(|(role, category)| ((*role).to_string(), (*category).to_string()))
            .collect();

        Self {
            keywords,
            preferences,
            roles,
            default_category: DEFAULT_CATEGORY.to_string(),
            learned: None,
        }
    }
}

impl PreferencePolicy {
    /// Built-in tables with `config` applied on top
    #[must_use]
    pub fn from_config(config: &PolicyConfig) -> Self {
        let mut policy = Self::default();

        if let Some(ref category) = config.default_category {
            policy.default_category = category.clone();
        }
        for (category, models) in &config.preferences {
            policy.preferences.insert(category.clone(), models.clone());
        }
        if !config.keywords.is_empty() {
            let mut keywords: Vec<(String, String)> = config
                .keywords
                .iter()
                .map(|r| (r.keyword.to_lowercase(), r.category.clone()))
                .collect();
            keywords.append(&mut policy.keywords);
            policy.keywords = keywords;
        }
        for (role, category) in &config.roles {
            policy.roles.insert(role.to_lowercase(), category.clone());
        }
        policy
    }

    /// Attach a learned-preference hook
    #[must_use]
    pub fn with_learned(mut self, hook: Arc<dyn LearnedPreference>) -> Self {
        self.learned = Some(hook);
        self
    }

    /// Replace one category's preference list
    #[must_use]
    pub fn with_preferences<I, S>(mut self, category: impl Into<String>, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferences
            .insert(category.into(), models.into_iter().map(Into::into).collect());
        self
    }

    /// Drop one category's preference list, including `"default"`
    #[must_use]
    pub fn without_preferences(mut self, category: &str) -> Self {
        self.preferences.remove(category);
        self
    }

    /// Category of the first table keyword contained in `prompt`
    #[must_use]
    pub fn classify(&self, prompt: &str) -> String {
        let prompt = prompt.to_lowercase();
        self.keywords
            .iter()
            .find(|(keyword, _)| prompt.contains(keyword.as_str()))
            .map_or_else(|| self.default_category.clone(), |(_, c)| c.clone())
    }

    /// Category for an agent role; unknown roles get the default category
    #[must_use]
    pub fn category_for_role(&self, role: &str) -> String {
        self.roles
            .get(&role.trim().to_lowercase())
            .cloned()
            .unwrap_or_else(|| self.default_category.clone())
    }

    /// Ordered models for `category`
    ///
    /// An override is returned verbatim. Otherwise the learned model (if any)
    /// comes first, followed by the table entry for the category or the
    /// `"default"` entry.
    #[must_use]
    pub fn resolve_preferences(&self, category: &str, override_list: Option<&[String]>) -> Vec<String> {
        if let Some(list) = override_list {
            return list.to_vec();
        }

        let table = self
            .preferences
            .get(category)
            .or_else(|| self.preferences.get(DEFAULT_PREFERENCE_KEY))
            .cloned()
            .unwrap_or_default();

        match self.learned_model(category) {
            Some(model) => {
                let mut list = Vec::with_capacity(table.len() + 1);
                list.push(model.clone());
                list.extend(table.into_iter().filter(|m| *m != model));
                list
            }
            None => table,
        }
    }

    /// Known categories, sorted
    #[must_use]
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self
            .preferences
            .keys()
            .filter(|c| c.as_str() != DEFAULT_PREFERENCE_KEY)
            .cloned()
            .collect();
        categories.sort();
        categories
    }

    fn learned_model(&self, category: &str) -> Option<String> {
        let hook = self.learned.as_ref()?;
        match hook.preferred_model(category) {
            Ok(Some(model)) if !model.trim().is_empty() => Some(model),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(category = %category, error = %e, "Learned preference lookup failed");
                None
            }
        }
    }
}
