//! Static pre-filter run before any execution resource is allocated.
//!
//! The rule set rejects obviously dangerous submissions cheaply. It is not a
//! sandbox: aliasing or indirection can get past it, and the backend remains
//! the trust boundary.

use std::fmt;

use regex::Regex;

use crate::error::{Result, SandboxError};

/// What a rule protects against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleCategory {
    /// Filesystem modules and `open`.
    Filesystem,
    /// Process spawning and interpreter internals.
    Process,
    /// Sockets and network clients.
    Network,
    /// `eval`, `exec` and reflective imports.
    DynamicCode,
    /// Patterns added through configuration.
    Custom,
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleCategory::Filesystem => "filesystem access",
            RuleCategory::Process => "process access",
            RuleCategory::Network => "network access",
            RuleCategory::DynamicCode => "dynamic code loading",
            RuleCategory::Custom => "disallowed construct",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    /// Case-sensitive substring.
    Substring(String),
    /// Compiled regex.
    Pattern(Regex),
}

/// One disallowed construct.
#[derive(Debug, Clone)]
pub struct BlockRule {
    category: RuleCategory,
    label: String,
    matcher: Matcher,
}

impl BlockRule {
    /// A case-sensitive substring rule.
    pub fn substring(category: RuleCategory, needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self {
            category,
            label: needle.clone(),
            matcher: Matcher::Substring(needle),
        }
    }

    /// A regex rule. `label` is what shows up in the block reason.
    pub fn pattern(category: RuleCategory, label: impl Into<String>, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|source| SandboxError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            category,
            label: label.into(),
            matcher: Matcher::Pattern(regex),
        })
    }

    /// The rule's category.
    pub fn category(&self) -> RuleCategory {
        self.category
    }

    /// Check the rule against a code string.
    pub fn matches(&self, code: &str) -> bool {
        match &self.matcher {
            Matcher::Substring(needle) => code.contains(needle.as_str()),
            Matcher::Pattern(regex) => regex.is_match(code),
        }
    }

    fn reason(&self) -> String {
        format!("blocked: {} ({})", self.category, self.label)
    }
}

/// Result of screening a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screening {
    /// No rule matched.
    Allowed,
    /// A rule matched; the string names it.
    Blocked(String),
}

impl Screening {
    /// Check if the submission may run.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Screening::Allowed)
    }
}

const FILESYSTEM_MODULES: &[&str] = &["os", "shutil", "pathlib", "io", "glob", "tempfile"];
const PROCESS_MODULES: &[&str] = &["subprocess", "sys", "multiprocessing", "ctypes", "signal", "pty"];
const NETWORK_MODULES: &[&str] = &["socket", "urllib", "http", "requests", "ssl", "ftplib", "smtplib"];

/// Regex matching `import a, b` / `from a import b` where any listed module
/// (or a submodule of it) appears.
fn import_pattern(modules: &[&str]) -> String {
    let alternation = modules.join("|");
    format!(
        r"\b(?:import\s+(?:[\w.]+(?:\s+as\s+\w+)?\s*,\s*)*|from\s+)(?:{alternation})\b"
    )
}

/// Ordered, immutable rule set shared by all requests.
#[derive(Debug, Clone)]
pub struct BlockRules {
    rules: Vec<BlockRule>,
}

impl BlockRules {
    /// Build the default rule set plus any extra configured patterns.
    pub fn new(extra_patterns: &[String]) -> Result<Self> {
        let mut rules = default_rules()?;
        for pattern in extra_patterns {
            rules.push(BlockRule::pattern(RuleCategory::Custom, pattern.as_str(), pattern)?);
        }
        Ok(Self { rules })
    }

    /// Build from an explicit list of rules.
    pub fn from_rules(rules: Vec<BlockRule>) -> Self {
        Self { rules }
    }

    /// Screen a submission against every rule, in order.
    pub fn screen(&self, code: &str) -> Screening {
        match self.rules.iter().find(|rule| rule.matches(code)) {
            Some(rule) => Screening::Blocked(rule.reason()),
            None => Screening::Allowed,
        }
    }

    /// Number of rules in the set.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn default_rules() -> Result<Vec<BlockRule>> {
    use RuleCategory::*;

    let mut rules = vec![
        BlockRule::pattern(Filesystem, "filesystem import", &import_pattern(FILESYSTEM_MODULES))?,
        BlockRule::pattern(Process, "process import", &import_pattern(PROCESS_MODULES))?,
        BlockRule::pattern(Network, "network import", &import_pattern(NETWORK_MODULES))?,
        BlockRule::pattern(Filesystem, "open(", r"\bopen\s*\(")?,
        BlockRule::pattern(DynamicCode, "eval(", r"\beval\s*\(")?,
        BlockRule::pattern(DynamicCode, "exec(", r"\bexec\s*\(")?,
        BlockRule::pattern(DynamicCode, "compile(", r"\bcompile\s*\(")?,
        BlockRule::pattern(DynamicCode, "importlib", r"\bimportlib\b")?,
    ];
    for needle in ["__import__", "__builtins__", "__subclasses__", "__globals__"] {
        rules.push(BlockRule::substring(DynamicCode, needle));
    }
    Ok(rules)
}
