//! Stage 2: checks on the raw natural-language request before anything else
//! sees it.
//!
//! Order is fixed: token, length, rate limit, deterministic pattern rules,
//! then the classifier. Each check only runs if every earlier one passed.

use std::sync::LazyLock;
use std::time::Duration;

use qgate_auth::{AuthError, ContextToken, ContextVerifier};
use qgate_contracts::{ErrorKind, canonical};
use regex::Regex;

use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternRule {
    InstructionOverride,
    DestructiveSql,
    InjectionSequence,
}

impl PatternRule {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternRule::InstructionOverride => "instruction_override",
            PatternRule::DestructiveSql => "destructive_sql",
            PatternRule::InjectionSequence => "injection_sequence",
        }
    }
}

struct Rule {
    kind: PatternRule,
    regex: Regex,
}

impl Rule {
    fn new(kind: PatternRule, pattern: &str) -> Self {
        Self {
            kind,
            regex: Regex::new(pattern).expect("invalid guardrail pattern"),
        }
    }
}

// Rules run against `normalize_for_matching` output: lowercase, NFKC,
// invisible characters dropped, whitespace collapsed.
static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule::new(
            PatternRule::InstructionOverride,
            r"\b(ignore|disregard|forget|override|bypass)\b.{0,40}\b(previous|prior|above|earlier|all|any|the|your|system)\b.{0,20}\b(instructions?|prompts?|rules?|directions?|guardrails?|restrictions?)\b",
        ),
        Rule::new(
            PatternRule::InstructionOverride,
            r"\b(you are now|from now on you|new instructions:|system prompt|developer mode|jailbreak)\b",
        ),
        Rule::new(
            PatternRule::InstructionOverride,
            r"\b(act|behave|pretend) (as|like|to be)\b.{0,30}\b(admin|administrator|dba|root|superuser|another user)\b",
        ),
        Rule::new(
            PatternRule::DestructiveSql,
            r"\b(drop|truncate|alter)\s+(table|database|schema|index|view|role|user|column|function)\b",
        ),
        Rule::new(
            PatternRule::DestructiveSql,
            r"\b(drop|truncate)\b(\s+\w+){0,3}\s+(tables?|database|schema)\b",
        ),
        Rule::new(
            PatternRule::DestructiveSql,
            r"\b(delete\s+from|insert\s+into|update\s+\w+\s+set|merge\s+into)\b",
        ),
        Rule::new(
            PatternRule::DestructiveSql,
            r"\b(grant|revoke)\s+(all|select|insert|update|delete|usage|\w+\s+on)\b",
        ),
        Rule::new(
            PatternRule::DestructiveSql,
            r"\bcreate\s+(or\s+replace\s+)?(table|function|role|user|extension|trigger|procedure)\b",
        ),
        Rule::new(PatternRule::InjectionSequence, r"--|/\*|\*/"),
        Rule::new(
            PatternRule::InjectionSequence,
            r";\s*(select|drop|delete|insert|update|alter|create|truncate|grant|revoke|with|copy|set)\b",
        ),
        Rule::new(PatternRule::InjectionSequence, r"\bunion\s+(all\s+)?select\b"),
        Rule::new(
            PatternRule::InjectionSequence,
            r"'\s*(or|and)\s+'?\w+'?\s*=\s*'?\w+",
        ),
    ]
});

/// First deterministic rule the normalized input trips, if any.
pub fn match_rules(normalized: &str) -> Option<PatternRule> {
    RULES
        .iter()
        .find(|rule| rule.regex.is_match(normalized))
        .map(|rule| rule.kind)
}

/// Probability-like score in `[0, 1]` that the input is an injection attempt.
///
/// Implementations must be deterministic for a given input.
pub trait InjectionClassifier: Send + Sync {
    fn score(&self, normalized: &str) -> f64;
}

/// Weighted keyword signals combined as independent evidence.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

const SIGNALS: &[(&str, f64)] = &[
    ("instruction", 0.35),
    ("prompt", 0.35),
    ("pretend", 0.4),
    ("roleplay", 0.4),
    ("bypass", 0.5),
    ("unrestricted", 0.5),
    ("without restrictions", 0.6),
    ("no restrictions", 0.6),
    ("all tenants", 0.6),
    ("every tenant", 0.6),
    ("other tenant", 0.6),
    ("other users", 0.45),
    ("password", 0.4),
    ("credential", 0.4),
    ("api key", 0.4),
    ("secret", 0.3),
    ("pg_catalog", 0.6),
    ("information_schema", 0.6),
    ("tenant_id", 0.35),
    ("sleep(", 0.6),
    ("exec(", 0.6),
];

static ENCODED_BLOB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-z0-9+/=]{40,}|(\\x[0-9a-f]{2}){4,}|(%[0-9a-f]{2}){4,}")
        .expect("invalid encoded blob pattern")
});

impl InjectionClassifier for HeuristicClassifier {
    fn score(&self, normalized: &str) -> f64 {
        let mut miss = 1.0;
        for (needle, weight) in SIGNALS {
            if normalized.contains(needle) {
                miss *= 1.0 - weight;
            }
        }
        if ENCODED_BLOB.is_match(normalized) {
            miss *= 1.0 - 0.5;
        }

        let symbols = normalized
            .chars()
            .filter(|c| matches!(c, '\'' | '"' | '`' | '(' | ')' | '=' | '<' | '>' | '|' | '\\'))
            .count();
        if normalized.len() >= 20 && symbols * 5 > normalized.len() {
            miss *= 1.0 - 0.4;
        }

        (1.0 - miss).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputRejection {
    Authentication(AuthError),
    TooLong { length: usize, max: usize },
    RateLimited { retry_after: Duration },
    Pattern(PatternRule),
    Classifier { score: f64 },
}

impl InputRejection {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InputRejection::Authentication(_) => ErrorKind::Authentication,
            _ => ErrorKind::InputRejected,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            InputRejection::Authentication(_) => "authentication",
            InputRejection::TooLong { .. } => "input_too_long",
            InputRejection::RateLimited { .. } => "rate_limited",
            InputRejection::Pattern(rule) => rule.as_str(),
            InputRejection::Classifier { .. } => "classifier",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            InputRejection::Authentication(err) => err.code,
            InputRejection::TooLong { .. } => "ERR_INPUT_TOO_LONG",
            InputRejection::RateLimited { .. } => "ERR_RATE_LIMITED",
            InputRejection::Pattern(_) => "ERR_INPUT_PATTERN",
            InputRejection::Classifier { .. } => "ERR_INPUT_CLASSIFIER",
        }
    }
}

impl std::fmt::Display for InputRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputRejection::Authentication(_) => write!(f, "authentication failed"),
            InputRejection::TooLong { length, max } => {
                write!(f, "input length {} exceeds {}", length, max)
            }
            InputRejection::RateLimited { retry_after } => {
                write!(f, "rate limited for {}ms", retry_after.as_millis())
            }
            InputRejection::Pattern(rule) => write!(f, "input matched rule {}", rule.as_str()),
            InputRejection::Classifier { score } => {
                write!(f, "classifier score {:.3} above threshold", score)
            }
        }
    }
}

impl std::error::Error for InputRejection {}

fn check_normalized<C: InjectionClassifier + ?Sized>(
    normalized: &str,
    classifier: &C,
    threshold: f64,
) -> Result<(), InputRejection> {
    if let Some(rule) = match_rules(normalized) {
        return Err(InputRejection::Pattern(rule));
    }

    let score = classifier.score(normalized);
    if score > threshold {
        return Err(InputRejection::Classifier { score });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct GuardrailConfig {
    pub max_length: usize,
    pub classifier_threshold: f64,
}

pub struct InputGuardrail<C = HeuristicClassifier> {
    config: GuardrailConfig,
    classifier: C,
    limiter: RateLimiter,
    verifier: ContextVerifier,
}

impl<C: InjectionClassifier> InputGuardrail<C> {
    pub fn new(
        config: GuardrailConfig,
        classifier: C,
        limiter: RateLimiter,
        verifier: ContextVerifier,
    ) -> Self {
        Self {
            config,
            classifier,
            limiter,
            verifier,
        }
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    /// The rate-limit identity is read from the verified token.
    pub fn validate(&self, raw: &str, token: &ContextToken) -> Result<(), InputRejection> {
        let ctx = self
            .verifier
            .verify(token)
            .map_err(InputRejection::Authentication)?;
        let identity_id = ctx.identity_id();

        let length = raw.chars().count();
        if length > self.config.max_length {
            return Err(InputRejection::TooLong {
                length,
                max: self.config.max_length,
            });
        }

        self.limiter
            .check(identity_id)
            .map_err(|retry_after| InputRejection::RateLimited { retry_after })?;

        let normalized = canonical::normalize_for_matching(raw);
        let result = check_normalized(
            &normalized,
            &self.classifier,
            self.config.classifier_threshold,
        );
        if let Err(rejection) = &result {
            tracing::info!(
                identity_id,
                input_hash = %canonical::sha256_hex(raw.as_bytes()),
                reason = rejection.reason(),
                "guardrail.input_rejected"
            );
        }
        result
    }
}
