//! Rubric model and the slug rule that names each criterion's result slot.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// Slug used when a criterion name normalizes to nothing.
pub const SLUG_PLACEHOLDER: &str = "criterion";

const GRADE_KEY_PREFIX: &str = "grade_";
const ERROR_KEY_SUFFIX: &str = "_error";

/// Normalize arbitrary text into a safe identifier.
///
/// The text is NFKD-decomposed and folded to ASCII, every run of
/// non-alphanumeric characters becomes a single `_`, leading and trailing
/// underscores are stripped and the result is lower-cased.
pub fn slugify(text: &str) -> String {
    let ascii: String = text.nfkd().filter(char::is_ascii).collect();

    let mut slug = String::with_capacity(ascii.len());
    let mut pending_sep = false;
    for c in ascii.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    if slug.is_empty() {
        SLUG_PLACEHOLDER.to_string()
    } else {
        slug
    }
}

// ---------------------------------------------------------------------------
// Rubric / Criterion
// ---------------------------------------------------------------------------

/// A validated grading rubric. Immutable once the validator has persisted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub name: String,
    pub criteria: Vec<Criterion>,
}

/// One independently scored dimension of a rubric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    pub description: String,
    pub max_score: f64,
    pub slug: String,
}

impl Criterion {
    pub fn new(name: impl Into<String>, description: impl Into<String>, max_score: f64) -> Self {
        let name = name.into();
        let slug = slugify(&name);
        Self {
            name,
            description: description.into(),
            max_score,
            slug,
        }
    }

    /// The result slot this criterion writes to.
    pub fn grade_key(&self) -> GradeKey {
        GradeKey::new(self.slug.clone())
    }
}

impl Rubric {
    /// Build a rubric, assigning every criterion a unique slug.
    ///
    /// Names that collide after normalization get a numeric suffix
    /// (`docs`, `docs_2`, ...) in declaration order.
    pub fn new(name: impl Into<String>, criteria: Vec<Criterion>) -> Self {
        let mut rubric = Self {
            name: name.into(),
            criteria,
        };
        rubric.assign_slugs();
        rubric
    }

    fn assign_slugs(&mut self) {
        let mut seen: HashSet<String> = HashSet::new();
        for criterion in &mut self.criteria {
            let base = slugify(&criterion.name);
            let mut candidate = base.clone();
            let mut n = 2;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{base}_{n}");
                n += 1;
            }
            criterion.slug = candidate;
        }
    }

    /// Sum of every criterion's max score.
    pub fn total_points(&self) -> f64 {
        self.criteria.iter().map(|c| c.max_score).sum()
    }

    /// Expected result keys, in rubric order.
    pub fn grade_keys(&self) -> Vec<GradeKey> {
        self.criteria.iter().map(Criterion::grade_key).collect()
    }

    pub fn criterion(&self, key: &GradeKey) -> Option<&Criterion> {
        self.criteria.iter().find(|c| c.slug == key.slug())
    }
}

// ---------------------------------------------------------------------------
// GradeKey
// ---------------------------------------------------------------------------

/// Identity of a criterion's result slot.
///
/// Renders as `grade_<slug>`; the matching failure slot renders as
/// `grade_<slug>_error`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GradeKey(String);

impl GradeKey {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn slug(&self) -> &str {
        &self.0
    }

    /// The key under which a failure record for this slot is reported.
    pub fn error_key(&self) -> String {
        format!("{self}{ERROR_KEY_SUFFIX}")
    }
}

impl fmt::Display for GradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{GRADE_KEY_PREFIX}{}", self.0)
    }
}

impl TryFrom<String> for GradeKey {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.strip_prefix(GRADE_KEY_PREFIX) {
            Some(slug) if !slug.is_empty() => Ok(GradeKey(slug.to_string())),
            _ => Err(format!("'{value}' is not a grade key")),
        }
    }
}

impl From<GradeKey> for String {
    fn from(key: GradeKey) -> Self {
        key.to_string()
    }
}
