//! Content ratings and their containment rule.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DomainError, DomainResult};

/// A content rating: `domain/system/rating[/sub-rating...]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentRating {
    pub domain: String,
    pub system: String,
    pub rating: String,
    pub sub_ratings: Vec<String>,
}

impl ContentRating {
    pub fn new(
        domain: impl Into<String>,
        system: impl Into<String>,
        rating: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            system: system.into(),
            rating: rating.into(),
            sub_ratings: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_sub_rating(mut self, sub: impl Into<String>) -> Self {
        self.sub_ratings.push(sub.into());
        self
    }

    /// Parses the flattened form.
    pub fn unflatten(flat: &str) -> DomainResult<Self> {
        let mut parts = flat.split('/');
        let (Some(domain), Some(system), Some(rating)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(DomainError::InvalidRating {
                value: flat.to_string(),
            });
        };
        if domain.is_empty() || system.is_empty() || rating.is_empty() {
            return Err(DomainError::InvalidRating {
                value: flat.to_string(),
            });
        }
        Ok(Self {
            domain: domain.to_string(),
            system: system.to_string(),
            rating: rating.to_string(),
            sub_ratings: parts.filter(|s| !s.is_empty()).map(str::to_string).collect(),
        })
    }

    pub fn flatten(&self) -> String {
        let mut out = format!("{}/{}/{}", self.domain, self.system, self.rating);
        for sub in &self.sub_ratings {
            out.push('/');
            out.push_str(sub);
        }
        out
    }

    /// True when both share the main rating and every sub-rating of
    /// `other` is also in `self`.
    pub fn contains(&self, other: &ContentRating) -> bool {
        if self.domain != other.domain || self.system != other.system || self.rating != other.rating
        {
            return false;
        }
        other.sub_ratings.iter().all(|s| self.sub_ratings.contains(s))
    }
}

impl fmt::Display for ContentRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.flatten())
    }
}

impl TryFrom<String> for ContentRating {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::unflatten(&value)
    }
}

impl From<ContentRating> for String {
    fn from(rating: ContentRating) -> Self {
        rating.flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tv_pg() -> ContentRating {
        ContentRating::new("com.android.tv", "US_TV", "US_TV_PG")
    }

    #[test]
    fn test_flatten_unflatten() {
        let rating = tv_pg().with_sub_rating("US_TV_D").with_sub_rating("US_TV_L");
        let flat = rating.flatten();
        assert_eq!(flat, "com.android.tv/US_TV/US_TV_PG/US_TV_D/US_TV_L");
        assert_eq!(ContentRating::unflatten(&flat).unwrap(), rating);
    }

    #[test]
    fn test_unflatten_rejects_short() {
        assert!(ContentRating::unflatten("com.android.tv/US_TV").is_err());
        assert!(ContentRating::unflatten("a//c").is_err());
    }

    #[test]
    fn test_contains_requires_same_main_rating() {
        let ma = ContentRating::new("com.android.tv", "US_TV", "US_TV_MA");
        assert!(!tv_pg().contains(&ma));
        assert!(tv_pg().contains(&tv_pg()));
    }

    #[test]
    fn test_contains_sub_rating_subset() {
        let blocked = tv_pg().with_sub_rating("US_TV_D").with_sub_rating("US_TV_L");
        let content = tv_pg().with_sub_rating("US_TV_L");
        assert!(blocked.contains(&content));
        assert!(!content.contains(&blocked));
        // No sub-ratings on the content side is always contained
        assert!(blocked.contains(&tv_pg()));
    }
}
