use serde::{Deserialize, Serialize};
use std::fmt;

/// Reasoning type of a benchmark question.
///
/// Declaration order is the canonical report order. `Adversarial` questions are
/// tracked and counted but never scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    MultiHop,
    Temporal,
    OpenDomain,
    SingleHop,
    Adversarial,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Self::MultiHop,
        Self::Temporal,
        Self::OpenDomain,
        Self::SingleHop,
        Self::Adversarial,
    ];

    /// Numeric codes used by LoCoMo-style datasets.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::MultiHop),
            2 => Some(Self::Temporal),
            3 => Some(Self::OpenDomain),
            4 => Some(Self::SingleHop),
            5 => Some(Self::Adversarial),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::MultiHop => 1,
            Self::Temporal => 2,
            Self::OpenDomain => 3,
            Self::SingleHop => 4,
            Self::Adversarial => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultiHop => "multi-hop",
            Self::Temporal => "temporal",
            Self::OpenDomain => "open-domain",
            Self::SingleHop => "single-hop",
            Self::Adversarial => "adversarial",
        }
    }

    pub fn is_scored(&self) -> bool {
        !matches!(self, Self::Adversarial)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<u64>() {
            return Self::from_code(code).ok_or_else(|| format!("unknown category code: {s}"));
        }
        match s.to_lowercase().replace('_', "-").as_str() {
            "multi-hop" => Ok(Self::MultiHop),
            "temporal" => Ok(Self::Temporal),
            "open-domain" => Ok(Self::OpenDomain),
            "single-hop" => Ok(Self::SingleHop),
            "adversarial" => Ok(Self::Adversarial),
            _ => Err(format!("unknown category: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_dataset_mapping() {
        assert_eq!(Category::from_code(1), Some(Category::MultiHop));
        assert_eq!(Category::from_code(4), Some(Category::SingleHop));
        assert_eq!(Category::from_code(5), Some(Category::Adversarial));
        assert_eq!(Category::from_code(0), None);
        assert_eq!(Category::from_code(6), None);
        for c in Category::ALL {
            assert_eq!(Category::from_code(c.code() as u64), Some(c));
        }
    }

    #[test]
    fn test_parse_names_and_codes() {
        assert_eq!("single-hop".parse::<Category>(), Ok(Category::SingleHop));
        assert_eq!("Open_Domain".parse::<Category>(), Ok(Category::OpenDomain));
        assert_eq!("2".parse::<Category>(), Ok(Category::Temporal));
        assert!("trivia".parse::<Category>().is_err());
        assert!("9".parse::<Category>().is_err());
    }

    #[test]
    fn test_serde_uses_kebab_case() {
        let json = serde_json::to_string(&Category::MultiHop).unwrap();
        assert_eq!(json, "\"multi-hop\"");
        let back: Category = serde_json::from_str("\"adversarial\"").unwrap();
        assert_eq!(back, Category::Adversarial);
    }

    #[test]
    fn test_only_adversarial_is_unscored() {
        let unscored: Vec<_> = Category::ALL.iter().filter(|c| !c.is_scored()).collect();
        assert_eq!(unscored, vec![&Category::Adversarial]);
    }
}
