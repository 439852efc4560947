use crate::ArcStr;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

/// A set of clinical codes, each optionally tagged with a category.
///
/// Cloning is cheap: the codes are shared.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codelist {
    codes: Arc<BTreeMap<ArcStr, Option<ArcStr>>>,
}

impl Codelist {
    /// Build a codelist from `(code, category)` pairs.
    ///
    /// Blank codes are skipped, and blank categories count as no category. If a code appears
    /// more than once, the first category wins.
    pub fn from_pairs<C, G>(pairs: impl IntoIterator<Item = (C, Option<G>)>) -> Self
    where
        C: AsRef<str>,
        G: AsRef<str>,
    {
        let mut codes = BTreeMap::new();
        let mut skipped = 0usize;
        for (code, category) in pairs {
            let code = code.as_ref().trim();
            if code.is_empty() {
                skipped += 1;
                continue;
            }
            let category = category
                .map(|cat| cat.as_ref().trim().to_owned())
                .filter(|cat| !cat.is_empty())
                .map(ArcStr::from);
            codes.entry(ArcStr::from(code)).or_insert(category);
        }
        if skipped > 0 {
            event!(Level::WARN, "skipped {} blank codelist entries", skipped);
        }
        Self {
            codes: Arc::new(codes),
        }
    }

    /// Build an uncategorised codelist.
    pub fn from_codes<C: AsRef<str>>(codes: impl IntoIterator<Item = C>) -> Self {
        Self::from_pairs(codes.into_iter().map(|code| (code, None::<&str>)))
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains_key(code)
    }

    /// The category of `code`, or `None` if the code has no category or isn't in the list.
    pub fn category_of(&self, code: &str) -> Option<&ArcStr> {
        self.codes.get(code)?.as_ref()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Iterate over `(code, category)` pairs in code order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> + '_ {
        self.codes.iter().map(|(code, cat)| (&**code, cat.as_deref()))
    }

    /// All distinct categories used in the list.
    pub fn categories(&self) -> BTreeSet<&str> {
        self.codes.values().filter_map(|cat| cat.as_deref()).collect()
    }
}

impl<C: AsRef<str>> FromIterator<C> for Codelist {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = C>,
    {
        Self::from_codes(iter)
    }
}

impl fmt::Display for Codelist {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        let mut codes = self.codes.keys();
        if let Some(code) = codes.next() {
            write!(f, "{}", code)?;
        }
        for code in codes {
            write!(f, ", {}", code)?;
        }
        write!(f, "}}")
    }
}
