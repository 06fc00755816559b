//! `key=value; key=value` cookie header codec.

use crate::error::FetchError;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieItem {
    pub key: String,
    pub value: String,
}

/// Ordered list of cookie pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
    items: Vec<CookieItem>,
}

impl Cookie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `Cookie` header value.
    ///
    /// Surrounding whitespace and one trailing `;` are ignored; each item is
    /// split on its first `=`. Items without `=` or with an empty key are
    /// skipped.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let raw = raw.strip_suffix(';').unwrap_or(raw);

        let items = raw
            .split(';')
            .filter_map(|item| {
                let (key, value) = item.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some(CookieItem {
                    key: key.to_owned(),
                    value: value.trim().to_owned(),
                })
            })
            .collect();

        Self { items }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.value.as_str())
    }

    /// Update `key` in place, or append it when absent.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::EmptyCookieKey` if `key` is empty.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), FetchError> {
        if key.is_empty() {
            return Err(FetchError::EmptyCookieKey);
        }
        let value = value.into();
        match self.items.iter_mut().find(|item| item.key == key) {
            Some(item) => item.value = value,
            None => self.items.push(CookieItem {
                key: key.to_owned(),
                value,
            }),
        }
        Ok(())
    }

    /// Remove `key`; returns whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.key != key);
        self.items.len() != before
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    #[must_use]
    pub fn items(&self) -> &[CookieItem] {
        &self.items
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}={}", item.key, item.value)?;
        }
        Ok(())
    }
}

impl FromStr for Cookie {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}
