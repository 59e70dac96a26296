//! Stat name expansion.
//!
//! A stat pattern is a string such as `%_name.byhost.%host`. Each `%` introduces a token made of the characters
//! `[A-Za-z0-9_]`: the reserved token `_name` is replaced by the basename the stat was emitted with, and any other
//! token is looked up in the labels given with the stat. `%%` produces a literal `%`.
use std::{
    borrow::Borrow,
    collections::{BTreeMap, HashMap},
    hash::{BuildHasher, Hash},
};

use metrics::Key;
use thiserror::Error;

const NAME_TOKEN: &str = "_name";
const UNDEFINED: &str = "undefined";

/// A stat pattern ended in the middle of a token.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("stat pattern \"{pattern}\": unexpected end of string")]
pub struct ExpansionError {
    pattern: String,
}

impl ExpansionError {
    /// Returns the pattern that failed to expand.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Source of label values for pattern expansion.
///
/// Implemented for the common map types, for slices/arrays/vectors of key/value pairs, for `()` (no labels), and for
/// [`metrics::Key`], whose labels are used.
pub trait Labels {
    /// Returns the value of the label called `name`, if present.
    fn label(&self, name: &str) -> Option<&str>;
}

impl<T: Labels + ?Sized> Labels for &T {
    fn label(&self, name: &str) -> Option<&str> {
        (**self).label(name)
    }
}

impl Labels for () {
    fn label(&self, _: &str) -> Option<&str> {
        None
    }
}

impl<K, V, S> Labels for HashMap<K, V, S>
where
    K: Borrow<str> + Hash + Eq,
    V: AsRef<str>,
    S: BuildHasher,
{
    fn label(&self, name: &str) -> Option<&str> {
        self.get(name).map(AsRef::as_ref)
    }
}

impl<K, V> Labels for BTreeMap<K, V>
where
    K: Borrow<str> + Ord,
    V: AsRef<str>,
{
    fn label(&self, name: &str) -> Option<&str> {
        self.get(name).map(AsRef::as_ref)
    }
}

impl<K, V> Labels for [(K, V)]
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    fn label(&self, name: &str) -> Option<&str> {
        self.iter().find(|(k, _)| k.as_ref() == name).map(|(_, v)| v.as_ref())
    }
}

impl<K, V, const N: usize> Labels for [(K, V); N]
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    fn label(&self, name: &str) -> Option<&str> {
        self[..].label(name)
    }
}

impl<K, V> Labels for Vec<(K, V)>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    fn label(&self, name: &str) -> Option<&str> {
        self[..].label(name)
    }
}

impl Labels for Key {
    fn label(&self, name: &str) -> Option<&str> {
        self.labels().find(|label| label.key() == name).map(|label| label.value())
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Expands `pattern` into a concrete stat name.
///
/// Tokens that are neither `_name` nor present in `labels` expand to the string `undefined`. A `%` that is not
/// followed by a token character is an empty token, which expands the same way, and scanning resumes at the following
/// character.
///
/// # Errors
///
/// If the pattern ends with a lone `%`, an error is returned.
pub fn expand<L>(pattern: &str, basename: &str, labels: &L) -> Result<String, ExpansionError>
where
    L: Labels + ?Sized,
{
    let bytes = pattern.as_bytes();
    let mut stat_name = String::with_capacity(pattern.len() + basename.len());
    let mut pos = 0;

    while let Some(offset) = pattern[pos..].find('%') {
        let percent = pos + offset;
        stat_name.push_str(&pattern[pos..percent]);

        let token_start = percent + 1;
        match bytes.get(token_start) {
            None => return Err(ExpansionError { pattern: pattern.to_owned() }),
            Some(b'%') => {
                stat_name.push('%');
                pos = token_start + 1;
            }
            Some(_) => {
                let token_end = bytes[token_start..]
                    .iter()
                    .position(|b| !is_token_byte(*b))
                    .map_or(bytes.len(), |len| token_start + len);

                let token = &pattern[token_start..token_end];
                let value = if token == NAME_TOKEN { Some(basename) } else { labels.label(token) };
                stat_name.push_str(value.unwrap_or(UNDEFINED));
                pos = token_end;
            }
        }
    }

    stat_name.push_str(&pattern[pos..]);
    Ok(stat_name)
}
