//! Ordered header multimap.
//!
//! Header names compare case-insensitively; order and duplicates are kept
//! exactly as received until [`HeaderList::joined`] is asked to fold them.

use http::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};

/// An ordered sequence of header name/value pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn from_map(map: &HeaderMap) -> Self {
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// First value for `name`, case-insensitive.
    pub fn get<'a>(&'a self, name: &'a str) -> Option<&'a HeaderValue> {
        self.get_all(name).next()
    }

    /// First value for `name` if it is visible ASCII.
    pub fn get_str<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a HeaderValue> + 'a {
        self.entries.iter()
            .filter(move |(k, _)| k.as_str().eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Every value of `name`, in order, for rewriting in place.
    pub fn values_mut<'a>(&'a mut self, name: &'a str) -> impl Iterator<Item = &'a mut HeaderValue> + 'a {
        self.entries.iter_mut()
            .filter(move |(k, _)| k.as_str().eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        self.entries.push((name, value));
    }

    /// Replaces every value of `name` with `value`, keeping the position of
    /// the first occurrence.
    pub fn set(&mut self, name: HeaderName, value: HeaderValue) {
        match self.entries.iter().position(|(k, _)| *k == name) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(k, _)| {
                    let keep = index <= first || *k != name;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Appends `name` only when no value is present. Returns whether it did.
    pub fn set_if_absent(&mut self, name: HeaderName, value: HeaderValue) -> bool {
        if self.entries.iter().any(|(k, _)| *k == name) {
            return false;
        }
        self.entries.push((name, value));
        true
    }

    /// Removes every value of `name`. Returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.as_str().eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    pub fn remove_all(&mut self, names: &[&str]) {
        self.entries.retain(|(k, _)| !names.iter().any(|n| k.as_str().eq_ignore_ascii_case(n)));
    }

    /// Folds repeated names into one comma-separated value at the position
    /// of the first occurrence. `set-cookie` is never folded.
    pub fn joined(&self) -> HeaderList {
        let mut out: Vec<(HeaderName, HeaderValue)> = Vec::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            let existing = if *name == SET_COOKIE {
                None
            } else {
                out.iter_mut().find(|(k, _)| k == name)
            };
            let Some((_, merged)) = existing else {
                out.push((name.clone(), value.clone()));
                continue;
            };
            let mut bytes = merged.as_bytes().to_vec();
            bytes.extend_from_slice(b", ");
            bytes.extend_from_slice(value.as_bytes());
            match HeaderValue::from_bytes(&bytes) {
                Ok(v) => *merged = v,
                Err(_) => out.push((name.clone(), value.clone())),
            }
        }
        HeaderList { entries: out }
    }

    pub fn write_to(&self, map: &mut HeaderMap) {
        for (name, value) in &self.entries {
            map.append(name.clone(), value.clone());
        }
    }

    pub fn into_map(self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in self.entries {
            map.append(name, value);
        }
        map
    }
}

impl FromIterator<(HeaderName, HeaderValue)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (HeaderName, HeaderValue)>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

impl IntoIterator for HeaderList {
    type Item = (HeaderName, HeaderValue);
    type IntoIter = std::vec::IntoIter<(HeaderName, HeaderValue)>;

    fn into_iter(self) -> Self::IntoIter { self.entries.into_iter() }
}
