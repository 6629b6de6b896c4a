//! Ordered HTTP header map.
//!
//! Unlike a hash map, [`HeaderMap`] preserves insertion order and duplicate
//! names, which keeps header blocks comparable across a round trip. Names are
//! stored lower-cased; lookups are case-insensitive.
//!
//! Pseudo headers (`:method`, `:path`, `:authority`, `:scheme`, `:status`)
//! live in the same map so HTTP/1.1 and HTTP/2 messages have one shape.

/// Name of the request method pseudo header.
pub const METHOD: &str = ":method";
/// Name of the request target pseudo header.
pub const PATH: &str = ":path";
/// Name of the authority pseudo header (the HTTP/1.1 `Host` header).
pub const AUTHORITY: &str = ":authority";
/// Name of the scheme pseudo header.
pub const SCHEME: &str = ":scheme";
/// Name of the response status pseudo header.
pub const STATUS: &str = ":status";

/// Ordered collection of `(name, value)` header pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create empty headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the first value for `name` (case-insensitive).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over every value for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if at least one value exists for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a header, keeping any existing values with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries
            .push((name.into().to_ascii_lowercase(), value.into()));
    }

    /// Replace every value for `name` with a single value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        match self.entries.iter().position(|(n, _)| *n == name) {
            Some(first) => {
                self.entries[first].1 = value.into();
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= first || *n != name;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value.into())),
        }
    }

    /// Remove every value for `name`. Returns true if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    /// Iterate over all headers as `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Iterate over the regular (non-pseudo) headers.
    pub fn regular(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(n, _)| !n.starts_with(':'))
    }

    /// Parses the `:status` pseudo header, if present and numeric.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.get(STATUS).and_then(|s| s.trim().parse().ok())
    }

    /// Returns the number of header entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (name, value) in iter {
            map.add(name, value);
        }
        map
    }
}

impl<const N: usize> From<[(&str, &str); N]> for HeaderMap {
    fn from(pairs: [(&str, &str); N]) -> Self {
        pairs.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.add("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(headers.iter().next(), Some(("content-type", "text/plain")));
    }

    #[test]
    fn add_keeps_duplicates_in_order() {
        let headers = HeaderMap::from([("x-a", "1"), ("x-b", "2"), ("x-a", "3")]);
        let values: Vec<_> = headers.get_all("x-a").collect();
        assert_eq!(values, vec!["1", "3"]);
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn insert_replaces_all_values_in_place() {
        let mut headers = HeaderMap::from([("x-a", "1"), ("x-b", "2"), ("x-a", "3")]);
        headers.insert("X-A", "9");
        let pairs: Vec<_> = headers.iter().collect();
        assert_eq!(pairs, vec![("x-a", "9"), ("x-b", "2")]);
    }

    #[test]
    fn remove_reports_whether_anything_changed() {
        let mut headers = HeaderMap::from([("x-a", "1")]);
        assert!(headers.remove("X-A"));
        assert!(!headers.remove("x-a"));
        assert!(headers.is_empty());
    }

    #[test]
    fn regular_skips_pseudo_headers() {
        let headers = HeaderMap::from([(":status", "200"), ("server", "fake")]);
        let regular: Vec<_> = headers.regular().collect();
        assert_eq!(regular, vec![("server", "fake")]);
        assert_eq!(headers.status(), Some(200));
    }
}
