use std::fmt::Write as _;

/// Ordered header list. Insertion order is preserved on the wire; lookups
/// are case-insensitive.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Replaces all fields of `name` with a single one.
    pub fn overwrite(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.push(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn count(&self, name: &str) -> usize {
        self.get_all(name).count()
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Serializes as `Name: value\r\n` lines (no terminating blank line).
    pub fn serialize(&self, out: &mut String) {
        for (name, value) in &self.fields {
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(headers.get("X-Missing"), None);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut headers = Headers::new();
        headers.push("B", "2");
        headers.push("A", "1");
        headers.push("B", "3");
        let order: Vec<_> = headers.iter().collect();
        assert_eq!(order, vec![("B", "2"), ("A", "1"), ("B", "3")]);
        assert_eq!(headers.count("b"), 2);
    }

    #[test]
    fn overwrite_collapses_duplicates() {
        let mut headers = Headers::new();
        headers.push("Connection", "keep-alive");
        headers.push("Connection", "close");
        headers.overwrite("Connection", "close");
        assert_eq!(headers.count("Connection"), 1);
    }
}
