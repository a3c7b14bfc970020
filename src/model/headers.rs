//! Ordered, case-insensitive header map

/// Header map preserving insertion order with case-insensitive lookup.
///
/// Each name maps to one or more values. The original casing of the first
/// insertion is kept so that recordings serialize the way they were captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    /// Create an empty header map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// All values recorded for `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.position(name).map(|i| self.entries[i].1.as_slice())
    }

    /// First value recorded for `name`
    #[must_use]
    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Mutable access to the values of `name`
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Vec<String>> {
        let index = self.position(name)?;
        Some(&mut self.entries[index].1)
    }

    /// Whether `name` is present
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Replace the values of `name`, keeping its position if already present
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(index) => self.entries[index].1 = values,
            None => self.entries.push((name, values)),
        }
    }

    /// Set `name` to a single value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.insert(name, vec![value.into()]);
    }

    /// Add one value to `name`, creating the header if needed
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(index) => self.entries[index].1.push(value.into()),
            None => self.entries.push((name, vec![value.into()])),
        }
    }

    /// Remove `name`, returning its values
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        let index = self.position(name)?;
        Some(self.entries.remove(index).1)
    }

    /// Keep only headers for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &[String]) -> bool) {
        self.entries.retain(|(name, values)| keep(name, values));
    }

    /// Iterate over `(name, values)` in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Mutable iteration over all value lists
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Vec<String>> {
        self.entries.iter_mut().map(|(_, values)| values)
    }

    /// Number of distinct header names
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Vec<String>)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, values) in iter {
            match headers.position(&name) {
                Some(index) => headers.entries[index].1.extend(values),
                None => headers.entries.push((name, values)),
            }
        }
        headers
    }
}
