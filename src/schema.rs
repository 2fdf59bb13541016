//! Key layout for cell presence inside the coordination store.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellSchema {
    root: String,
}

impl CellSchema {
    pub fn new(namespace: &str) -> Self {
        let namespace = namespace.trim().trim_matches('/');
        Self {
            root: format!("/{}/v1/cells", namespace),
        }
    }

    /// Namespace root under which every cell registers.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Root with a trailing separator, used for prefix queries so that sibling
    /// roots such as `cells-old` never match.
    pub fn prefix(&self) -> String {
        format!("{}/", self.root)
    }

    pub fn cell_path(&self, cell_id: &str) -> String {
        format!("{}/{}", self.root, cell_id)
    }
}

/// Final path segment of a key, which is the cell identity.
pub fn cell_id_from_key(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, last)) => last.to_string(),
        None => trimmed.to_string(),
    }
}
