use crate::{error::SyncError, types::DEFAULT_NAME_POOL};

/// Deterministic round-robin display names for synthetic participants.
#[derive(Debug, Clone)]
pub struct NameRotation {
    pool: Vec<String>,
    index: usize,
}

impl Default for NameRotation {
    fn default() -> Self {
        Self {
            pool: DEFAULT_NAME_POOL.iter().map(|name| (*name).to_owned()).collect(),
            index: 0,
        }
    }
}

impl NameRotation {
    /// Build a rotation over a fixed, ordered, non-empty pool.
    pub fn new(pool: Vec<String>) -> Result<Self, SyncError> {
        if pool.iter().all(|name| name.trim().is_empty()) {
            return Err(SyncError::validation(
                "empty_name_pool",
                "name pool must contain at least one non-blank name",
            ));
        }
        Ok(Self {
            pool: pool
                .into_iter()
                .map(|name| name.trim().to_owned())
                .filter(|name| !name.is_empty())
                .collect(),
            index: 0,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pool(&self) -> &[String] {
        &self.pool
    }

    /// Name assigned at `index`, without advancing.
    pub fn name_at(&self, index: usize) -> &str {
        &self.pool[index % self.pool.len()]
    }

    /// Return `pool[index mod N]` and advance the index.
    pub fn next_name(&mut self) -> String {
        let name = self.name_at(self.index).to_owned();
        self.index = self.index.wrapping_add(1);
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn sequence_matches_index_mod_pool_size() {
        let names = pool(&["Sue", "Bob", "Alice"]);
        let n = names.len();
        let mut rotation = NameRotation::new(names.clone()).expect("pool is valid");

        let drawn: Vec<String> = (0..2 * n + 3).map(|_| rotation.next_name()).collect();
        let expected: Vec<String> = (0..2 * n + 3).map(|i| names[i % n].clone()).collect();

        assert_eq!(drawn, expected);
        assert_eq!(rotation.index(), 2 * n + 3);
    }

    #[test]
    fn two_rotations_over_same_pool_agree() {
        let mut a = NameRotation::default();
        let mut b = NameRotation::default();
        for _ in 0..12 {
            assert_eq!(a.next_name(), b.next_name());
        }
    }

    #[test]
    fn rejects_blank_pool() {
        let err = NameRotation::new(pool(&["", "  "])).expect_err("blank pool must fail");
        assert_eq!(err.code, "empty_name_pool");
        assert!(NameRotation::new(Vec::new()).is_err());
    }

    #[test]
    fn blank_entries_are_dropped_from_pool() {
        let rotation = NameRotation::new(pool(&["Sue", " ", "Bob "])).expect("pool is valid");
        assert_eq!(rotation.pool(), &["Sue".to_owned(), "Bob".to_owned()]);
        assert_eq!(rotation.name_at(3), "Bob");
    }
}
