//! Pattern the node was last registered with in the exchange.

use crate::codec::decode_raw_string;
use crate::error::StateResult;
use crate::store::Store;
use crate::tables::NODE_EXCH_PATTERN;

impl Store {
    /// The saved pattern; empty when none was saved.
    pub fn find_saved_node_exch_pattern(&self) -> StateResult<String> {
        match self.find_raw(NODE_EXCH_PATTERN, NODE_EXCH_PATTERN)? {
            Some(bytes) => decode_raw_string(NODE_EXCH_PATTERN, NODE_EXCH_PATTERN, &bytes),
            None => Ok(String::new()),
        }
    }

    pub fn save_node_exch_pattern(&self, pattern: &str) -> StateResult<()> {
        self.save_raw(NODE_EXCH_PATTERN, NODE_EXCH_PATTERN, pattern.as_bytes())
    }

    pub fn delete_node_exch_pattern(&self) -> StateResult<()> {
        self.delete_singleton(NODE_EXCH_PATTERN)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.find_saved_node_exch_pattern().unwrap(), "");
        store.save_node_exch_pattern("myorg/netspeed").unwrap();
        store.save_node_exch_pattern("myorg/gps").unwrap();
        assert_eq!(store.find_saved_node_exch_pattern().unwrap(), "myorg/gps");
        store.delete_node_exch_pattern().unwrap();
        store.delete_node_exch_pattern().unwrap();
        assert_eq!(store.find_saved_node_exch_pattern().unwrap(), "");
    }
}
