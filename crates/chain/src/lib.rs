pub mod decode;
pub mod oracle;
pub mod tracker;
pub mod trie;
pub mod types;
