pub mod types;
pub mod matcher;
pub mod order;
pub mod normalizer;
