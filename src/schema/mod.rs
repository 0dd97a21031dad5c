pub mod schema;
pub mod markers;
