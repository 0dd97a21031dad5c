pub mod path;
pub mod scanner;
pub mod download;
pub mod pipeline;
