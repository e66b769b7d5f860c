pub mod error;
pub mod merger;
