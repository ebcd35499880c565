pub mod error;
pub mod limiters;
pub mod similarity;
pub mod text;
pub mod token_estimator;
