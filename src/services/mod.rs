pub mod sampling;
pub mod training;
