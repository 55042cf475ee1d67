pub mod generation;
pub mod knowledge;
pub mod opportunity;
pub mod organization;
pub mod proposal;
pub mod slide;
