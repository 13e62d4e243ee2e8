#![warn(clippy::unwrap_used)]

pub mod candidates;
pub mod features;
pub mod model;
pub mod ranker;
pub mod trainer;

pub use candidates::CandidateGenerator;
pub use features::FeatureExtractor;
pub use model::LinearModel;
pub use ranker::{RankedSuspect, Ranker};
pub use trainer::{train, TrainOptions, TrainReport};
