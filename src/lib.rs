pub mod ablation;
pub mod config;
pub mod correlation;
pub mod counts;
pub mod dataset;
pub mod errors;
pub mod evaluate;
pub mod mapper;
pub mod matrix;
pub mod metrics;
pub mod model;
pub mod observability;
pub mod resolver;
pub mod stats;
pub mod train;

pub use counts::{expanded_counts, group_counts, ExpandedCounts, GroupCounts};
pub use errors::{MutFeatError, MutFeatResult};
pub use resolver::{FeatureIntervalResolver, Interval, TransformLayout};
