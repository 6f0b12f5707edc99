pub mod loaders;
pub mod record;
pub mod target;

pub use loaders::{load_all_targets, load_target};
pub use record::ExtractedRecord;
pub use target::{
    AuthPlan, ExtractionPolicy, RowPlan, SearchCriteria, SearchPlan, Target,
};
