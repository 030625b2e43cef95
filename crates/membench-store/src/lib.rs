pub mod layout;
pub mod store;

pub use layout::{comparison_name, create_unique_dir, experiment_name};
pub use store::{
    complete_results, read_evaluation_metrics, read_json, write_json_atomic, write_text_atomic,
    Checkpoint, CompleteResult, RunStore,
};
