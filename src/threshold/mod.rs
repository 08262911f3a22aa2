//! Threshold checks on stored values

pub mod evaluator;
pub mod range;

pub use evaluator::{Clock, ServiceState, SystemClock, ThresholdAlert, ThresholdEvaluator, evaluate};
pub use range::{RangeError, is_out_of_bounds};
