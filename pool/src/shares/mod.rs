/// Share handling: classification and the processing pipeline around it

pub mod processor;
pub mod validator;

pub use processor::ShareProcessor;
pub use validator::{BlockCandidate, ShareOutcome, ShareStatus, ShareValidator};
